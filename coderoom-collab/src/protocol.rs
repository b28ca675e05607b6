//! JSON wire protocol for room synchronization.
//!
//! Every frame is a single JSON object tagged by its `action` field:
//! ```text
//! client → server   join | code_change | sync_code | ping
//! server → client   joined | code_change | disconnected | pong
//! ```
//!
//! Text frames are the expected carrier, so browser clients can speak the
//! protocol without a codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque room key supplied by clients. Never validated by the core.
pub type RoomKey = String;

/// Process-unique identity of one live connection.
///
/// Assigned when the transport connection is accepted and meaningless after
/// it closes; a reconnecting client always gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(Uuid);

impl ConnId {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One entry of a room's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub conn_id: ConnId,
    pub name: String,
}

/// Actions a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    /// Enter a room under a display name.
    Join { room_key: RoomKey, name: String },

    /// Full-buffer edit, relayed to every other member of the sender's room.
    CodeChange {
        /// Informational only; the sender's joined room is authoritative.
        #[serde(default)]
        room_key: RoomKey,
        code: String,
        /// Editor language/mode so receivers can switch highlighting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
    },

    /// Point-to-point buffer replay for a newly joined member.
    SyncCode { target_conn_id: ConnId, code: String },

    /// Application-level heartbeat.
    Ping,
}

impl ClientAction {
    /// Short action name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CodeChange { .. } => "code_change",
            Self::SyncCode { .. } => "sync_code",
            Self::Ping => "ping",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Notifications the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Someone joined; carries the full member list after the join.
    Joined {
        members: Vec<MemberInfo>,
        name: String,
        conn_id: ConnId,
    },

    /// Another member's buffer (or a sync replay).
    CodeChange {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
    },

    /// A member's transport closed.
    Disconnected { conn_id: ConnId, name: String },

    Pong,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::CodeChange { .. } => "code_change",
            Self::Disconnected { .. } => "disconnected",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Binary frame is not valid UTF-8")]
    InvalidUtf8,
}
