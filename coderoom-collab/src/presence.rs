//! Presence tracking: connection identity → display name.
//!
//! Names are chosen by the client at join time, untrusted, and not unique
//! within a room. Entries outlive the registry membership just long enough
//! for the disconnect notification to be built.

use std::collections::HashMap;

use crate::protocol::{ConnId, MemberInfo};

/// Display names of joined connections.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    names: HashMap<ConnId, String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite the display name for a connection.
    pub fn set_name(&mut self, conn_id: ConnId, name: impl Into<String>) {
        self.names.insert(conn_id, name.into());
    }

    pub fn get_name(&self, conn_id: ConnId) -> Option<&str> {
        self.names.get(&conn_id).map(String::as_str)
    }

    /// Forget a connection, returning its name if it was known.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<String> {
        self.names.remove(&conn_id)
    }

    /// Decorate a member list with display names.
    ///
    /// Every room member has a presence entry, so the empty-name fallback
    /// only shows up if that pairing was broken.
    pub fn member_infos(&self, members: &[ConnId]) -> Vec<MemberInfo> {
        members
            .iter()
            .map(|conn_id| MemberInfo {
                conn_id: *conn_id,
                name: self.get_name(*conn_id).unwrap_or_default().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
