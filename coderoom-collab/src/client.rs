//! WebSocket sync client for joining a room on the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Full-buffer edits sent to the room, remote edits applied last-writer-wins
//! - Peer replay: when someone else joins, answer with our buffer via SYNC_CODE
//! - Member list tracking from JOINED/DISCONNECTED notifications
//!
//! Server frames are always applied to the client state. `SyncEvent`s are a
//! best-effort side channel: they are dropped while no receiver has been
//! taken or when the application falls behind.

use std::sync::{Arc, Mutex, PoisonError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientAction, ConnId, MemberInfo, ProtocolError, RoomKey, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established and JOIN sent
    Connected,
    /// Someone joined the room (possibly us)
    Joined {
        conn_id: ConnId,
        name: String,
        members: Vec<MemberInfo>,
        is_self: bool,
    },
    /// Buffer replaced by a remote edit or sync replay
    RemoteCode { code: String, lang: Option<String> },
    /// A member's connection closed
    PeerLeft { conn_id: ConnId, name: String },
    /// Answer to `send_ping`
    Pong,
    /// Connection lost
    Disconnected,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Local copy of the shared buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LocalBuffer {
    /// `None` until we edit or receive something
    code: Option<String>,
    lang: Option<String>,
}

/// Events buffered for the application before new ones are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared with the reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    conn_id: RwLock<Option<ConnId>>,
    members: RwLock<Vec<MemberInfo>>,
    buffer: RwLock<LocalBuffer>,
    /// Set once the application takes the event receiver
    events: Mutex<Option<mpsc::Sender<SyncEvent>>>,
    auto_sync: bool,
}

impl Shared {
    /// Hand an event to the application without ever waiting on it.
    fn emit(&self, event: SyncEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = events.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::debug!("Event channel full, dropping {event:?}"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// The sync client.
pub struct SyncClient {
    name: String,
    room_key: RoomKey,
    server_url: String,

    shared: Arc<Shared>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx_taken: bool,
}

impl SyncClient {
    /// Create a client that will join `room_key` as `name`.
    pub fn new(name: impl Into<String>, room_key: impl Into<RoomKey>, server_url: impl Into<String>) -> Self {
        Self::with_auto_sync(name, room_key, server_url, true)
    }

    /// Like [`SyncClient::new`], choosing whether to answer newcomers with
    /// our buffer automatically.
    pub fn with_auto_sync(
        name: impl Into<String>,
        room_key: impl Into<RoomKey>,
        server_url: impl Into<String>,
        auto_sync: bool,
    ) -> Self {
        Self {
            name: name.into(),
            room_key: room_key.into(),
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                conn_id: RwLock::new(None),
                members: RwLock::new(Vec::new()),
                buffer: RwLock::new(LocalBuffer::default()),
                events: Mutex::new(None),
                auto_sync,
            }),
            outgoing_tx: None,
            event_rx_taken: false,
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Events raised before this call are not replayed.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        if self.event_rx_taken {
            return None;
        }
        self.event_rx_taken = true;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.shared.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Some(rx)
    }

    /// Connect to the server and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.shared.state.write().await = ConnectionState::Connecting;
        // A new connection gets a new identity from the server.
        *self.shared.conn_id.write().await = None;
        self.shared.members.write().await.clear();

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::warn!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: apply server events and forward them to the app
        let shared = self.shared.clone();
        // Weak, so dropping `outgoing_tx` still ends the writer task.
        let reply_tx = out_tx.downgrade();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if let Some(out) = apply_event(&shared, &reply_tx, event).await {
                                shared.emit(out);
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }
            *shared.state.write().await = ConnectionState::Disconnected;
            shared.emit(SyncEvent::Disconnected);
        });

        self.outgoing_tx = Some(out_tx);
        *self.shared.state.write().await = ConnectionState::Connected;
        // Emitted before JOIN goes out so it always precedes our own Joined.
        self.shared.emit(SyncEvent::Connected);
        log::info!("{} connected to {} (room {:?})", self.name, self.server_url, self.room_key);

        self.send(ClientAction::Join {
            room_key: self.room_key.clone(),
            name: self.name.clone(),
        })
        .await
    }

    /// Replace the shared buffer and broadcast it to the room.
    pub async fn send_code_change(&self, code: impl Into<String>, lang: Option<String>) -> Result<(), ClientError> {
        let code = code.into();
        {
            let mut buffer = self.shared.buffer.write().await;
            buffer.code = Some(code.clone());
            if lang.is_some() {
                buffer.lang = lang.clone();
            }
        }
        self.send(ClientAction::CodeChange {
            room_key: self.room_key.clone(),
            code,
            lang,
        })
        .await
    }

    /// Send `code` to exactly one connection.
    pub async fn send_sync_code(&self, target_conn_id: ConnId, code: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientAction::SyncCode {
            target_conn_id,
            code: code.into(),
        })
        .await
    }

    /// Send application-level ping.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(ClientAction::Ping).await
    }

    /// Close the connection. The server then tells the room we left.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Identity the server assigned, known once our own JOINED arrived.
    pub async fn conn_id(&self) -> Option<ConnId> {
        *self.shared.conn_id.read().await
    }

    /// Room members as of the last JOINED/DISCONNECTED.
    pub async fn members(&self) -> Vec<MemberInfo> {
        self.shared.members.read().await.clone()
    }

    /// Current local buffer, if anything was edited or received.
    pub async fn code(&self) -> Option<String> {
        self.shared.buffer.read().await.code.clone()
    }

    pub async fn lang(&self) -> Option<String> {
        self.shared.buffer.read().await.lang.clone()
    }

    pub fn room_key(&self) -> &str {
        &self.room_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, action: ClientAction) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(action.encode()?)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Fold one server event into the shared state, returning what to emit.
async fn apply_event(
    shared: &Shared,
    reply_tx: &mpsc::WeakSender<String>,
    event: ServerEvent,
) -> Option<SyncEvent> {
    match event {
        ServerEvent::Joined { members, name, conn_id } => {
            // The first JOINED after our JOIN is our own: we are not a
            // member of any room before it.
            let is_self = {
                let mut own = shared.conn_id.write().await;
                match *own {
                    Some(id) => id == conn_id,
                    None => {
                        *own = Some(conn_id);
                        true
                    }
                }
            };
            *shared.members.write().await = members.clone();

            if !is_self && shared.auto_sync {
                let code = shared.buffer.read().await.code.clone();
                if let Some(code) = code {
                    let reply = ClientAction::SyncCode {
                        target_conn_id: conn_id,
                        code,
                    };
                    match (reply.encode(), reply_tx.upgrade()) {
                        (Ok(text), Some(tx)) => {
                            let _ = tx.send(text).await;
                        }
                        (Ok(_), None) => log::debug!("Not answering {conn_id}: connection closing"),
                        (Err(e), _) => log::error!("Failed to encode sync reply: {e}"),
                    }
                }
            }

            Some(SyncEvent::Joined {
                conn_id,
                name,
                members,
                is_self,
            })
        }

        ServerEvent::CodeChange { code, lang } => {
            {
                let mut buffer = shared.buffer.write().await;
                buffer.code = Some(code.clone());
                if lang.is_some() {
                    buffer.lang = lang.clone();
                }
            }
            Some(SyncEvent::RemoteCode { code, lang })
        }

        ServerEvent::Disconnected { conn_id, name } => {
            shared.members.write().await.retain(|m| m.conn_id != conn_id);
            Some(SyncEvent::PeerLeft { conn_id, name })
        }

        ServerEvent::Pong => Some(SyncEvent::Pong),
    }
}
