//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► outbound queue A ──► Client A
//!             ├── SyncEngine (lock) ─┼──► outbound queue B ──► Client B
//! Client B ──┘   registry/presence   └──► outbound queue C ──► Client C
//! ```
//!
//! One task per connection selects between inbound WebSocket frames, its
//! outbound queue, and a heartbeat timer. A peer that sends nothing (not even
//! a Pong) for two heartbeat intervals is dropped. Whatever ends the loop the
//! engine's disconnect path runs exactly once.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Frame;
use crate::protocol::{ClientAction, ConnId, ProtocolError};
use crate::session::{EngineConfig, SyncEngine};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Serve the last edit to newcomers from the server (see `EngineConfig`)
    pub authoritative_buffer: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            authoritative_buffer: false,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from process environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `CODEROOM_BIND_ADDR` | `bind_addr` |
    /// | `PORT` | `bind_addr = 0.0.0.0:$PORT` when no bind address is given |
    /// | `CODEROOM_BROADCAST_CAPACITY` | `broadcast_capacity` |
    /// | `CODEROOM_HEARTBEAT_SECS` | `heartbeat_interval_secs` |
    /// | `CODEROOM_AUTHORITATIVE_BUFFER` | `authoritative_buffer` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with a custom variable source.
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = match (lookup("CODEROOM_BIND_ADDR"), lookup("PORT")) {
            (Some(addr), _) if !addr.trim().is_empty() => addr.trim().to_string(),
            (_, Some(port)) => match port.trim().parse::<u16>() {
                Ok(port) => format!("0.0.0.0:{port}"),
                Err(_) => {
                    log::warn!("Ignoring invalid PORT={port:?}");
                    defaults.bind_addr.clone()
                }
            },
            _ => defaults.bind_addr.clone(),
        };

        Self {
            bind_addr,
            broadcast_capacity: parse_or(
                &lookup,
                "CODEROOM_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            ),
            heartbeat_interval_secs: parse_or(
                &lookup,
                "CODEROOM_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            ),
            authoritative_buffer: match lookup("CODEROOM_AUTHORITATIVE_BUFFER") {
                Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                    log::warn!("Ignoring invalid CODEROOM_AUTHORITATIVE_BUFFER={raw:?}");
                    defaults.authoritative_buffer
                }),
                None => defaults.authoritative_buffer,
            },
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            broadcast_capacity: self.broadcast_capacity,
            authoritative_buffer: self.authoritative_buffer,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={raw:?}");
            default
        }),
        None => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Server errors. None of these are fatal to other connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let engine = Arc::new(SyncEngine::new(config.engine_config()));
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (conn_id, outbound) = self.engine.connect().await;
        log::info!("WebSocket connection {conn_id} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.pump(ws_stream, conn_id, outbound, addr).await;

        // Cleanup runs whatever ended the loop.
        let notified = self.engine.disconnect(conn_id).await;
        log::info!("Connection {conn_id} from {addr} closed ({notified} peers notified)");
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        conn_id: ConnId,
        mut outbound: mpsc::Receiver<Frame>,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        // Any inbound frame, Pong included, proves the peer is alive.
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    if let Some(Ok(_)) = msg {
                        last_seen = Instant::now();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(conn_id, Ok(text.as_str()), addr).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let text = std::str::from_utf8(&data).map_err(|_| ProtocolError::InvalidUtf8);
                            self.dispatch(conn_id, text, addr).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Close from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frame queued by the engine
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= period * 2 {
                        log::info!("Connection {conn_id} from {addr} silent for {:?}, dropping", last_seen.elapsed());
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Decode one inbound frame and hand it to the engine.
    ///
    /// Malformed frames are dropped; the connection stays open.
    async fn dispatch(
        &self,
        conn_id: ConnId,
        text: Result<&str, ProtocolError>,
        addr: SocketAddr,
    ) {
        let len = text.as_ref().map_or(0, |t| t.len());
        let action = text.and_then(ClientAction::decode);

        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += len as u64;
            if action.is_err() {
                s.malformed_messages += 1;
            }
        }

        match action {
            Ok(action) => {
                let kind = action.kind();
                let outcome = self.engine.handle(conn_id, action).await;
                log::trace!("{kind} from {conn_id}: {outcome:?}");
            }
            Err(e) => {
                log::warn!("Failed to decode message from {addr}: {e}");
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let broadcast = self.engine.broadcast_stats().await;
        stats.active_rooms = self.engine.room_count().await;
        stats.messages_sent = broadcast.messages_sent;
        stats.messages_dropped = broadcast.messages_dropped;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The engine behind this server, for inspection.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}
