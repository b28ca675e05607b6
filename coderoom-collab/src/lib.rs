//! # coderoom-collab — Room synchronization core for collaborative code editing
//!
//! Participants join a room by key and share one text buffer. Every edit is a
//! full-buffer replacement relayed to the rest of the room (last writer wins);
//! newcomers are seeded by an existing member replaying its buffer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │     JSON frames     │  └─ SyncEngine (one lock)    │
//! └─────────────┘                     │      ├─ RoomRegistry         │
//!                                     │      ├─ PresenceTracker      │
//!                                     │      └─ Broadcaster (fan-out)│
//!                                     └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (client actions, server events)
//! - [`registry`] — room key → members
//! - [`presence`] — connection → display name
//! - [`broadcast`] — per-connection outbound queues and fan-out
//! - [`session`] — the protocol engine tying the above together
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with peer replay
//! - [`execution`] — interface to the external code-execution sandbox

pub mod protocol;
pub mod registry;
pub mod presence;
pub mod broadcast;
pub mod session;
pub mod server;
pub mod client;
pub mod execution;

// Re-exports for convenience
pub use protocol::{ClientAction, ConnId, MemberInfo, ProtocolError, RoomKey, ServerEvent};
pub use registry::RoomRegistry;
pub use presence::PresenceTracker;
pub use broadcast::{BroadcastStats, Broadcaster, Frame};
pub use session::{ActionOutcome, EngineConfig, SessionState, SyncEngine};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use execution::{CodeExecutor, ExecutionError, ExecutionRequest, ExecutionResult, Language};
