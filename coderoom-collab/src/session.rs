//! Sync protocol engine.
//!
//! ```text
//! connect() ──► UNJOINED ──JOIN──► JOINED(room) ──disconnect()──► GONE
//!                  │                   │
//!                  └── other actions   ├── CODE_CHANGE ─► room minus sender
//!                      are ignored     ├── SYNC_CODE ───► one target
//!                                      └── PING ────────► sender
//! ```
//!
//! Registry, presence, outbound queues and per-connection state sit behind a
//! single lock. Every mutation and the fan-out it triggers happen inside one
//! critical section, so member lists in JOINED/DISCONNECTED always match the
//! registry, and every member of a room sees that room's frames in the same
//! order the engine handled the actions.

use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

use crate::broadcast::{BroadcastStats, Broadcaster, Frame};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientAction, ConnId, MemberInfo, RoomKey, ServerEvent};
use crate::registry::RoomRegistry;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Outbound frames buffered per connection
    pub broadcast_capacity: usize,
    /// Keep the last edit per room and serve it to newcomers directly.
    ///
    /// Off by default: newcomers then rely on peers answering with SYNC_CODE,
    /// which may replay stale content. Turning this on changes what a
    /// newcomer sees first.
    pub authoritative_buffer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            authoritative_buffer: false,
        }
    }
}

/// Where a connection is in its lifecycle. GONE connections are forgotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joined(RoomKey),
}

/// What the engine did with an inbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Handled; the value is how many frames were queued.
    Delivered(usize),
    /// Dropped: unknown connection or action not valid in its state.
    Ignored,
}

/// Last full-buffer edit seen in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomBuffer {
    code: String,
    lang: Option<String>,
}

struct EngineState {
    registry: RoomRegistry,
    presence: PresenceTracker,
    broadcaster: Broadcaster,
    sessions: HashMap<ConnId, SessionState>,
    buffers: HashMap<RoomKey, RoomBuffer>,
}

/// The room synchronization core, independent of any live transport.
pub struct SyncEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        let state = EngineState {
            registry: RoomRegistry::new(),
            presence: PresenceTracker::new(),
            broadcaster: Broadcaster::new(config.broadcast_capacity),
            sessions: HashMap::new(),
            buffers: HashMap::new(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit a new transport connection in the UNJOINED state.
    ///
    /// Returns its identity and the queue its writer must drain.
    pub async fn connect(&self) -> (ConnId, mpsc::Receiver<Frame>) {
        let conn_id = ConnId::generate();
        let mut state = self.state.lock().await;
        let rx = state.broadcaster.register(conn_id);
        state.sessions.insert(conn_id, SessionState::Unjoined);
        log::debug!("Connection {conn_id} registered");
        (conn_id, rx)
    }

    /// Apply one inbound action from `conn_id`.
    pub async fn handle(&self, conn_id: ConnId, action: ClientAction) -> ActionOutcome {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get(&conn_id).cloned() else {
            log::debug!("Ignoring {} from unknown connection {conn_id}", action.kind());
            return ActionOutcome::Ignored;
        };

        match (action, session) {
            (ClientAction::Join { room_key, name }, SessionState::Unjoined) => {
                self.join(&mut state, conn_id, room_key, name)
            }

            (ClientAction::CodeChange { room_key, code, lang }, SessionState::Joined(joined)) => {
                if !room_key.is_empty() && room_key != joined {
                    log::debug!(
                        "Connection {conn_id} sent code for {room_key:?} while in {joined:?}; using joined room"
                    );
                }
                if self.config.authoritative_buffer {
                    state.buffers.insert(
                        joined.clone(),
                        RoomBuffer {
                            code: code.clone(),
                            lang: lang.clone(),
                        },
                    );
                }
                let event = ServerEvent::CodeChange { code, lang };
                let sent = state
                    .broadcaster
                    .send_to_room_except(&state.registry, &joined, conn_id, &event);
                log::trace!("Code change from {conn_id} fanned out to {sent} peers in {joined:?}");
                ActionOutcome::Delivered(sent)
            }

            (ClientAction::SyncCode { target_conn_id, code }, SessionState::Joined(joined)) => {
                if target_conn_id == conn_id || !state.registry.contains(&joined, target_conn_id) {
                    log::debug!(
                        "Ignoring sync from {conn_id} to {target_conn_id}: target not a peer in {joined:?}"
                    );
                    return ActionOutcome::Ignored;
                }
                let event = ServerEvent::CodeChange { code, lang: None };
                let sent = state.broadcaster.send_to(target_conn_id, &event);
                ActionOutcome::Delivered(usize::from(sent))
            }

            (ClientAction::Ping, _) => {
                let sent = state.broadcaster.send_to(conn_id, &ServerEvent::Pong);
                ActionOutcome::Delivered(usize::from(sent))
            }

            (action, session) => {
                log::debug!(
                    "Ignoring {} from {conn_id} in state {session:?}",
                    action.kind()
                );
                ActionOutcome::Ignored
            }
        }
    }

    /// Tear down a connection after its transport closed.
    ///
    /// Runs at most once per connection; later calls are no-ops. Returns the
    /// number of DISCONNECTED frames queued.
    pub async fn disconnect(&self, conn_id: ConnId) -> usize {
        let mut state = self.state.lock().await;
        if state.sessions.remove(&conn_id).is_none() {
            return 0;
        }
        state.broadcaster.unregister(conn_id);

        let rooms = state.registry.leave_all(conn_id);
        let name = state
            .presence
            .get_name(conn_id)
            .unwrap_or_default()
            .to_string();

        let mut sent = 0;
        for room_key in &rooms {
            let event = ServerEvent::Disconnected {
                conn_id,
                name: name.clone(),
            };
            sent += state.broadcaster.send_to_room(&state.registry, room_key, &event);

            if state.registry.members(room_key).is_empty() {
                state.buffers.remove(room_key);
            }
            log::info!("{name} ({conn_id}) left room {room_key:?}");
        }

        state.presence.remove(conn_id);
        log::debug!("Connection {conn_id} gone");
        sent
    }

    /// Member list of a room, decorated with display names.
    pub async fn members(&self, room_key: &str) -> Vec<MemberInfo> {
        let state = self.state.lock().await;
        let members = state.registry.members(room_key);
        state.presence.member_infos(&members)
    }

    /// Lifecycle state of a connection; `None` once it is gone.
    pub async fn session_state(&self, conn_id: ConnId) -> Option<SessionState> {
        self.state.lock().await.sessions.get(&conn_id).cloned()
    }

    pub async fn display_name(&self, conn_id: ConnId) -> Option<String> {
        let state = self.state.lock().await;
        state.presence.get_name(conn_id).map(str::to_string)
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.registry.room_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().await.broadcaster.stats()
    }

    fn join(
        &self,
        state: &mut EngineState,
        conn_id: ConnId,
        room_key: RoomKey,
        name: String,
    ) -> ActionOutcome {
        state.presence.set_name(conn_id, name.clone());
        state.registry.join(&room_key, conn_id);
        state
            .sessions
            .insert(conn_id, SessionState::Joined(room_key.clone()));

        let members = state.registry.members(&room_key);
        let event = ServerEvent::Joined {
            members: state.presence.member_infos(&members),
            name: name.clone(),
            conn_id,
        };
        let mut sent = state.broadcaster.send_to_room(&state.registry, &room_key, &event);

        if self.config.authoritative_buffer {
            if let Some(buffer) = state.buffers.get(&room_key) {
                let seed = ServerEvent::CodeChange {
                    code: buffer.code.clone(),
                    lang: buffer.lang.clone(),
                };
                sent += usize::from(state.broadcaster.send_to(conn_id, &seed));
            }
        }

        log::info!(
            "{name} ({conn_id}) joined room {room_key:?} ({} members)",
            members.len()
        );
        ActionOutcome::Delivered(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(room: &str, name: &str) -> ClientAction {
        ClientAction::Join {
            room_key: room.into(),
            name: name.into(),
        }
    }

    fn edit(room: &str, code: &str) -> ClientAction {
        ClientAction::CodeChange {
            room_key: room.into(),
            code: code.into(),
            lang: Some("python".into()),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(ServerEvent::decode(&frame).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_connect_starts_unjoined() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx) = engine.connect().await;
        assert_eq!(engine.session_state(a).await, Some(SessionState::Unjoined));
        assert_eq!(engine.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_notifies_everyone_including_sender() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;

        assert_eq!(engine.handle(a, join("r1", "Alice")).await, ActionOutcome::Delivered(1));
        assert_eq!(engine.handle(b, join("r1", "Bob")).await, ActionOutcome::Delivered(2));

        let expected = ServerEvent::Joined {
            members: vec![
                MemberInfo { conn_id: a, name: "Alice".into() },
                MemberInfo { conn_id: b, name: "Bob".into() },
            ],
            name: "Bob".into(),
            conn_id: b,
        };
        let a_events = drain(&mut rx_a);
        assert_eq!(a_events.len(), 2);
        assert_eq!(a_events[1], expected);
        assert_eq!(drain(&mut rx_b), vec![expected]);
        assert_eq!(engine.session_state(b).await, Some(SessionState::Joined("r1".into())));
    }

    #[tokio::test]
    async fn test_code_change_never_echoes() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(b, join("r1", "Bob")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(engine.handle(a, edit("r1", "x = 1")).await, ActionOutcome::Delivered(1));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::CodeChange {
                code: "x = 1".into(),
                lang: Some("python".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_code_change_uses_joined_room() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;
        let (c, mut rx_c) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(b, join("r1", "Bob")).await;
        engine.handle(c, join("r2", "Carol")).await;
        drain(&mut rx_b);
        drain(&mut rx_c);

        // Claims r2 but is only a member of r1.
        engine.handle(a, edit("r2", "spoof")).await;
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_actions_before_join_are_ignored() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        let (b, _rx_b) = engine.connect().await;
        engine.handle(b, join("r1", "Bob")).await;

        assert_eq!(engine.handle(a, edit("r1", "early")).await, ActionOutcome::Ignored);
        let sync = ClientAction::SyncCode {
            target_conn_id: b,
            code: "early".into(),
        };
        assert_eq!(engine.handle(a, sync).await, ActionOutcome::Ignored);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(engine.session_state(a).await, Some(SessionState::Unjoined));
    }

    #[tokio::test]
    async fn test_second_join_is_ignored() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;

        assert_eq!(engine.handle(a, join("r2", "Alice")).await, ActionOutcome::Ignored);
        assert_eq!(engine.members("r1").await.len(), 1);
        assert!(engine.members("r2").await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_code_reaches_only_target() {
        let engine = SyncEngine::with_defaults();
        let mut conns = Vec::new();
        for name in ["A", "B", "C", "D"] {
            let (id, rx) = engine.connect().await;
            engine.handle(id, join("r1", name)).await;
            conns.push((id, rx));
        }
        for (_, rx) in conns.iter_mut() {
            drain(rx);
        }

        let target = conns[3].0;
        let sync = ClientAction::SyncCode {
            target_conn_id: target,
            code: "seed".into(),
        };
        assert_eq!(engine.handle(conns[0].0, sync).await, ActionOutcome::Delivered(1));

        for (id, rx) in conns.iter_mut() {
            let events = drain(rx);
            if *id == target {
                assert_eq!(
                    events,
                    vec![ServerEvent::CodeChange {
                        code: "seed".into(),
                        lang: None,
                    }]
                );
            } else {
                assert!(events.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_sync_code_outside_room_is_ignored() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(b, join("r2", "Bob")).await;
        drain(&mut rx_b);

        let sync = ClientAction::SyncCode {
            target_conn_id: b,
            code: "leak".into(),
        };
        assert_eq!(engine.handle(a, sync).await, ActionOutcome::Ignored);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_sync_code_to_self_is_ignored() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        drain(&mut rx_a);

        let sync = ClientAction::SyncCode {
            target_conn_id: a,
            code: "echo".into(),
        };
        assert_eq!(engine.handle(a, sync).await, ActionOutcome::Ignored);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_once() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        let (b, _rx_b) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(b, join("r1", "Bob")).await;
        drain(&mut rx_a);

        assert_eq!(engine.disconnect(b).await, 1);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::Disconnected {
                conn_id: b,
                name: "Bob".into(),
            }]
        );

        // Idempotent.
        assert_eq!(engine.disconnect(b).await, 0);
        assert!(drain(&mut rx_a).is_empty());

        assert_eq!(engine.session_state(b).await, None);
        assert_eq!(engine.display_name(b).await, None);
        let members = engine.members("r1").await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].conn_id, a);
    }

    #[tokio::test]
    async fn test_disconnect_unjoined_is_silent() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;
        engine.handle(b, join("r1", "Bob")).await;
        drain(&mut rx_b);

        assert_eq!(engine.disconnect(a).await, 0);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(engine.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_member_leaving_drops_room() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        assert_eq!(engine.room_count().await, 1);

        assert_eq!(engine.disconnect(a).await, 0);
        assert_eq!(engine.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_ping_answers_sender() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx) = engine.connect().await;
        assert_eq!(engine.handle(a, ClientAction::Ping).await, ActionOutcome::Delivered(1));
        assert_eq!(drain(&mut rx), vec![ServerEvent::Pong]);
    }

    #[tokio::test]
    async fn test_unknown_connection_ignored() {
        let engine = SyncEngine::with_defaults();
        let outcome = engine.handle(ConnId::generate(), join("r1", "Ghost")).await;
        assert_eq!(outcome, ActionOutcome::Ignored);
        assert_eq!(engine.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_peer_replay_is_default() {
        let engine = SyncEngine::with_defaults();
        let (a, _rx_a) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(a, edit("r1", "print(1)")).await;

        let (c, mut rx_c) = engine.connect().await;
        engine.handle(c, join("r1", "Carol")).await;
        let events = drain(&mut rx_c);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "joined");
    }

    #[tokio::test]
    async fn test_authoritative_buffer_seeds_newcomer() {
        let engine = SyncEngine::new(EngineConfig {
            authoritative_buffer: true,
            ..EngineConfig::default()
        });
        let (a, _rx_a) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(a, edit("r1", "print(1)")).await;
        engine.handle(a, edit("r1", "print(2)")).await;

        let (c, mut rx_c) = engine.connect().await;
        assert_eq!(engine.handle(c, join("r1", "Carol")).await, ActionOutcome::Delivered(3));
        let events = drain(&mut rx_c);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "joined");
        assert_eq!(
            events[1],
            ServerEvent::CodeChange {
                code: "print(2)".into(),
                lang: Some("python".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_authoritative_buffer_dropped_with_room() {
        let engine = SyncEngine::new(EngineConfig {
            authoritative_buffer: true,
            ..EngineConfig::default()
        });
        let (a, _rx_a) = engine.connect().await;
        engine.handle(a, join("r1", "Alice")).await;
        engine.handle(a, edit("r1", "old")).await;
        engine.disconnect(a).await;

        let (b, mut rx_b) = engine.connect().await;
        engine.handle(b, join("r1", "Bob")).await;
        let events = drain(&mut rx_b);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "joined");
    }

    #[tokio::test]
    async fn test_room_order_is_shared_by_all_members() {
        let engine = SyncEngine::with_defaults();
        let (a, mut rx_a) = engine.connect().await;
        let (b, mut rx_b) = engine.connect().await;
        let (c, mut rx_c) = engine.connect().await;
        for (id, name) in [(a, "A"), (b, "B"), (c, "C")] {
            engine.handle(id, join("r1", name)).await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        engine.handle(a, edit("r1", "a1")).await;
        engine.handle(b, edit("r1", "b1")).await;
        engine.handle(a, edit("r1", "a2")).await;

        let codes = |events: Vec<ServerEvent>| -> Vec<String> {
            events
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::CodeChange { code, .. } => Some(code),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(codes(drain(&mut rx_c)), vec!["a1", "b1", "a2"]);
        assert_eq!(codes(drain(&mut rx_a)), vec!["b1"]);
        assert_eq!(codes(drain(&mut rx_b)), vec!["a1", "a2"]);
    }
}
