//! Room registry: which connection is in which room.
//!
//! Plain data structure with no interior locking. The session engine owns it
//! behind its own lock so membership and presence change together.

use std::collections::HashMap;

use crate::protocol::{ConnId, RoomKey};

/// Room key → members (in join order), plus the reverse index.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomKey, Vec<ConnId>>,
    membership: HashMap<ConnId, RoomKey>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn_id` to `room_key`, creating the room if absent.
    ///
    /// Joining the same room twice is a no-op. Joining a different room moves
    /// the connection, so it is never a member of two rooms at once.
    /// Returns `true` if the member set changed.
    pub fn join(&mut self, room_key: &str, conn_id: ConnId) -> bool {
        if let Some(current) = self.membership.get(&conn_id) {
            if current == room_key {
                return false;
            }
            self.leave_all(conn_id);
        }

        self.rooms
            .entry(room_key.to_string())
            .or_default()
            .push(conn_id);
        self.membership.insert(conn_id, room_key.to_string());
        true
    }

    /// Current members of a room in join order; empty for unknown rooms.
    pub fn members(&self, room_key: &str) -> Vec<ConnId> {
        self.rooms.get(room_key).cloned().unwrap_or_default()
    }

    /// Remove `conn_id` from every room, returning the keys it left.
    ///
    /// Rooms left without members are dropped.
    pub fn leave_all(&mut self, conn_id: ConnId) -> Vec<RoomKey> {
        let Some(room_key) = self.membership.remove(&conn_id) else {
            return Vec::new();
        };

        if let Some(members) = self.rooms.get_mut(&room_key) {
            members.retain(|id| *id != conn_id);
            if members.is_empty() {
                self.rooms.remove(&room_key);
                log::debug!("Room {room_key:?} dropped (empty)");
            }
        }
        vec![room_key]
    }

    /// The room a connection currently belongs to.
    pub fn room_of(&self, conn_id: ConnId) -> Option<&str> {
        self.membership.get(&conn_id).map(String::as_str)
    }

    pub fn contains(&self, room_key: &str, conn_id: ConnId) -> bool {
        self.room_of(conn_id) == Some(room_key)
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
