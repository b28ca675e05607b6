//! Fan-out of server events to connections.
//!
//! Every connection owns a bounded outbound queue. Events are encoded once
//! and the shared frame is pushed into each recipient's queue with
//! `try_send`, so a slow or vanished peer never stalls the sender.
//! Delivery is best effort: a full or closed queue drops the frame and
//! bumps `messages_dropped`.
//!
//! Room fan-out takes the registry by reference and reads the member list at
//! send time, so a member who left a moment ago is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{ConnId, ServerEvent};
use crate::registry::RoomRegistry;

/// A pre-encoded JSON frame shared by all recipients.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Delivery counters, updated without taking any lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Outbound queues of every live connection.
pub struct Broadcaster {
    peers: HashMap<ConnId, mpsc::Sender<Frame>>,
    /// Frames buffered per connection before drops start
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl Broadcaster {
    /// Create a broadcaster whose per-connection queues hold `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Open an outbound queue for a connection.
    ///
    /// The returned receiver is drained by the connection's writer task.
    pub fn register(&mut self, conn_id: ConnId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.insert(conn_id, tx);
        rx
    }

    /// Close a connection's queue. Frames already queued are still readable.
    pub fn unregister(&mut self, conn_id: ConnId) -> bool {
        self.peers.remove(&conn_id).is_some()
    }

    /// Deliver to a single connection. Returns whether the frame was queued.
    pub fn send_to(&self, conn_id: ConnId, event: &ServerEvent) -> bool {
        match Self::encode(event) {
            Some(frame) => self.push(conn_id, frame),
            None => false,
        }
    }

    /// Deliver to every current member of `room_key` except `excluded`.
    pub fn send_to_room_except(
        &self,
        registry: &RoomRegistry,
        room_key: &str,
        excluded: ConnId,
        event: &ServerEvent,
    ) -> usize {
        let recipients: Vec<ConnId> = registry
            .members(room_key)
            .into_iter()
            .filter(|id| *id != excluded)
            .collect();
        self.fan_out(&recipients, event)
    }

    /// Deliver to every current member of `room_key`, sender included.
    pub fn send_to_room(&self, registry: &RoomRegistry, room_key: &str, event: &ServerEvent) -> usize {
        self.fan_out(&registry.members(room_key), event)
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.peers.len(),
        }
    }

    fn fan_out(&self, recipients: &[ConnId], event: &ServerEvent) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let Some(frame) = Self::encode(event) else {
            return 0;
        };
        recipients
            .iter()
            .filter(|id| self.push(**id, frame.clone()))
            .count()
    }

    fn encode(event: &ServerEvent) -> Option<Frame> {
        match event.encode() {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", event.kind());
                None
            }
        }
    }

    fn push(&self, conn_id: ConnId, frame: Frame) -> bool {
        let Some(tx) = self.peers.get(&conn_id) else {
            self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping frame for unknown connection {conn_id}");
            return false;
        };

        match tx.try_send(frame) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for {conn_id}, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbound queue closed for {conn_id}, dropping frame");
                false
            }
        }
    }
}
