//! Per-connection state shared between the pumps and the hub.

use chorus_protocol::{now_millis, Envelope};
use chorus_transport::ConnectionId;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle of a connection.
///
/// States only move forward:
/// `Admitted → Registered → Active → Unregistering → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Admitted = 0,
    Registered = 1,
    Active = 2,
    Unregistering = 3,
    Closed = 4,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Admitted,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Active,
            3 => ConnectionState::Unregistering,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared by a connection's pumps and its hub handle.
#[derive(Debug)]
pub struct ConnectionShared {
    id: ConnectionId,
    state: AtomicU8,
    last_heartbeat: Mutex<i64>,
    transport_closed: CancellationToken,
}

impl ConnectionShared {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Admitted as u8),
            last_heartbeat: Mutex::new(now_millis()),
            transport_closed: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the connection is already past it.
    pub fn advance(&self, next: ConnectionState) {
        let previous = ConnectionState::from(self.state.fetch_max(next as u8, Ordering::SeqCst));
        if previous < next {
            debug!(connection = %self.id, from = ?previous, to = ?next, "Connection state changed");
        }
    }

    /// Record a heartbeat acknowledgment.
    pub fn touch(&self) {
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = now_millis();
    }

    /// Time of the last heartbeat acknowledgment, in UTC milliseconds.
    #[must_use]
    pub fn last_heartbeat(&self) -> i64 {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Token cancelled once the write half of the transport is gone.
    #[must_use]
    pub fn transport_closed(&self) -> &CancellationToken {
        &self.transport_closed
    }
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued.
    Delivered,
    /// Queue at capacity.
    Full,
    /// Consumer has gone away.
    Closed,
}

/// The hub's reference to a connection.
///
/// Owns the only sender of the connection's delivery queue, so dropping the
/// handle closes the queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: String,
    room_id: String,
    queue: mpsc::Sender<Arc<Envelope>>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its delivery queue.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        user_id: impl Into<String>,
        room_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Envelope>>) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            shared: Arc::new(ConnectionShared::new(id.clone())),
            id,
            user_id: user_id.into(),
            room_id: room_id.into(),
            queue,
        };
        (handle, receiver)
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// Try to enqueue without waiting.
    pub fn try_deliver(&self, envelope: &Arc<Envelope>) -> Delivery {
        match self.queue.try_send(Arc::clone(envelope)) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        let (handle, _rx) = ConnectionHandle::new("c1".into(), "alice", "r1", 4);
        let shared = handle.shared();

        assert_eq!(shared.state(), ConnectionState::Admitted);
        shared.advance(ConnectionState::Active);
        shared.advance(ConnectionState::Registered);
        assert_eq!(shared.state(), ConnectionState::Active);
        shared.advance(ConnectionState::Closed);
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_try_deliver_reports_full_and_closed() {
        let (handle, rx) = ConnectionHandle::new("c1".into(), "alice", "r1", 1);
        let envelope = Arc::new(Envelope::text("hi"));

        assert_eq!(handle.try_deliver(&envelope), Delivery::Delivered);
        assert_eq!(handle.try_deliver(&envelope), Delivery::Full);

        drop(rx);
        assert_eq!(handle.try_deliver(&envelope), Delivery::Closed);
    }

    #[test]
    fn test_touch_updates_heartbeat() {
        let (handle, _rx) = ConnectionHandle::new("c1".into(), "alice", "r1", 1);
        let before = handle.shared().last_heartbeat();
        handle.shared().touch();
        assert!(handle.shared().last_heartbeat() >= before);
    }
}
