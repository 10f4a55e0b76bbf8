//! Room abstraction for Chorus.
//!
//! Rooms are named sets of connections that share message scope.

use crate::connection::{ConnectionHandle, Delivery};
use chorus_protocol::Envelope;
use chorus_transport::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if id.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    // Check for valid ASCII printable characters
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Outcome of fanning one envelope out to a room.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Connections the envelope was enqueued to.
    pub delivered: usize,
    /// Connections removed because their queue was full, with their user.
    pub evicted: Vec<(ConnectionId, String)>,
    /// Connections removed because their consumer had already gone, with their user.
    pub closed: Vec<(ConnectionId, String)>,
}

/// A set of connections sharing a room.
#[derive(Debug)]
pub struct Room {
    /// Room id.
    id: RoomId,
    /// Members indexed by connection id.
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
        }
    }

    /// Get the room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the number of member connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a member.
    ///
    /// Returns `false` (and keeps the existing member) if the id is taken.
    pub fn insert(&mut self, handle: ConnectionHandle) -> bool {
        if self.members.contains_key(handle.id()) {
            return false;
        }
        debug!(room = %self.id, connection = %handle.id(), user = %handle.user_id(), "Connection joined room");
        self.members.insert(handle.id().clone(), handle);
        true
    }

    /// Remove a member. Dropping the returned handle closes its queue.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.members.remove(connection_id);
        if removed.is_some() {
            debug!(room = %self.id, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Iterate over members.
    pub fn members(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.members.values()
    }

    /// Enqueue an envelope to every member without waiting.
    ///
    /// Members whose queue is full or closed are removed from the room,
    /// which closes their queue.
    pub fn fan_out(&mut self, envelope: &Arc<Envelope>) -> FanOut {
        let mut report = FanOut::default();

        self.members
            .retain(|id, handle| match handle.try_deliver(envelope) {
                Delivery::Delivered => {
                    report.delivered += 1;
                    true
                }
                Delivery::Full => {
                    report.evicted.push((id.clone(), handle.user_id().to_string()));
                    false
                }
                Delivery::Closed => {
                    report.closed.push((id.clone(), handle.user_id().to_string()));
                    false
                }
            });

        trace!(room = %self.id, recipients = report.delivered, "Fanned out envelope");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_creation() {
        let room = Room::new("lobby");
        assert_eq!(room.id(), "lobby");
        assert_eq!(room.len(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_insert_remove() {
        let mut room = Room::new("lobby");

        let (h1, _rx1) = ConnectionHandle::new("c1".into(), "alice", "lobby", 4);
        let (h2, _rx2) = ConnectionHandle::new("c2".into(), "bob", "lobby", 4);
        assert!(room.insert(h1));
        assert!(room.insert(h2));
        assert_eq!(room.len(), 2);

        let (dup, _rx3) = ConnectionHandle::new("c1".into(), "mallory", "lobby", 4);
        assert!(!room.insert(dup));
        assert_eq!(room.len(), 2);

        assert!(room.remove(&"c1".into()).is_some());
        assert!(!room.contains(&"c1".into()));
        assert!(room.remove(&"c1".into()).is_none());
    }

    #[test]
    fn test_remove_closes_queue() {
        let mut room = Room::new("lobby");
        let (handle, mut rx) = ConnectionHandle::new("c1".into(), "alice", "lobby", 4);
        room.insert(handle);

        drop(room.remove(&"c1".into()));
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("valid:room").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$system").is_err());
        assert!(validate_room_id("bad\nroom").is_err());

        let long_id = "a".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_id).is_err());
    }

    #[test]
    fn test_fan_out_evicts_full_and_closed() {
        let mut room = Room::new("lobby");
        let (fast, mut fast_rx) = ConnectionHandle::new("fast".into(), "alice", "lobby", 8);
        let (slow, _slow_rx) = ConnectionHandle::new("slow".into(), "bob", "lobby", 1);
        let (gone, gone_rx) = ConnectionHandle::new("gone".into(), "carol", "lobby", 8);
        room.insert(fast);
        room.insert(slow);
        room.insert(gone);
        drop(gone_rx);

        let first = room.fan_out(&Arc::new(Envelope::text("one")));
        assert_eq!(first.delivered, 2);
        assert_eq!(first.closed, vec![(ConnectionId::from("gone"), "carol".to_string())]);

        let second = room.fan_out(&Arc::new(Envelope::text("two")));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, vec![(ConnectionId::from("slow"), "bob".to_string())]);

        assert_eq!(room.len(), 1);
        assert_eq!(fast_rx.try_recv().unwrap().content["text"], "one");
        assert_eq!(fast_rx.try_recv().unwrap().content["text"], "two");
    }
}
