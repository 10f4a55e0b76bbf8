//! The hub: room membership, fan-out and presence.
//!
//! A single task owns all room state and applies commands in arrival order.
//! Everything else talks to it through a cloneable [`HubHandle`].

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::metrics::{names, record_presence_error, set_occupancy};
use crate::persist::{MessageSink, PersistConfig, PersistSnapshot, PersistStats, Persister};
use crate::presence::{PresenceCache, PresenceError};
use crate::room::{Room, RoomId};
use chorus_protocol::Envelope;
use chorus_transport::ConnectionId;
use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub has shut down.
    #[error("Hub is closed")]
    Closed,

    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// The connection id is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// The presence cache rejected the update.
    #[error("Presence update failed: {0}")]
    Presence(#[from] PresenceError),
}

/// Hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Persistence worker pool.
    pub persist: PersistConfig,
}

/// A member of a room, as reported by [`HubHandle::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub connection_id: String,
    pub user_id: String,
    pub state: ConnectionState,
    pub last_heartbeat: i64,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    /// Distinct users with at least one connection.
    pub users: Vec<String>,
    pub members: Vec<MemberSnapshot>,
}

/// Hub statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    /// Number of non-empty rooms.
    pub rooms: usize,
    /// Number of registered connections.
    pub connections: usize,
    /// Number of distinct users.
    pub users: usize,
    /// Envelopes fanned out since start.
    pub broadcasts: u64,
    /// Connections evicted for falling behind.
    pub evictions: u64,
    /// Persistence counters.
    pub persist: PersistSnapshot,
}

enum Command {
    Register {
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        user_id: String,
        room_id: RoomId,
    },
    Broadcast {
        origin: Option<ConnectionId>,
        envelope: Envelope,
    },
    Snapshot {
        room_id: RoomId,
        reply: oneshot::Sender<Option<RoomSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// A pending registration.
pub struct Registration {
    reply: oneshot::Receiver<Result<(), HubError>>,
}

impl Registration {
    /// Wait for the hub to apply the registration.
    ///
    /// # Errors
    ///
    /// Returns the hub's verdict, or [`HubError::Closed`] if it stopped first.
    pub async fn accepted(self) -> Result<(), HubError> {
        self.reply.await.unwrap_or(Err(HubError::Closed))
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl HubHandle {
    fn send(&self, command: Command) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        self.commands.send(command).map_err(|_| HubError::Closed)
    }

    /// Queue a registration and return without waiting for it.
    ///
    /// Commands queued afterwards are applied after the registration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn begin_register(&self, handle: ConnectionHandle) -> Result<Registration, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { handle, reply })?;
        Ok(Registration { reply: rx })
    }

    /// Register a connection and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed, the id is taken, or presence
    /// could not be updated. On error the connection is not a member.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.begin_register(handle)?.accepted().await
    }

    /// Remove a connection. Unknown connections are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn unregister(
        &self,
        id: ConnectionId,
        user_id: impl Into<String>,
        room_id: impl Into<RoomId>,
    ) -> Result<(), HubError> {
        self.send(Command::Unregister {
            id,
            user_id: user_id.into(),
            room_id: room_id.into(),
        })
    }

    /// Fan an envelope out to its room and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(Command::Broadcast {
            origin: None,
            envelope,
        })
    }

    /// Broadcast on behalf of a connection.
    ///
    /// Dropped by the hub unless `origin` is still a member of the room.
    pub(crate) fn publish(&self, origin: ConnectionId, envelope: Envelope) -> Result<(), HubError> {
        self.send(Command::Broadcast {
            origin: Some(origin),
            envelope,
        })
    }

    /// Describe a room, or `None` if it has no members.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn snapshot(&self, room_id: impl Into<RoomId>) -> Result<Option<RoomSnapshot>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            room_id: room_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Get hub statistics.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ask the hub to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The hub task's state.
pub struct Hub {
    /// Rooms indexed by id. Never holds an empty room.
    rooms: HashMap<RoomId, Room>,
    /// Connections per user, with the room each one is in.
    users: HashMap<String, HashMap<ConnectionId, RoomId>>,
    presence: Arc<dyn PresenceCache>,
    persister: Persister,
    persist_stats: Arc<PersistStats>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    broadcasts: u64,
    evictions: u64,
}

impl Hub {
    /// Start a hub task.
    ///
    /// The returned join handle completes once the hub has shut down and the
    /// persistence queue has drained.
    #[must_use]
    pub fn spawn(
        config: HubConfig,
        presence: Arc<dyn PresenceCache>,
        sink: Arc<dyn MessageSink>,
    ) -> (HubHandle, JoinHandle<()>) {
        info!("Creating hub with config: {:?}", config);

        let (tx, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let persister = Persister::spawn(sink, config.persist);

        let hub = Hub {
            rooms: HashMap::new(),
            users: HashMap::new(),
            presence,
            persist_stats: persister.stats(),
            persister,
            commands,
            shutdown: shutdown.clone(),
            broadcasts: 0,
            evictions: 0,
        };
        let task = tokio::spawn(hub.run());

        (
            HubHandle {
                commands: tx,
                shutdown,
            },
            task,
        )
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => break,
                },
            }
        }

        self.commands.close();
        self.close_all().await;

        let Hub { persister, .. } = self;
        persister.shutdown().await;
        info!("Hub stopped");
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::Register { handle, reply } => {
                let result = self.register(handle).await;
                // The requester may have given up.
                let _ = reply.send(result);
            }
            Command::Unregister {
                id,
                user_id,
                room_id,
            } => self.unregister(&id, &user_id, &room_id).await,
            Command::Broadcast { origin, envelope } => {
                if let Some(origin) = origin {
                    if !self.is_member(&origin, &envelope.room_id) {
                        debug!(connection = %origin, room = %envelope.room_id, "Dropping message from connection outside the room");
                        return;
                    }
                }
                self.dispatch(envelope).await;
            }
            Command::Snapshot { room_id, reply } => {
                let _ = reply.send(self.snapshot(&room_id));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn user_in_room(&self, user_id: &str, room_id: &str) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|connections| connections.values().any(|room| room == room_id))
    }

    fn is_member(&self, id: &ConnectionId, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(|room| room.contains(id))
    }

    async fn register(&mut self, handle: ConnectionHandle) -> Result<(), HubError> {
        let id = handle.id().clone();
        let user_id = handle.user_id().to_string();
        let room_id = handle.room_id().to_string();
        let shared = Arc::clone(handle.shared());

        if self.rooms.get(&room_id).is_some_and(|room| room.contains(&id)) {
            return Err(HubError::AlreadyRegistered(id));
        }

        let first_in_room = !self.user_in_room(&user_id, &room_id);

        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                debug!(room = %room_id, "Creating new room");
                Room::new(room_id.clone())
            })
            .insert(handle);
        self.users
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone(), room_id.clone());

        let presence = if first_in_room {
            self.presence.add(&room_id, &user_id).await
        } else {
            self.presence.refresh(&room_id).await
        };
        if let Err(e) = presence {
            error!(room = %room_id, user = %user_id, connection = %id, "Presence update failed, rolling back registration: {}", e);
            record_presence_error(if first_in_room { "add" } else { "refresh" });
            self.detach(&id, &user_id, &room_id);
            return Err(e.into());
        }

        shared.advance(ConnectionState::Registered);
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        self.publish_occupancy();
        info!(room = %room_id, user = %user_id, connection = %id, "Registered connection");

        self.dispatch(Envelope::join(&room_id, &user_id)).await;
        Ok(())
    }

    /// Remove a connection from its room and the user index.
    ///
    /// Returns whether the connection was indexed.
    fn detach(&mut self, id: &ConnectionId, user_id: &str, room_id: &str) -> bool {
        if let Some(room) = self.rooms.get_mut(room_id) {
            drop(room.remove(id));
            if room.is_empty() {
                self.rooms.remove(room_id);
                debug!(room = %room_id, "Deleted empty room");
            }
        }

        let Some(connections) = self.users.get_mut(user_id) else {
            return false;
        };
        let indexed = connections.remove(id).is_some();
        if connections.is_empty() {
            self.users.remove(user_id);
        }
        indexed
    }

    async fn unregister(&mut self, id: &ConnectionId, user_id: &str, room_id: &str) {
        if !self.detach(id, user_id, room_id) {
            trace!(connection = %id, "Unregister for unknown connection");
            return;
        }
        self.publish_occupancy();
        info!(room = %room_id, user = %user_id, connection = %id, "Unregistered connection");

        if let Some(leave) = self.depart(user_id, room_id).await {
            self.dispatch(leave).await;
        }
    }

    /// Clear presence once a user's last connection in a room is gone.
    ///
    /// Returns the leave event to broadcast, if any.
    async fn depart(&mut self, user_id: &str, room_id: &str) -> Option<Envelope> {
        if self.user_in_room(user_id, room_id) {
            return None;
        }
        if let Err(e) = self.presence.remove(room_id, user_id).await {
            error!(room = %room_id, user = %user_id, "Failed to remove presence: {}", e);
            record_presence_error("remove");
        }
        Some(Envelope::leave(room_id, user_id))
    }

    /// Fan an envelope out and persist it.
    ///
    /// Connections dropped during fan-out are removed from the user index
    /// right away, and their leave events are dispatched in turn.
    async fn dispatch(&mut self, envelope: Envelope) {
        let mut pending = VecDeque::from([envelope]);

        while let Some(envelope) = pending.pop_front() {
            let room_id = envelope.room_id.clone();
            let dropped = self.fan_out(envelope);
            if dropped.is_empty() {
                continue;
            }

            for (connection, user) in &dropped {
                if let Some(connections) = self.users.get_mut(user) {
                    connections.remove(connection);
                    if connections.is_empty() {
                        self.users.remove(user);
                    }
                }
            }
            self.publish_occupancy();

            let users: BTreeSet<&str> = dropped.iter().map(|(_, user)| user.as_str()).collect();
            for user in users {
                if let Some(leave) = self.depart(user, &room_id).await {
                    pending.push_back(leave);
                }
            }
        }
    }

    /// Deliver to every member of the envelope's room and queue it for
    /// persistence. Returns the connections removed along the way.
    fn fan_out(&mut self, envelope: Envelope) -> Vec<(ConnectionId, String)> {
        let envelope = Arc::new(envelope);
        self.broadcasts += 1;
        counter!(names::BROADCASTS_TOTAL).increment(1);

        let mut dropped = Vec::new();
        if let Some(room) = self.rooms.get_mut(&envelope.room_id) {
            let report = room.fan_out(&envelope);
            for (connection, user) in &report.evicted {
                warn!(
                    room = %envelope.room_id,
                    connection = %connection,
                    user = %user,
                    "Delivery queue full, evicting slow connection"
                );
            }
            for (connection, _) in &report.closed {
                debug!(room = %envelope.room_id, connection = %connection, "Removed connection with closed queue");
            }
            self.evictions += report.evicted.len() as u64;
            counter!(names::EVICTIONS_TOTAL).increment(report.evicted.len() as u64);

            if room.is_empty() {
                self.rooms.remove(&envelope.room_id);
                debug!(room = %envelope.room_id, "Deleted empty room");
            }
            dropped.extend(report.evicted);
            dropped.extend(report.closed);
        } else {
            trace!(room = %envelope.room_id, "Broadcast to room without members");
        }

        self.persister.submit(envelope);
        dropped
    }

    fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.rooms.get(room_id)?;
        let mut members: Vec<MemberSnapshot> = room
            .members()
            .map(|handle| MemberSnapshot {
                connection_id: handle.id().to_string(),
                user_id: handle.user_id().to_string(),
                state: handle.shared().state(),
                last_heartbeat: handle.shared().last_heartbeat(),
            })
            .collect();
        members.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        let users: BTreeSet<String> = members.iter().map(|m| m.user_id.clone()).collect();
        Some(RoomSnapshot {
            room_id: room_id.to_string(),
            users: users.into_iter().collect(),
            members,
        })
    }

    fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connections: self.rooms.values().map(Room::len).sum(),
            users: self.users.len(),
            broadcasts: self.broadcasts,
            evictions: self.evictions,
            persist: self.persist_stats.snapshot(),
        }
    }

    fn publish_occupancy(&self) {
        set_occupancy(self.rooms.len(), self.rooms.values().map(Room::len).sum());
    }

    /// Drop every member, closing all queues, and clear owned presence.
    async fn close_all(&mut self) {
        let rooms = std::mem::take(&mut self.rooms);
        let connections: usize = rooms.values().map(Room::len).sum();
        drop(rooms);

        let users = std::mem::take(&mut self.users);
        for (user_id, connections) in users {
            let rooms: BTreeSet<RoomId> = connections.into_values().collect();
            for room_id in rooms {
                if let Err(e) = self.presence.remove(&room_id, &user_id).await {
                    warn!(room = %room_id, user = %user_id, "Failed to clear presence on shutdown: {}", e);
                }
            }
        }

        self.publish_occupancy();
        info!(connections, "Hub closed all connections");
    }
}
