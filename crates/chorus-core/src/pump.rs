//! Connection pumps.
//!
//! Each admitted connection runs two tasks. The inbound pump reads frames,
//! decodes them into envelopes and hands them to the hub. The outbound pump
//! drains the connection's delivery queue to the transport and keeps the peer
//! alive with pings.

use crate::connection::{ConnectionHandle, ConnectionShared, ConnectionState};
use crate::hub::{HubError, HubHandle};
use crate::metrics::{names, record_message};
use crate::room::validate_room_id;
use bytes::{Bytes, BytesMut};
use chorus_protocol::{codec, Envelope};
use chorus_transport::{Connection, ConnectionId, FrameSink, FrameSource, WireFrame};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Pump timing and sizing.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long the peer may stay silent before the connection is dropped.
    /// Only pongs extend it.
    pub read_timeout: Duration,
    /// Bound on a single write.
    pub write_timeout: Duration,
    /// Delivery queue capacity.
    pub queue_capacity: usize,
    /// Most envelopes coalesced into one frame.
    pub max_batch: usize,
    /// No further envelopes are added once a frame reaches this many bytes.
    /// The first envelope of a frame is always sent.
    pub max_batch_bytes: usize,
    /// Largest accepted inbound payload.
    pub max_message_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            max_batch: 256,
            max_batch_bytes: 64 * 1024,
            max_message_size: 64 * 1024,
        }
    }
}

/// A running connection.
pub struct PumpHandle {
    id: ConnectionId,
    shared: Arc<ConnectionShared>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Wait until both pumps have exited. Returns the final state.
    pub async fn closed(self) -> ConnectionState {
        if let Err(e) = self.task.await {
            warn!(connection = %self.id, "Connection supervisor failed: {}", e);
        }
        self.shared.state()
    }
}

/// Admit a connection to a room.
///
/// Registration is queued before either pump starts, so everything the
/// connection sends is applied after it joins.
///
/// # Errors
///
/// Returns an error if the room id is invalid, the hub is closed, or the hub
/// rejected the registration. The connection is closed in every error case.
pub async fn admit(
    hub: &HubHandle,
    connection: Box<dyn Connection>,
    user_id: impl Into<String>,
    room_id: impl Into<String>,
    config: &PumpConfig,
) -> Result<PumpHandle, HubError> {
    let user_id = user_id.into();
    let room_id = room_id.into();
    validate_room_id(&room_id).map_err(HubError::InvalidRoom)?;

    let id = connection.id().clone();
    let remote = connection.remote_addr();
    let (handle, queue) =
        ConnectionHandle::new(id.clone(), user_id.clone(), room_id.clone(), config.queue_capacity);
    let shared = Arc::clone(handle.shared());

    let registration = hub.begin_register(handle)?;
    debug!(connection = %id, user = %user_id, room = %room_id, remote = ?remote, "Admitting connection");

    let (source, sink) = connection.split();
    let inbound = tokio::spawn(run_inbound(
        source,
        hub.clone(),
        Arc::clone(&shared),
        Origin {
            id: id.clone(),
            user_id: user_id.clone(),
            room_id: room_id.clone(),
        },
        config.clone(),
    ));
    let abort_inbound = inbound.abort_handle();
    let outbound = tokio::spawn(run_outbound(sink, queue, Arc::clone(&shared), config.clone()));

    let supervised = Arc::clone(&shared);
    let supervisor_id = id.clone();
    let task = tokio::spawn(async move {
        let _ = inbound.await;
        let _ = outbound.await;
        supervised.advance(ConnectionState::Closed);
        debug!(connection = %supervisor_id, "Connection closed");
    });

    match registration.accepted().await {
        Ok(()) => {
            shared.advance(ConnectionState::Active);
            info!(connection = %id, user = %user_id, room = %room_id, "Connection active");
            Ok(PumpHandle { id, shared, task })
        }
        Err(e) => {
            // The hub dropped the queue; the outbound pump closes the transport.
            abort_inbound.abort();
            warn!(connection = %id, user = %user_id, room = %room_id, "Registration failed: {}", e);
            Err(e)
        }
    }
}

struct Origin {
    id: ConnectionId,
    user_id: String,
    room_id: String,
}

async fn run_inbound(
    mut source: Box<dyn FrameSource>,
    hub: HubHandle,
    shared: Arc<ConnectionShared>,
    origin: Origin,
    config: PumpConfig,
) {
    let mut deadline = Instant::now() + config.read_timeout;

    loop {
        let received = tokio::select! {
            () = shared.transport_closed().cancelled() => {
                debug!(connection = %origin.id, "Write side closed");
                break;
            }
            received = tokio::time::timeout_at(deadline, source.recv()) => received,
        };

        let frame = match received {
            Err(_) => {
                warn!(connection = %origin.id, user = %origin.user_id, room = %origin.room_id, "Heartbeat timeout");
                counter!(names::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                break;
            }
            Ok(Err(e)) => {
                debug!(connection = %origin.id, "Read failed: {}", e);
                break;
            }
            Ok(Ok(None | Some(WireFrame::Close))) => {
                debug!(connection = %origin.id, "Peer closed connection");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
        };

        if let WireFrame::Pong(_) = frame {
            deadline = Instant::now() + config.read_timeout;
            shared.touch();
            trace!(connection = %origin.id, "Heartbeat acknowledged");
            continue;
        }
        let Some(data) = frame.data() else {
            continue;
        };

        if data.len() > config.max_message_size {
            warn!(connection = %origin.id, size = data.len(), max = config.max_message_size, "Message too large");
            break;
        }
        record_message(data.len(), "inbound");

        let (mut envelope, degraded) = codec::decode_lenient(data);
        if degraded {
            debug!(connection = %origin.id, "Undecodable payload delivered as text");
            counter!(names::DEGRADED_PAYLOADS_TOTAL).increment(1);
        }
        envelope.assign_origin(&origin.room_id, &origin.user_id);

        if hub.publish(origin.id.clone(), envelope).is_err() {
            debug!(connection = %origin.id, "Hub closed");
            break;
        }
    }

    shared.advance(ConnectionState::Unregistering);
    if hub
        .unregister(origin.id.clone(), origin.user_id, origin.room_id)
        .is_err()
    {
        trace!(connection = %origin.id, "Hub closed before unregister");
    }
}

async fn run_outbound(
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<Arc<Envelope>>,
    shared: Arc<ConnectionShared>,
    config: PumpConfig,
) {
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A due ping goes first so a busy queue cannot push it past the
        // peer's read deadline.
        let frame = tokio::select! {
            biased;
            _ = heartbeat.tick() => WireFrame::Ping(Bytes::new()),
            next = queue.recv() => match next {
                Some(first) => match encode_batch(first, &mut queue, config.max_batch, config.max_batch_bytes) {
                    Some(text) => {
                        record_message(text.len(), "outbound");
                        WireFrame::Text(text)
                    }
                    None => continue,
                },
                None => {
                    debug!("Delivery queue closed");
                    let _ = timeout(config.write_timeout, sink.close()).await;
                    break;
                }
            },
        };

        match timeout(config.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Write timed out");
                break;
            }
        }
    }

    shared.transport_closed().cancel();
}

/// Encode `first` and whatever is already queued behind it into one
/// newline-separated frame, up to `max_batch` envelopes or `max_bytes`.
fn encode_batch(
    first: Arc<Envelope>,
    queue: &mut mpsc::Receiver<Arc<Envelope>>,
    max_batch: usize,
    max_bytes: usize,
) -> Option<String> {
    let mut buf = BytesMut::new();
    let mut next = Some(first);
    let mut taken = 0;

    while let Some(envelope) = next.take() {
        if let Err(e) = codec::encode_into(&envelope, &mut buf) {
            warn!(room = %envelope.room_id, kind = %envelope.kind, "Dropping envelope that failed to encode: {}", e);
        }
        taken += 1;
        if taken < max_batch && buf.len() < max_bytes {
            next = queue.try_recv().ok();
        }
    }

    if buf.is_empty() {
        return None;
    }
    String::from_utf8(buf.to_vec()).ok()
}
