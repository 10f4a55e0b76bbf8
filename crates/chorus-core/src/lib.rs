//! # chorus-core
//!
//! Room hub and connection lifecycle for the Chorus chat server.
//!
//! - **Hub** - Single task owning room membership, fan-out and presence
//! - **Pump** - Per-connection inbound and outbound loops
//! - **Presence** - Online users per room, in Redis or in memory
//! - **Persist** - Bounded worker pool writing validated messages to a sink
//! - **Validate** - Content extraction and field checks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌─────────────┐  fan-out  ┌─────────────┐
//! │ Inbound pump│──────────▶│     Hub     │──────────▶│ Delivery    │
//! └─────────────┘           └─────────────┘           │ queues      │
//!                             │         │             └──────┬──────┘
//!                             ▼         ▼                    ▼
//!                      ┌──────────┐ ┌──────────┐     ┌─────────────┐
//!                      │ Presence │ │ Persister│     │Outbound pump│
//!                      └──────────┘ └──────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod metrics;
pub mod persist;
pub mod presence;
pub mod pump;
pub mod room;
pub mod validate;

pub use connection::{ConnectionHandle, ConnectionShared, ConnectionState, Delivery};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats, MemberSnapshot, RoomSnapshot};
pub use persist::{
    Collection, JsonlSink, MemorySink, MessageSink, PersistConfig, PersistError, PersistSnapshot,
    PersistStats, Persister, StoredMessage,
};
pub use presence::{presence_key, MemoryPresence, PresenceCache, PresenceConfig, PresenceError};
#[cfg(feature = "redis")]
pub use presence::RedisPresence;
pub use pump::{admit, PumpConfig, PumpHandle};
pub use room::{validate_room_id, Room, RoomId};
pub use validate::{validate, Validation, ValidationError};
