//! # chorus-protocol
//!
//! Wire protocol definitions for the Chorus room messaging engine.
//!
//! This crate defines the JSON envelope exchanged between peers and the hub,
//! the closed set of message types, the typed content unions and the codec.
//!
//! ## Message Types
//!
//! - User content: `text`, `image`, `file`, `voice`, `video`, `reply`
//! - System content: `join`, `leave`, `system`
//! - Anything else is delivered as-is but never persisted
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::text("Hello, room!").with_origin("lobby", "alice");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.room_id, "lobby");
//! ```

pub mod codec;
pub mod content;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use content::{Content, ContentError, Media, Reply, SystemContent, TimedMedia, UserContent};
pub use envelope::{now_millis, Category, Envelope, MessageType, JOIN_TEXT, LEAVE_TEXT};
