//! The message envelope exchanged between peers and the hub.
//!
//! Every message on the wire, in both directions, is an [`Envelope`]. The
//! `content` field is kept as raw JSON so fan-out echoes exactly what the
//! sender produced; typed access goes through [`crate::Content`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Descriptive text carried by join events.
pub const JOIN_TEXT: &str = "user joined the room";

/// Descriptive text carried by leave events.
pub const LEAVE_TEXT: &str = "user left the room";

/// Current UTC time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Message category, used to pick the persistence destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Content authored by a participant.
    User,
    /// Room lifecycle and server notices.
    System,
}

/// Message type tag.
///
/// Known tags map to a closed set of variants; any other tag (for example
/// `typing` or `receipt`) is preserved as [`MessageType::Other`] so it can
/// still be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Text,
    Image,
    File,
    Voice,
    Video,
    Reply,
    Join,
    Leave,
    System,
    Other(String),
}

impl MessageType {
    /// The wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Voice => "voice",
            MessageType::Video => "video",
            MessageType::Reply => "reply",
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::System => "system",
            MessageType::Other(tag) => tag,
        }
    }

    /// The category of this tag, or `None` for unclassified tags.
    #[must_use]
    pub fn category(&self) -> Option<Category> {
        match self {
            MessageType::Text
            | MessageType::Image
            | MessageType::File
            | MessageType::Voice
            | MessageType::Video
            | MessageType::Reply => Some(Category::User),
            MessageType::Join | MessageType::Leave | MessageType::System => Some(Category::System),
            MessageType::Other(_) => None,
        }
    }

    /// Whether the tag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Other(String::new())
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "text" => MessageType::Text,
            "image" => MessageType::Image,
            "file" => MessageType::File,
            "voice" => MessageType::Voice,
            "video" => MessageType::Video,
            "reply" => MessageType::Reply,
            "join" => MessageType::Join,
            "leave" => MessageType::Leave,
            "system" => MessageType::System,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match MessageType::from(tag.as_str()) {
            MessageType::Other(_) => MessageType::Other(tag),
            known => known,
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> String {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message envelope.
///
/// Missing fields decode to their zero values. `room_id`, `sender_id` and
/// `created_at` coming from a peer are never trusted: the inbound pump
/// overwrites them through [`Envelope::assign_origin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag.
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// Target room.
    #[serde(default)]
    pub room_id: String,
    /// Sending user.
    #[serde(default)]
    pub sender_id: String,
    /// Variant body, keyed by variant name.
    #[serde(default)]
    pub content: Value,
    /// Creation time in UTC milliseconds.
    #[serde(default)]
    pub created_at: i64,
}

impl Envelope {
    /// Create an envelope with no origin assigned.
    #[must_use]
    pub fn new(kind: impl Into<MessageType>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            room_id: String::new(),
            sender_id: String::new(),
            content,
            created_at: 0,
        }
    }

    /// Create a plain-text envelope.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, json!({ "text": text.into() }))
    }

    /// Create a join event for `user_id` in `room_id`.
    #[must_use]
    pub fn join(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(MessageType::Join, json!({ "join": JOIN_TEXT }))
            .with_origin(room_id, user_id)
    }

    /// Create a leave event for `user_id` in `room_id`.
    #[must_use]
    pub fn leave(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(MessageType::Leave, json!({ "leave": LEAVE_TEXT }))
            .with_origin(room_id, user_id)
    }

    /// Stamp the envelope with server-known room, sender and time.
    pub fn assign_origin(&mut self, room_id: &str, sender_id: &str) {
        self.room_id = room_id.to_string();
        self.sender_id = sender_id.to_string();
        self.created_at = now_millis();
    }

    /// Builder form of [`Envelope::assign_origin`].
    #[must_use]
    pub fn with_origin(mut self, room_id: impl Into<String>, sender_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self.sender_id = sender_id.into();
        self.created_at = now_millis();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from("image"), MessageType::Image);
        assert_eq!(MessageType::from("typing"), MessageType::Other("typing".into()));
        assert_eq!(String::from(MessageType::Reply), "reply");
        assert_eq!(MessageType::Other("receipt".into()).to_string(), "receipt");
    }

    #[test]
    fn test_message_type_category() {
        assert_eq!(MessageType::Voice.category(), Some(Category::User));
        assert_eq!(MessageType::Leave.category(), Some(Category::System));
        assert_eq!(MessageType::from("typing").category(), None);
        assert!(MessageType::default().is_empty());
    }

    #[test]
    fn test_envelope_missing_fields_default() {
        let env: Envelope = serde_json::from_str(r#"{"content":{"text":"hi"}}"#).unwrap();
        assert!(env.kind.is_empty());
        assert!(env.room_id.is_empty());
        assert_eq!(env.created_at, 0);
    }

    #[test]
    fn test_assign_origin_overwrites_peer_values() {
        let mut env: Envelope = serde_json::from_str(
            r#"{"type":"text","room_id":"other","sender_id":"mallory","created_at":1,"content":{"text":"hi"}}"#,
        )
        .unwrap();
        env.assign_origin("r1", "alice");

        assert_eq!(env.room_id, "r1");
        assert_eq!(env.sender_id, "alice");
        assert!(env.created_at > 1);
    }

    #[test]
    fn test_join_leave_constructors() {
        let join = Envelope::join("r1", "alice");
        assert_eq!(join.kind, MessageType::Join);
        assert_eq!(join.content["join"], JOIN_TEXT);
        assert_eq!(join.sender_id, "alice");

        let leave = Envelope::leave("r1", "alice");
        assert_eq!(leave.content["leave"], LEAVE_TEXT);
        assert!(leave.created_at > 0);
    }
}
