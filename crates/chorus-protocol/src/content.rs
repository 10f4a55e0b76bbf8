//! Typed message content.
//!
//! Content is a closed tagged union keyed by the envelope's type tag. Each
//! variant's body is an object whose single key names the variant:
//!
//! ```text
//! {"type":"text",  "content":{"text":"hi"}}
//! {"type":"image", "content":{"image":{"url":"..","name":"..","format":"png","size":1024}}}
//! {"type":"join",  "content":{"join":"user joined the room"}}
//! ```
//!
//! Leaf fields default to empty or zero when absent so that partially filled
//! content can still be extracted; the variant key itself is required.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::envelope::{Category, MessageType};

/// Errors produced while decoding content.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The tag does not belong to a known category.
    #[error("Unclassified message type: {0:?}")]
    Unclassified(String),

    /// The body does not have the shape required by the tag.
    #[error("Malformed {kind} content: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An image or file attachment. Size is in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Media {
    pub url: String,
    pub name: String,
    pub format: String,
    pub size: i64,
}

/// A voice or video attachment. Size is in bytes, duration in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimedMedia {
    pub url: String,
    pub name: String,
    pub format: String,
    pub size: i64,
    pub duration: f64,
}

/// A reply to an earlier message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reply {
    pub text: String,
    pub reply_to: String,
}

/// Content authored by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum UserContent {
    Text {
        #[serde(default)]
        text: String,
    },
    Image {
        image: Media,
    },
    File {
        file: Media,
    },
    Voice {
        voice: TimedMedia,
    },
    Video {
        video: TimedMedia,
    },
    Reply {
        reply: Reply,
    },
}

/// Room lifecycle and server notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum SystemContent {
    Join {
        #[serde(default)]
        join: String,
    },
    Leave {
        #[serde(default)]
        leave: String,
    },
    System {
        #[serde(default)]
        system: String,
    },
}

/// Content of either category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    User(UserContent),
    System(SystemContent),
}

impl Content {
    /// Decode the body of an envelope according to its type tag.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Unclassified`] for tags outside both categories
    /// and [`ContentError::Malformed`] when the variant key is missing or a
    /// field has the wrong JSON type.
    pub fn decode(kind: &MessageType, body: &Value) -> Result<Self, ContentError> {
        let tagged = json!({ "type": kind.as_str(), "content": body });
        let malformed = |source| ContentError::Malformed {
            kind: kind.to_string(),
            source,
        };

        match kind.category() {
            Some(Category::User) => serde_json::from_value(tagged)
                .map(Content::User)
                .map_err(malformed),
            Some(Category::System) => serde_json::from_value(tagged)
                .map(Content::System)
                .map_err(malformed),
            None => Err(ContentError::Unclassified(kind.to_string())),
        }
    }

    /// The category of this content.
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Content::User(_) => Category::User,
            Content::System(_) => Category::System,
        }
    }

    /// The variant body as it appears in the envelope's `content` field.
    #[must_use]
    pub fn body(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut tagged)) => tagged.remove("content").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}
