//! Message validation.
//!
//! Validation classifies an envelope by its type, extracts the typed content,
//! and checks the required fields. A failed check never blocks delivery; it
//! only marks the stored record.

use chorus_protocol::{Content, ContentError, Envelope, Media, SystemContent, TimedMedia, UserContent};
use thiserror::Error;

/// Reasons an envelope fails validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Room id is empty")]
    MissingRoom,

    #[error("Sender id is empty")]
    MissingSender,

    #[error("Creation time is missing")]
    MissingTimestamp,

    #[error("Message type is empty")]
    MissingType,

    #[error("Unclassified message type: {0}")]
    Unclassified(String),

    #[error("Malformed {kind} content: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("Field `{field}` of {kind} content is empty")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Field `{field}` of {kind} content must be positive")]
    NotPositive {
        kind: &'static str,
        field: &'static str,
    },
}

impl From<ContentError> for ValidationError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Unclassified(kind) => ValidationError::Unclassified(kind),
            ContentError::Malformed { kind, source } => ValidationError::Malformed {
                kind,
                reason: source.to_string(),
            },
        }
    }
}

/// Outcome of validating one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Typed content, when it could be extracted.
    pub content: Option<Content>,
    /// First failed check, if any.
    pub error: Option<ValidationError>,
}

impl Validation {
    /// Whether every check passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Validate an envelope.
///
/// The content is returned whenever extraction succeeded, even if a later
/// field check failed.
#[must_use]
pub fn validate(envelope: &Envelope) -> Validation {
    if let Err(error) = check_envelope(envelope) {
        return Validation {
            content: None,
            error: Some(error),
        };
    }

    let content = match Content::decode(&envelope.kind, &envelope.content) {
        Ok(content) => content,
        Err(err) => {
            return Validation {
                content: None,
                error: Some(err.into()),
            }
        }
    };

    let error = check_content(&content).err();
    Validation {
        content: Some(content),
        error,
    }
}

fn check_envelope(envelope: &Envelope) -> Result<(), ValidationError> {
    if envelope.room_id.is_empty() {
        return Err(ValidationError::MissingRoom);
    }
    if envelope.sender_id.is_empty() {
        return Err(ValidationError::MissingSender);
    }
    if envelope.created_at == 0 {
        return Err(ValidationError::MissingTimestamp);
    }
    if envelope.kind.is_empty() {
        return Err(ValidationError::MissingType);
    }
    Ok(())
}

fn check_content(content: &Content) -> Result<(), ValidationError> {
    match content {
        Content::User(UserContent::Text { text }) => require("text", "text", text),
        Content::User(UserContent::Image { image }) => check_media("image", image),
        Content::User(UserContent::File { file }) => check_media("file", file),
        Content::User(UserContent::Voice { voice }) => check_timed_media("voice", voice),
        Content::User(UserContent::Video { video }) => check_timed_media("video", video),
        Content::User(UserContent::Reply { reply }) => {
            require("reply", "text", &reply.text)?;
            require("reply", "reply_to", &reply.reply_to)
        }
        Content::System(SystemContent::Join { join }) => require("join", "join", join),
        Content::System(SystemContent::Leave { leave }) => require("leave", "leave", leave),
        Content::System(SystemContent::System { system }) => require("system", "system", system),
    }
}

fn check_media(kind: &'static str, media: &Media) -> Result<(), ValidationError> {
    require(kind, "url", &media.url)?;
    require(kind, "name", &media.name)?;
    require(kind, "format", &media.format)?;
    if media.size <= 0 {
        return Err(ValidationError::NotPositive { kind, field: "size" });
    }
    Ok(())
}

fn check_timed_media(kind: &'static str, media: &TimedMedia) -> Result<(), ValidationError> {
    require(kind, "url", &media.url)?;
    require(kind, "name", &media.name)?;
    require(kind, "format", &media.format)?;
    if media.size <= 0 {
        return Err(ValidationError::NotPositive { kind, field: "size" });
    }
    if media.duration <= 0.0 {
        return Err(ValidationError::NotPositive {
            kind,
            field: "duration",
        });
    }
    Ok(())
}

fn require(kind: &'static str, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::EmptyField { kind, field })
    } else {
        Ok(())
    }
}
