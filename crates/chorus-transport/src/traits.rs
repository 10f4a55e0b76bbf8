//! Transport abstraction traits for Chorus.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the hub and connection pumps to be transport-agnostic.
//!
//! A [`Connection`] is an already-established duplex session. The pumps split
//! it into a [`FrameSource`] (read half) and a [`FrameSink`] (write half) that
//! are driven by two independent tasks.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Disambiguates ids generated within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", timestamp.wrapping_add(counter)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Heartbeat request.
    Ping(Bytes),
    /// Heartbeat acknowledgment.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl WireFrame {
    /// The payload of a data frame, `None` for control frames.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            WireFrame::Text(text) => Some(text.as_bytes()),
            WireFrame::Binary(data) => Some(data),
            _ => None,
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Frame exceeds the configured size limit.
    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the stream ended without a close handshake.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// The write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An established duplex connection.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_wire_frame_data() {
        assert_eq!(WireFrame::Text("hi".into()).data(), Some(&b"hi"[..]));
        assert_eq!(WireFrame::Binary(Bytes::from_static(b"\x01")).data(), Some(&[1u8][..]));
        assert_eq!(WireFrame::Ping(Bytes::new()).data(), None);
        assert_eq!(WireFrame::Close.data(), None);
    }
}
