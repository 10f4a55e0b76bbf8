//! In-process transport.
//!
//! [`pair`] returns a server-side [`Connection`] and the [`MemoryPeer`] that
//! plays the remote end. Used by tests and benchmarks to drive the hub without
//! sockets.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError, WireFrame};

/// Create a connected in-memory pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    let (to_server, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_server) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: from_peer,
        outbound: to_peer,
    };
    let peer = MemoryPeer {
        to_server: Some(to_server),
        from_server,
    };
    (connection, peer)
}

/// Server side of an in-memory pair.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<WireFrame>,
    outbound: mpsc::UnboundedSender<WireFrame>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let this = *self;
        (
            Box::new(MemorySource { rx: this.inbound }),
            Box::new(MemorySink {
                tx: this.outbound,
                closed: false,
            }),
        )
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<WireFrame>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone.
        let _ = self.tx.send(WireFrame::Close);
        Ok(())
    }
}

/// Remote end of an in-memory pair.
pub struct MemoryPeer {
    to_server: Option<mpsc::UnboundedSender<WireFrame>>,
    from_server: mpsc::UnboundedReceiver<WireFrame>,
}

impl MemoryPeer {
    /// Send a frame to the server. Returns `false` once disconnected.
    pub fn send(&self, frame: WireFrame) -> bool {
        self.to_server
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Send a text frame to the server.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireFrame::Text(text.into()))
    }

    /// Acknowledge a heartbeat.
    pub fn pong(&self) -> bool {
        self.send(WireFrame::Pong(Bytes::new()))
    }

    /// Receive the next frame from the server.
    ///
    /// Returns `None` once the server side has been dropped.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.from_server.recv().await
    }

    /// Receive the next data frame, answering pings along the way.
    pub async fn recv_data(&mut self) -> Option<WireFrame> {
        loop {
            match self.from_server.recv().await? {
                WireFrame::Ping(_) => {
                    self.pong();
                }
                WireFrame::Pong(_) => {}
                frame => return Some(frame),
            }
        }
    }

    /// Receive a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.from_server.try_recv().ok()
    }

    /// Drop the peer's sending half; the server sees the stream end.
    pub fn disconnect(&mut self) {
        self.to_server = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (connection, mut peer) = pair();
        let (mut source, mut sink) = Box::new(connection).split();

        assert!(peer.send_text("hi"));
        assert_eq!(
            source.recv().await.unwrap(),
            Some(WireFrame::Text("hi".into()))
        );

        sink.send(WireFrame::Text("back".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(WireFrame::Text("back".into())));
    }

    #[tokio::test]
    async fn test_close_and_disconnect() {
        let (connection, mut peer) = pair();
        let (mut source, mut sink) = Box::new(connection).split();

        sink.close().await.unwrap();
        assert_eq!(peer.recv().await, Some(WireFrame::Close));
        assert!(matches!(
            sink.send(WireFrame::Text("late".into())).await,
            Err(TransportError::ConnectionClosed)
        ));

        peer.disconnect();
        assert!(!peer.send_text("gone"));
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_data_answers_pings() {
        let (connection, mut peer) = pair();
        let (mut source, mut sink) = Box::new(connection).split();

        sink.send(WireFrame::Ping(Bytes::new())).await.unwrap();
        sink.send(WireFrame::Text("payload".into())).await.unwrap();

        assert_eq!(peer.recv_data().await, Some(WireFrame::Text("payload".into())));
        assert_eq!(source.recv().await.unwrap(), Some(WireFrame::Pong(Bytes::new())));
    }
}
