//! Adapter for WebSockets upgraded by axum.
//!
//! The HTTP layer performs the upgrade; this module hands the resulting socket
//! to the hub as a [`Connection`]. Peer pings are answered by axum itself.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::debug;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError, WireFrame};

/// A WebSocket upgraded by axum.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.socket.split();
        (Box::new(AxumSource { stream }), Box::new(AxumSink { sink }))
    }
}

/// Read half of an [`AxumConnection`].
pub struct AxumSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(match message {
                Message::Text(text) => WireFrame::Text(text),
                Message::Binary(data) => WireFrame::Binary(Bytes::from(data)),
                Message::Ping(data) => WireFrame::Ping(Bytes::from(data)),
                Message::Pong(data) => WireFrame::Pong(Bytes::from(data)),
                Message::Close(_) => {
                    debug!("Received close frame");
                    WireFrame::Close
                }
            })),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Write half of an [`AxumConnection`].
pub struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            WireFrame::Ping(data) => Message::Ping(data.to_vec()),
            WireFrame::Pong(data) => Message::Pong(data.to_vec()),
            WireFrame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
