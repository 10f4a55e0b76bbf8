//! # chorus-transport
//!
//! Transport abstraction layer for the Chorus room messaging engine.
//!
//! This crate provides a unified interface over the duplex connections the
//! hub serves:
//!
//! - **axum** - sockets upgraded by the HTTP server
//! - **memory** - in-process pairs for tests and benchmarks
//!
//! ## Transport Abstraction
//!
//! Every connection implements [`Connection`] and splits into a
//! [`FrameSource`] and a [`FrameSink`], so the connection pumps are
//! protocol-agnostic.
//!
//! ```rust,ignore
//! use chorus_transport::{Connection, WireFrame};
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut source, mut sink) = conn.split();
//!     while let Ok(Some(frame)) = source.recv().await {
//!         let _ = sink.send(frame).await;
//!     }
//! }
//! ```

pub mod axum_ws;
pub mod memory;
pub mod traits;

pub use axum_ws::AxumConnection;
pub use traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError, WireFrame};
