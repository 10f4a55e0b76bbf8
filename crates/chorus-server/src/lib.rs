//! # Chorus Server
//!
//! HTTP and WebSocket front end for the Chorus hub.
//!
//! Clients upgrade at the WebSocket path with a `room_id` query parameter.
//! The user id is taken from a header set by the authenticating proxy in
//! front of the server.

pub mod config;
pub mod handlers;
pub mod metrics;
