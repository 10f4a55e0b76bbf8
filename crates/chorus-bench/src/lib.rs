//! Shared fixtures for the Chorus benchmarks.

use async_trait::async_trait;
use chorus_core::{
    Collection, Hub, HubConfig, HubHandle, MemoryPresence, MessageSink, PersistError,
    StoredMessage,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Sink that discards every record, so benchmarks measure delivery only.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl MessageSink for NullSink {
    async fn insert(&self, _: Collection, _: &StoredMessage) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Start a hub with in-memory presence and a discarding sink.
///
/// Must be called inside a tokio runtime.
#[must_use]
pub fn start_hub() -> (HubHandle, JoinHandle<()>) {
    Hub::spawn(
        HubConfig::default(),
        Arc::new(MemoryPresence::default()),
        Arc::new(NullSink),
    )
}
