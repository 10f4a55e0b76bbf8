//! Message persistence.
//!
//! Every broadcast envelope is handed to a bounded worker pool that validates
//! it and writes a record to the collection for its category. Persistence
//! never blocks delivery: when the pool's queue is full the job is dropped.

use async_trait::async_trait;
use chorus_protocol::{Category, Content, Envelope, MessageType};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::metrics::names;
use crate::validate::validate;

/// Errors from a message sink.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Storage collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    UserMessages,
    SystemMessages,
}

impl Collection {
    /// Collection for a message category.
    #[must_use]
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::User => Collection::UserMessages,
            Category::System => Collection::SystemMessages,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Collection::UserMessages => "user_messages",
            Collection::SystemMessages => "system_messages",
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Extracted content body, or null when extraction failed.
    pub content: Value,
    pub created_at: i64,
    pub valid: bool,
}

impl StoredMessage {
    /// Build a record from an envelope and its validation outcome.
    #[must_use]
    pub fn new(envelope: &Envelope, content: Option<&Content>, valid: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: envelope.room_id.clone(),
            sender_id: envelope.sender_id.clone(),
            kind: envelope.kind.clone(),
            content: content.map_or(Value::Null, Content::body),
            created_at: envelope.created_at,
            valid,
        }
    }
}

/// A destination for persisted messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Insert one record.
    async fn insert(&self, collection: Collection, record: &StoredMessage) -> Result<(), PersistError>;
}

/// Sink that appends JSON lines to one file per collection.
#[derive(Debug)]
pub struct JsonlSink {
    directory: PathBuf,
    /// One writer per file at a time, so lines never interleave.
    user_lock: tokio::sync::Mutex<()>,
    system_lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    /// Create the sink, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        info!(directory = %directory.display(), "Persisting messages as JSON lines");
        Ok(Self {
            directory,
            user_lock: tokio::sync::Mutex::new(()),
            system_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of a collection's file.
    #[must_use]
    pub fn path(&self, collection: Collection) -> PathBuf {
        self.directory.join(format!("{}.jsonl", collection.name()))
    }

    fn lock(&self, collection: Collection) -> &tokio::sync::Mutex<()> {
        match collection {
            Collection::UserMessages => &self.user_lock,
            Collection::SystemMessages => &self.system_lock,
        }
    }
}

#[async_trait]
impl MessageSink for JsonlSink {
    async fn insert(&self, collection: Collection, record: &StoredMessage) -> Result<(), PersistError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock(collection).lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(collection))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Collection, StoredMessage)>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records stored in a collection, in insertion order.
    #[must_use]
    pub fn records(&self, collection: Collection) -> Vec<StoredMessage> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Total number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn insert(&self, collection: Collection, record: &StoredMessage) -> Result<(), PersistError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((collection, record.clone()));
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Number of workers.
    pub workers: usize,
    /// Jobs that may wait before new ones are dropped.
    pub queue_capacity: usize,
    /// Skip storing envelopes that fail validation.
    pub reject_invalid: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            reject_invalid: false,
        }
    }
}

/// Persistence counters.
#[derive(Debug, Default)]
pub struct PersistStats {
    submitted: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`PersistStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSnapshot {
    pub submitted: u64,
    pub persisted: u64,
    pub failed: u64,
    pub invalid: u64,
    pub dropped: u64,
    pub skipped: u64,
}

impl PersistStats {
    #[must_use]
    pub fn snapshot(&self) -> PersistSnapshot {
        PersistSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, counter_ref: &AtomicU64, outcome: &'static str) {
        counter_ref.fetch_add(1, Ordering::Relaxed);
        counter!(names::PERSIST_TOTAL, "outcome" => outcome).increment(1);
    }
}

/// Bounded pool of persistence workers.
pub struct Persister {
    jobs: mpsc::Sender<Arc<Envelope>>,
    stats: Arc<PersistStats>,
    workers: Vec<JoinHandle<()>>,
}

impl Persister {
    /// Start the worker pool.
    #[must_use]
    pub fn spawn(sink: Arc<dyn MessageSink>, config: PersistConfig) -> Self {
        let workers = config.workers.max(1);
        info!(
            workers,
            queue_capacity = config.queue_capacity,
            reject_invalid = config.reject_invalid,
            "Starting persistence workers"
        );

        let (jobs, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stats = Arc::new(PersistStats::default());

        let workers = (0..workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&receiver),
                    Arc::clone(&sink),
                    Arc::clone(&stats),
                    config.reject_invalid,
                ))
            })
            .collect();

        Self {
            jobs,
            stats,
            workers,
        }
    }

    /// Queue an envelope without waiting.
    ///
    /// Returns `false` if the job was dropped.
    pub fn submit(&self, envelope: Arc<Envelope>) -> bool {
        match self.jobs.try_send(envelope) {
            Ok(()) => {
                self.stats.record(&self.stats.submitted, "submitted");
                true
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(room = %envelope.room_id, kind = %envelope.kind, "Persistence queue full, dropping message");
                self.stats.record(&self.stats.dropped, "dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.record(&self.stats.dropped, "dropped");
                false
            }
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PersistStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.jobs);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Persistence worker failed: {}", e);
            }
        }
        debug!("Persistence workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Envelope>>>>,
    sink: Arc<dyn MessageSink>,
    stats: Arc<PersistStats>,
    reject_invalid: bool,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(envelope) = next else {
            trace!(worker, "Persistence queue closed");
            return;
        };
        persist_one(sink.as_ref(), &envelope, &stats, reject_invalid).await;
    }
}

async fn persist_one(
    sink: &dyn MessageSink,
    envelope: &Envelope,
    stats: &PersistStats,
    reject_invalid: bool,
) {
    let Some(category) = envelope.kind.category() else {
        trace!(kind = %envelope.kind, "Not persisting unclassified message");
        stats.record(&stats.skipped, "skipped");
        return;
    };

    let validation = validate(envelope);
    let valid = validation.is_valid();
    if let Some(reason) = &validation.error {
        warn!(
            room = %envelope.room_id,
            sender = %envelope.sender_id,
            kind = %envelope.kind,
            reason = %reason,
            "Message failed validation"
        );
        stats.record(&stats.invalid, "invalid");
        if reject_invalid {
            return;
        }
    }

    let record = StoredMessage::new(envelope, validation.content.as_ref(), valid);
    let collection = Collection::for_category(category);
    match sink.insert(collection, &record).await {
        Ok(()) => {
            trace!(id = %record.id, collection = collection.name(), "Persisted message");
            stats.record(&stats.persisted, "persisted");
        }
        Err(e) => {
            error!(
                room = %envelope.room_id,
                collection = collection.name(),
                "Failed to persist message: {}",
                e
            );
            stats.record(&stats.failed, "failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl MessageSink for FailingSink {
        async fn insert(&self, _: Collection, _: &StoredMessage) -> Result<(), PersistError> {
            Err(PersistError::Unavailable("down".into()))
        }
    }

    fn text(body: &str) -> Arc<Envelope> {
        Arc::new(Envelope::text(body).with_origin("r1", "alice"))
    }

    #[tokio::test]
    async fn test_routes_by_category() {
        let sink = Arc::new(MemorySink::new());
        let persister = Persister::spawn(sink.clone(), PersistConfig::default());

        assert!(persister.submit(text("hi")));
        assert!(persister.submit(Arc::new(Envelope::join("r1", "alice"))));
        let stats = persister.stats();
        persister.shutdown().await;

        let user = sink.records(Collection::UserMessages);
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].content, json!({"text": "hi"}));
        assert!(user[0].valid);

        let system = sink.records(Collection::SystemMessages);
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].kind, MessageType::Join);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.persisted, 2);
    }

    #[tokio::test]
    async fn test_invalid_stored_with_flag() {
        let sink = Arc::new(MemorySink::new());
        let persister = Persister::spawn(sink.clone(), PersistConfig::default());

        persister.submit(text(""));
        let stats = persister.stats();
        persister.shutdown().await;

        let user = sink.records(Collection::UserMessages);
        assert_eq!(user.len(), 1);
        assert!(!user[0].valid);
        assert_eq!(stats.snapshot().invalid, 1);
    }

    #[tokio::test]
    async fn test_reject_invalid_skips_store() {
        let sink = Arc::new(MemorySink::new());
        let config = PersistConfig {
            reject_invalid: true,
            ..PersistConfig::default()
        };
        let persister = Persister::spawn(sink.clone(), config);

        persister.submit(text(""));
        persister.submit(text("ok"));
        persister.shutdown().await;

        let user = sink.records(Collection::UserMessages);
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].content, json!({"text": "ok"}));
    }

    #[tokio::test]
    async fn test_unclassified_not_stored() {
        let sink = Arc::new(MemorySink::new());
        let persister = Persister::spawn(sink.clone(), PersistConfig::default());

        let typing = Envelope::new("typing", json!({})).with_origin("r1", "alice");
        persister.submit(Arc::new(typing));
        let stats = persister.stats();
        persister.shutdown().await;

        assert!(sink.is_empty());
        assert_eq!(stats.snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_counted() {
        let persister = Persister::spawn(Arc::new(FailingSink), PersistConfig::default());
        persister.submit(text("hi"));
        let stats = persister.stats();
        persister.shutdown().await;

        assert_eq!(stats.snapshot().failed, 1);
        assert_eq!(stats.snapshot().persisted, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let config = PersistConfig {
            workers: 1,
            queue_capacity: 1,
            reject_invalid: false,
        };
        let persister = Persister::spawn(Arc::new(MemorySink::new()), config);

        // The worker has not run yet on the current-thread runtime.
        assert!(persister.submit(text("one")));
        assert!(!persister.submit(text("two")));
        assert_eq!(persister.stats().snapshot().dropped, 1);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let directory = std::env::temp_dir().join(format!("chorus-jsonl-{}", Uuid::new_v4()));
        let sink = JsonlSink::open(&directory).await.unwrap();

        let envelope = Envelope::text("hi").with_origin("r1", "alice");
        let record = StoredMessage::new(&envelope, None, false);
        sink.insert(Collection::UserMessages, &record).await.unwrap();
        sink.insert(Collection::UserMessages, &record).await.unwrap();

        let written = tokio::fs::read_to_string(sink.path(Collection::UserMessages))
            .await
            .unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: StoredMessage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
        assert!(written.contains("\"_id\""));
        assert!(written.contains("\"content\":null"));

        tokio::fs::remove_dir_all(&directory).await.unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_collections_write_independently() {
        let directory = std::env::temp_dir().join(format!("chorus-jsonl-{}", Uuid::new_v4()));
        let sink = Arc::new(JsonlSink::open(&directory).await.unwrap());
        let user = StoredMessage::new(&Envelope::text("hi").with_origin("r1", "alice"), None, true);
        let system = StoredMessage::new(&Envelope::join("r1", "alice"), None, true);

        // A writer stuck on one file does not hold up the other.
        let held = sink.lock(Collection::UserMessages).lock().await;
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            sink.insert(Collection::SystemMessages, &system),
        )
        .await
        .unwrap()
        .unwrap();
        drop(held);

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let sink = Arc::clone(&sink);
                let (collection, record) = if i % 2 == 0 {
                    (Collection::UserMessages, user.clone())
                } else {
                    (Collection::SystemMessages, system.clone())
                };
                tokio::spawn(async move { sink.insert(collection, &record).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        for (collection, expected) in [(Collection::UserMessages, 10), (Collection::SystemMessages, 11)] {
            let written = tokio::fs::read_to_string(sink.path(collection)).await.unwrap();
            let lines: Vec<&str> = written.lines().collect();
            assert_eq!(lines.len(), expected);
            for line in lines {
                serde_json::from_str::<StoredMessage>(line).unwrap();
            }
        }

        tokio::fs::remove_dir_all(&directory).await.unwrap();
    }
}
