//! Presence tracking for Chorus.
//!
//! The presence cache records which users are online in each room. Entries
//! live in a per-room set with a sliding expiry so that a crashed server does
//! not leave users online forever.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Default key prefix for presence sets.
pub const DEFAULT_KEY_PREFIX: &str = "online_users";

/// Default expiry of a presence set, refreshed on every join.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

/// Errors from a presence backend.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Presence cache unavailable: {0}")]
    Unavailable(String),
}

/// Presence key layout and expiry.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Prefix of each room's set key.
    pub key_prefix: String,
    /// Sliding expiry of a room's set.
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_PRESENCE_TTL,
        }
    }
}

impl PresenceConfig {
    /// Key of the set holding a room's online users.
    #[must_use]
    pub fn key(&self, room_id: &str) -> String {
        presence_key(&self.key_prefix, room_id)
    }
}

/// Key of the set holding a room's online users.
#[must_use]
pub fn presence_key(prefix: &str, room_id: &str) -> String {
    format!("{prefix}:{room_id}")
}

/// A store of online users per room.
#[async_trait]
pub trait PresenceCache: Send + Sync {
    /// Add a user to a room's set and refresh the set's expiry.
    async fn add(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError>;

    /// Refresh a room's expiry without changing membership.
    async fn refresh(&self, room_id: &str) -> Result<(), PresenceError>;

    /// Remove a user from a room's set.
    async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError>;

    /// Users currently in a room's set.
    async fn members(&self, room_id: &str) -> Result<Vec<String>, PresenceError>;
}

#[derive(Debug)]
struct PresenceEntry {
    users: HashSet<String>,
    expires_at: Instant,
}

/// In-process presence cache.
///
/// Honors the same sliding expiry as the Redis backend. Used when no Redis
/// URL is configured and in tests.
#[derive(Debug)]
pub struct MemoryPresence {
    ttl: Duration,
    rooms: Mutex<HashMap<String, PresenceEntry>>,
    available: AtomicBool,
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

impl MemoryPresence {
    /// Create an empty cache with the given expiry.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rooms: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of rooms with live entries.
    #[must_use]
    pub fn room_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|entry| entry.expires_at > now && !entry.users.is_empty())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PresenceEntry>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), PresenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PresenceError::Unavailable("memory presence disabled".into()))
        }
    }
}

#[async_trait]
impl PresenceCache for MemoryPresence {
    async fn add(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
        self.check()?;
        let now = Instant::now();
        let mut rooms = self.lock();
        let entry = rooms.entry(room_id.to_string()).or_insert_with(|| PresenceEntry {
            users: HashSet::new(),
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.users.clear();
        }
        entry.users.insert(user_id.to_string());
        entry.expires_at = now + self.ttl;
        Ok(())
    }

    async fn refresh(&self, room_id: &str) -> Result<(), PresenceError> {
        self.check()?;
        let now = Instant::now();
        if let Some(entry) = self.lock().get_mut(room_id) {
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
            }
        }
        Ok(())
    }

    async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
        self.check()?;
        let mut rooms = self.lock();
        if let Some(entry) = rooms.get_mut(room_id) {
            entry.users.remove(user_id);
            if entry.users.is_empty() {
                rooms.remove(room_id);
            }
        }
        Ok(())
    }

    async fn members(&self, room_id: &str) -> Result<Vec<String>, PresenceError> {
        self.check()?;
        let now = Instant::now();
        let rooms = self.lock();
        let mut users: Vec<String> = match rooms.get(room_id) {
            Some(entry) if entry.expires_at > now => entry.users.iter().cloned().collect(),
            _ => Vec::new(),
        };
        users.sort();
        Ok(users)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisPresence;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::{PresenceCache, PresenceConfig, PresenceError};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::info;

    /// Presence cache backed by Redis sets.
    ///
    /// Each room is a set at `<prefix>:<room_id>`. Adds run `SADD` and
    /// `EXPIRE` in one transaction.
    #[derive(Clone)]
    pub struct RedisPresence {
        connection: ConnectionManager,
        config: PresenceConfig,
    }

    impl RedisPresence {
        /// Connect to Redis.
        ///
        /// # Errors
        ///
        /// Returns an error if the URL is invalid or the server is unreachable.
        pub async fn connect(url: &str, config: PresenceConfig) -> Result<Self, PresenceError> {
            let client = redis::Client::open(url)?;
            let connection = ConnectionManager::new(client).await?;
            info!(prefix = %config.key_prefix, ttl = ?config.ttl, "Connected presence cache to redis");
            Ok(Self { connection, config })
        }

        fn ttl_secs(&self) -> i64 {
            i64::try_from(self.config.ttl.as_secs()).unwrap_or(i64::MAX)
        }
    }

    #[async_trait]
    impl PresenceCache for RedisPresence {
        async fn add(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
            let key = self.config.key(room_id);
            let mut connection = self.connection.clone();
            redis::pipe()
                .atomic()
                .sadd(&key, user_id)
                .ignore()
                .expire(&key, self.ttl_secs())
                .ignore()
                .query_async::<_, ()>(&mut connection)
                .await?;
            Ok(())
        }

        async fn refresh(&self, room_id: &str) -> Result<(), PresenceError> {
            let key = self.config.key(room_id);
            let mut connection = self.connection.clone();
            connection.expire::<_, ()>(&key, self.ttl_secs()).await?;
            Ok(())
        }

        async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
            let key = self.config.key(room_id);
            let mut connection = self.connection.clone();
            connection.srem::<_, _, ()>(&key, user_id).await?;
            Ok(())
        }

        async fn members(&self, room_id: &str) -> Result<Vec<String>, PresenceError> {
            let key = self.config.key(room_id);
            let mut connection = self.connection.clone();
            let mut users: Vec<String> = connection.smembers(&key).await?;
            users.sort();
            Ok(users)
        }
    }
}
