//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`CHORUS_CONFIG`, or the first of the default paths)
//! - Environment variables (`CHORUS__SECTION__KEY`)

use anyhow::{Context, Result};
use chorus_core::{HubConfig, PersistConfig, PresenceConfig, PumpConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_PATHS: &[&str] = &[
    "chorus.toml",
    "/etc/chorus/chorus.toml",
    "~/.config/chorus/chorus.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence cache configuration.
    #[serde(default)]
    pub presence: PresenceSection,

    /// Message persistence configuration.
    #[serde(default)]
    pub persist: PersistSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Header carrying the authenticated user id, set by the upstream proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection delivery queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub delivery_queue_capacity: usize,

    /// Most envelopes written in one frame.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Size in bytes after which a frame takes no more envelopes.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Presence cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Redis URL. Presence is kept in memory when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of the per-room presence keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of a room's presence set, in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
}

/// Message persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSection {
    /// Directory for the JSON-lines collections.
    #[serde(default = "default_persist_directory")]
    pub directory: String,

    /// Number of persistence workers.
    #[serde(default = "default_persist_workers")]
    pub workers: usize,

    /// Pending jobs before new ones are dropped.
    #[serde(default = "default_persist_queue")]
    pub queue_capacity: usize,

    /// Skip storing messages that fail validation.
    #[serde(default)]
    pub reject_invalid: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_batch() -> usize {
    256
}

fn default_max_batch_bytes() -> usize {
    64 * 1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_key_prefix() -> String {
    chorus_core::presence::DEFAULT_KEY_PREFIX.to_string()
}

fn default_presence_ttl() -> u64 {
    3600
}

fn default_persist_directory() -> String {
    "data".to_string()
}

fn default_persist_workers() -> usize {
    4
}

fn default_persist_queue() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceSection::default(),
            persist: PersistSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            user_header: default_user_header(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            delivery_queue_capacity: default_queue_capacity(),
            max_batch: default_max_batch(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: default_presence_ttl(),
        }
    }
}

impl Default for PersistSection {
    fn default() -> Self {
        Self {
            directory: default_persist_directory(),
            workers: default_persist_workers(),
            queue_capacity: default_persist_queue(),
            reject_invalid: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `CHORUS__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = std::env::var("CHORUS_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                CONFIG_PATHS
                    .iter()
                    .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                    .find(|path| path.exists())
            });

        match file {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                builder = builder.add_source(config::File::from(path));
            }
            None => debug!("No configuration file found, using defaults"),
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHORUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Unable to build configuration")?;

        settings
            .try_deserialize::<Config>()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Pump settings for admitted connections.
    #[must_use]
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
            read_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            queue_capacity: self.limits.delivery_queue_capacity,
            max_batch: self.limits.max_batch,
            max_batch_bytes: self.limits.max_batch_bytes,
            max_message_size: self.limits.max_message_size,
        }
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            persist: PersistConfig {
                workers: self.persist.workers,
                queue_capacity: self.persist.queue_capacity,
                reject_invalid: self.persist.reject_invalid,
            },
        }
    }

    /// Presence key layout and expiry.
    #[must_use]
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            key_prefix: self.presence.key_prefix.clone(),
            ttl: Duration::from_secs(self.presence.ttl_secs),
        }
    }

    /// Persistence directory with `~` expanded.
    #[must_use]
    pub fn persist_directory(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.persist.directory).as_ref())
    }
}
