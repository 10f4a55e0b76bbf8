//! # Chorus Server
//!
//! Realtime room messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chorus
//!
//! # Run with a specific config file
//! CHORUS_CONFIG=/path/to/chorus.toml chorus
//!
//! # Override single settings
//! CHORUS__PORT=9000 CHORUS__PRESENCE__REDIS_URL=redis://127.0.0.1/ chorus
//! ```

use anyhow::Result;
use chorus_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Chorus server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
