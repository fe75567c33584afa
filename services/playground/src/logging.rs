//! Logging bootstrap
//!
//! `RUST_LOG` wins over the plan's level. Worker threads are named
//! `kite-worker-N`, so thread names are always on.

use anyhow::{Context, Result};
use kite_config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(config: &LoggingConfig, force_json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.json || force_json {
        registry
            .with(fmt::layer().json().with_thread_names(true))
            .try_init()
            .context("Failed to install JSON subscriber")?;
    } else {
        registry
            .with(fmt::layer().with_thread_names(true))
            .try_init()
            .context("Failed to install subscriber")?;
    }
    Ok(())
}
