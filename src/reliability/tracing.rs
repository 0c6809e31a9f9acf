//! Log and span output setup.

use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use crate::config::Config;

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// One JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl From<&Config> for TracingConfig {
    fn from(config: &Config) -> Self {
        Self {
            log_level: config.log_level.clone(),
            json: config.log_json,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    let subscriber = Registry::default().with(env_filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()?;
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(true).compact())
            .try_init()?;
    }

    info!(level = %config.log_level, json = config.json, "Tracing initialized");
    Ok(())
}
