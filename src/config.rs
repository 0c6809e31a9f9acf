//! Gateway configuration and constants.
//!
//! Settings are layered with figment: built-in defaults, then `jobdeck.toml`,
//! then `jobdeck.yaml`, then `JOBDECK_*` environment variables. The node
//! document itself (addresses and credentials) lives in a separate file read
//! by the node registry.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ConfigError, Result};
use crate::gateway::{ChannelSettings, Deadlines, RetryPolicy};

/// Serde helper for Duration serialization/deserialization as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as `duration_secs`, in milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Node registry constants
pub mod nodes {
    use std::time::Duration;

    /// Name of the built-in node used when the node document is unusable
    pub const DEFAULT_NODE_NAME: &str = "default";

    /// Loopback address of the built-in node
    pub const DEFAULT_NODE_ADDRESS: &str = "127.0.0.1:50051";

    /// How long a loaded node document is trusted before re-reading it
    pub const REGISTRY_TTL: Duration = Duration::from_secs(30);

    /// Node document location relative to the home directory
    pub const NODES_FILE_RELATIVE: &str = ".jobdeck/nodes.yml";
}

/// Unary call retry constants
pub mod retry {
    use std::time::Duration;

    /// Attempts per call, including the first
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Backoff unit; attempt `n` waits `n * BASE_DELAY`
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
}

/// Centralized timeout configuration constants
pub mod timeouts {
    use std::time::Duration;

    /// Deadline for read-class calls (list, status, inspect)
    pub const READ_DEADLINE: Duration = Duration::from_secs(10);

    /// Deadline for write-class calls (submit, bulk delete, create)
    pub const WRITE_DEADLINE: Duration = Duration::from_secs(60);

    /// TCP connect timeout for new channels
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// HTTP/2 keep-alive ping interval
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    /// Time to wait for a keep-alive ack before declaring the channel dead
    pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long open connections may keep the process alive after a signal
    pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);
}

/// Streaming and install-session constants
pub mod streaming {
    use std::time::Duration;

    /// Items a relay may hold between the backend stream and the push channel
    pub const RELAY_BUFFER: usize = 1;

    /// Maximum number of concurrent WebSocket push channels
    pub const MAX_CONCURRENT_STREAMS: usize = 256;

    /// How long a finished install session stays observable
    pub const INSTALL_GRACE_PERIOD: Duration = Duration::from_secs(60);

    /// How long the triggering install request waits for early progress
    pub const INSTALL_INITIAL_WINDOW: Duration = Duration::from_millis(250);
}

fn default_nodes_file() -> Option<PathBuf> { None }
fn default_initial_node() -> String { nodes::DEFAULT_NODE_NAME.to_string() }
fn default_retry_max_attempts() -> u32 { retry::MAX_ATTEMPTS }
fn default_retry_mutations() -> bool { false }
fn default_relay_buffer() -> usize { streaming::RELAY_BUFFER }
fn default_max_concurrent_streams() -> usize { streaming::MAX_CONCURRENT_STREAMS }
fn default_log_level() -> String { "info".to_string() }
fn default_log_json() -> bool { false }

/// Gateway configuration loaded from multiple sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server host
    pub server_host: String,

    /// HTTP server port
    pub server_port: u16,

    /// Node document override; defaults to `~/.jobdeck/nodes.yml`
    #[serde(default = "default_nodes_file")]
    pub nodes_file: Option<PathBuf>,

    /// Node selected at startup for callers that don't name one
    #[serde(default = "default_initial_node")]
    pub initial_node: String,

    /// Node document cache lifetime in seconds
    #[serde(with = "duration_secs")]
    pub registry_ttl: Duration,

    // Unary call policy
    /// Attempts per retryable call, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Linear backoff unit in milliseconds
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,

    /// Allow automatic retry of non-idempotent mutations
    #[serde(default = "default_retry_mutations")]
    pub retry_mutations: bool,

    /// Deadline for read-class calls in seconds
    #[serde(with = "duration_secs")]
    pub read_deadline: Duration,

    /// Deadline for write-class calls in seconds
    #[serde(with = "duration_secs")]
    pub write_deadline: Duration,

    // Channel construction
    /// TCP connect timeout in seconds
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// HTTP/2 keep-alive interval in seconds
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// HTTP/2 keep-alive ack timeout in seconds
    #[serde(with = "duration_secs")]
    pub keepalive_timeout: Duration,

    // Streaming
    /// Relay buffer between backend stream and push channel
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer: usize,

    /// Maximum concurrent WebSocket push channels
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// Seconds a finished install session stays observable
    #[serde(with = "duration_secs")]
    pub install_grace_period: Duration,

    /// Milliseconds the install trigger waits for early progress
    #[serde(with = "duration_millis")]
    pub install_initial_window: Duration,

    // Logging
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of compact text
    #[serde(default = "default_log_json")]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 5175,
            nodes_file: default_nodes_file(),
            initial_node: default_initial_node(),
            registry_ttl: nodes::REGISTRY_TTL,
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay: retry::BASE_DELAY,
            retry_mutations: default_retry_mutations(),
            read_deadline: timeouts::READ_DEADLINE,
            write_deadline: timeouts::WRITE_DEADLINE,
            connect_timeout: timeouts::CONNECT_TIMEOUT,
            keepalive_interval: timeouts::KEEPALIVE_INTERVAL,
            keepalive_timeout: timeouts::KEEPALIVE_TIMEOUT,
            relay_buffer: default_relay_buffer(),
            max_concurrent_streams: default_max_concurrent_streams(),
            install_grace_period: streaming::INSTALL_GRACE_PERIOD,
            install_initial_window: streaming::INSTALL_INITIAL_WINDOW,
            log_level: default_log_level(),
            log_json: default_log_json(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed `JOBDECK_` (highest priority)
    /// 2. jobdeck.yaml (if exists)
    /// 3. jobdeck.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// The layered provider stack used by [`Config::load`].
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("jobdeck.toml"))
            .merge(Yaml::file("jobdeck.yaml"))
            .merge(Env::prefixed("JOBDECK_"))
    }

    /// Extract and validate from an arbitrary provider stack.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().map_err(|e| {
            AppError::Configuration(ConfigError::Validation(format!(
                "Failed to load configuration: {}",
                e
            )))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(AppError::Configuration(ConfigError::Validation(msg.to_string())));

        if self.server_host.is_empty() {
            return invalid("server_host cannot be empty");
        }
        if self.server_port == 0 {
            return invalid("server_port must be between 1 and 65535");
        }
        if self.initial_node.trim().is_empty() {
            return invalid("initial_node cannot be empty");
        }
        if self.retry_max_attempts == 0 || self.retry_max_attempts > 10 {
            return invalid("retry_max_attempts must be between 1 and 10");
        }
        if self.read_deadline.is_zero() || self.write_deadline.is_zero() {
            return invalid("call deadlines must be at least one second");
        }
        if self.write_deadline < self.read_deadline {
            return invalid("write_deadline must not be shorter than read_deadline");
        }
        if self.relay_buffer == 0 {
            return invalid("relay_buffer must be at least 1");
        }
        if self.max_concurrent_streams == 0 {
            return invalid("max_concurrent_streams must be at least 1");
        }

        Ok(())
    }

    /// Where the node document is read from.
    pub fn nodes_path(&self) -> PathBuf {
        match &self.nodes_file {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(nodes::NODES_FILE_RELATIVE),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            retry_mutations: self.retry_mutations,
        }
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            read: self.read_deadline,
            write: self.write_deadline,
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            connect_timeout: self.connect_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
        }
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            AppError::Configuration(ConfigError::Validation(format!(
                "Failed to serialize to TOML: {}",
                e
            )))
        })
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            AppError::Configuration(ConfigError::Validation(format!(
                "Failed to serialize to YAML: {}",
                e
            )))
        })
    }
}
