use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default topic relayed when none is configured
pub const DEFAULT_TOPIC: &str = "0x567853282663b601bfdb9203819b1fbb3fe18926/m3tering/test";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum size of a single inbound WebSocket frame
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4001,
            max_message_size: 64 * 1024,
        }
    }
}

/// Fan-out and idle behaviour of the relay core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of recent upstream messages replayed to joining viewers
    pub buffer_capacity: usize,
    /// Idle period with zero viewers before the upstream subscription is released
    pub idle_teardown_seconds: u64,
    /// Per-viewer outbound queue; a full queue disconnects the viewer
    pub viewer_queue_capacity: usize,
    /// Coordinator event queue capacity
    pub event_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            idle_teardown_seconds: 60 * 60,
            viewer_queue_capacity: 1000,
            event_queue_capacity: 4096,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn idle_teardown_delay(&self) -> Duration {
        Duration::from_secs(self.idle_teardown_seconds)
    }
}

/// Upstream transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Redis pub/sub channel
    #[default]
    Redis,
    /// In-process pub/sub (single node, tests)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub transport: TransportKind,
    /// Topic identifier subscribed upstream and reported to viewers
    pub topic: String,
    pub redis_url: String,
    /// Subscribe attempts per activation
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Upper bound for a single connect/subscribe/unsubscribe/dispose call
    pub operation_timeout_seconds: u64,
    /// Dispose the client on every deactivate instead of keeping it for reuse
    pub dispose_client_on_deactivate: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Redis,
            topic: DEFAULT_TOPIC.to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            max_attempts: 3,
            retry_delay_ms: 5000,
            operation_timeout_seconds: 5,
            dispose_client_on_deactivate: true,
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // STREAMRELAY_UPSTREAM__REDIS_URL, STREAMRELAY_SERVER__PORT, ...
        builder = builder.add_source(
            Environment::with_prefix("STREAMRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check invariants the relay depends on. Returns every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.upstream.topic.trim().is_empty() {
            errors.push("upstream.topic must not be empty".to_string());
        }
        if self.relay.buffer_capacity == 0 {
            errors.push("relay.buffer_capacity must be at least 1".to_string());
        }
        if self.relay.viewer_queue_capacity == 0 {
            errors.push("relay.viewer_queue_capacity must be at least 1".to_string());
        }
        if self.relay.event_queue_capacity == 0 {
            errors.push("relay.event_queue_capacity must be at least 1".to_string());
        }
        if self.upstream.max_attempts == 0 {
            errors.push("upstream.max_attempts must be at least 1".to_string());
        }
        if self.upstream.operation_timeout_seconds == 0 {
            errors.push("upstream.operation_timeout_seconds must be at least 1".to_string());
        }
        if self.upstream.transport == TransportKind::Redis && self.upstream.redis_url.is_empty() {
            errors.push("upstream.redis_url is required for the redis transport".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP/WebSocket listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
