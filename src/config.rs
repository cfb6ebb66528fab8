// Configuration File Support
//
// This module provides configuration file parsing for the quota relay.
// Supports TOML format with QUOTA_RELAY_* environment variable overrides.
// The file path is given on the command line (default: ./quota-relay.toml).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rate_limit::bucket::{DEFAULT_BUCKET_LIMIT, DEFAULT_BUCKET_WINDOW};
use crate::rate_limit::route::DEFAULT_MAJOR_PARAMETERS;
use crate::rate_limit::{BackoffConfig, BucketDefaults, RouteTemplate};
use crate::relay::codec::DEFAULT_MAX_FRAME_SIZE;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "quota-relay.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "QUOTA_RELAY_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Response listener configuration
    pub listener: ListenerConfig,

    /// Queue transport configuration
    pub queue: QueueConfig,

    /// Invocation defaults
    pub orchestrator: OrchestratorConfig,

    /// Admission backoff bounds
    pub admission: AdmissionConfig,

    /// Bucket store configuration
    pub buckets: BucketsConfig,

    /// Route template configuration
    pub routes: RoutesConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Convert the level string to a tracing::Level
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

/// Response listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address the listener binds to
    pub bind_address: String,

    /// host:port workers use to reach this process (derived when unset)
    pub advertise_address: Option<String>,

    /// Largest accepted frame body in bytes
    pub max_frame_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7450".to_string(),
            advertise_address: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ListenerConfig {
    /// Address embedded in request envelopes
    ///
    /// Falls back to this host's name and the bound port when no advertise
    /// address is configured.
    pub fn return_address(&self, bound_port: u16) -> String {
        if let Some(address) = &self.advertise_address {
            return address.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        format!("{}:{}", host, bound_port)
    }
}

/// Queue transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue ingest endpoint
    pub endpoint: String,

    /// Publish timeout in milliseconds
    pub publish_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8085/enqueue".to_string(),
            publish_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    /// Publish timeout
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Invocation defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Timeout applied when a caller gives none, in milliseconds
    pub default_timeout_ms: u64,

    /// Period of the expiry sweep, in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl OrchestratorConfig {
    /// Default invocation timeout
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Expiry sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Admission backoff bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Backoff base in milliseconds
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,

    /// Jitter fraction in [0, 1]
    pub jitter: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            base_delay_ms: backoff.base_delay.as_millis() as u64,
            max_delay_ms: backoff.max_delay.as_millis() as u64,
            jitter: backoff.jitter,
        }
    }
}

impl AdmissionConfig {
    /// Backoff configuration
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig::new()
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter)
    }
}

/// Bucket store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BucketsConfig {
    /// SQLite database shared by every process
    pub database_path: PathBuf,

    /// Requests per window for new buckets
    pub default_limit: u32,

    /// Window length for new buckets, in milliseconds
    pub default_window_ms: u64,

    /// How long to wait for another process's write lock, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/buckets.db"),
            default_limit: DEFAULT_BUCKET_LIMIT,
            default_window_ms: DEFAULT_BUCKET_WINDOW.as_millis() as u64,
            busy_timeout_ms: 5_000,
        }
    }
}

impl BucketsConfig {
    /// Limits for lazily created buckets
    pub fn defaults(&self) -> BucketDefaults {
        BucketDefaults {
            limit: self.default_limit,
            window: Duration::from_millis(self.default_window_ms),
        }
    }

    /// SQLite busy timeout
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Route template configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutesConfig {
    /// Path segments whose following id is part of the bucket key
    pub major_parameters: Vec<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            major_parameters: DEFAULT_MAJOR_PARAMETERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RoutesConfig {
    /// Route template mapper
    pub fn template(&self) -> RouteTemplate {
        RouteTemplate::new(self.major_parameters.clone())
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics and /health
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the file does not exist, defaults are used.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - QUOTA_RELAY_LOG_LEVEL / QUOTA_RELAY_LOG_FORMAT
    /// - QUOTA_RELAY_BIND_ADDRESS / QUOTA_RELAY_ADVERTISE_ADDRESS
    /// - QUOTA_RELAY_QUEUE_ENDPOINT
    /// - QUOTA_RELAY_DEFAULT_TIMEOUT_MS
    /// - QUOTA_RELAY_DATABASE_PATH
    /// - QUOTA_RELAY_METRICS_ENABLED / QUOTA_RELAY_METRICS_PORT
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            self.logging.format = format;
        }

        // Listener overrides
        if let Some(bind) = env_var("BIND_ADDRESS") {
            self.listener.bind_address = bind;
        }
        if let Some(advertise) = env_var("ADVERTISE_ADDRESS") {
            self.listener.advertise_address = Some(advertise);
        }

        // Queue and invocation overrides
        if let Some(endpoint) = env_var("QUEUE_ENDPOINT") {
            self.queue.endpoint = endpoint;
        }
        if let Some(timeout) = env_var("DEFAULT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.orchestrator.default_timeout_ms = timeout;
        }

        // Bucket store overrides
        if let Some(path) = env_var("DATABASE_PATH") {
            self.buckets.database_path = PathBuf::from(path);
        }

        // Metrics overrides
        if let Some(enabled) = env_var("METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Some(port) = env_var("METRICS_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.metrics.port = port;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.listener.bind_address.is_empty() {
            anyhow::bail!("Listener bind address must not be empty");
        }
        if self.listener.max_frame_size == 0 {
            anyhow::bail!("Listener max frame size must be > 0");
        }

        if !self.queue.endpoint.starts_with("http://") && !self.queue.endpoint.starts_with("https://") {
            anyhow::bail!("Queue endpoint must be an http(s) URL: {}", self.queue.endpoint);
        }
        if self.queue.publish_timeout_ms == 0 {
            anyhow::bail!("Queue publish timeout must be > 0");
        }

        if self.orchestrator.default_timeout_ms == 0 {
            anyhow::bail!("Default invocation timeout must be > 0");
        }
        if self.orchestrator.sweep_interval_ms == 0 {
            anyhow::bail!("Sweep interval must be > 0");
        }

        if self.admission.base_delay_ms == 0 {
            anyhow::bail!("Admission base delay must be > 0");
        }
        if self.admission.max_delay_ms < self.admission.base_delay_ms {
            anyhow::bail!("Admission max delay must be >= base delay");
        }
        if !(0.0..=1.0).contains(&self.admission.jitter) {
            anyhow::bail!("Admission jitter must be within [0, 1]");
        }

        if self.buckets.default_limit == 0 {
            anyhow::bail!("Default bucket limit must be > 0");
        }
        if self.buckets.default_window_ms == 0 {
            anyhow::bail!("Default bucket window must be > 0");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}
