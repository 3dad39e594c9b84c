//! Layered runtime configuration.
//!
//! Precedence, lowest to highest: compiled defaults < optional JSON config
//! file < environment variables (`RULECORE_` prefix, `__` for nesting, e.g.
//! `RULECORE_CACHE__MAX_SIZE=5000`). Mirrors the `*Config` + `Default` idiom
//! used throughout the connection-pool and cache layers this crate grew out
//! of, with the addition of the env/file layering the registry client needs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::CompressionAlgorithm;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file contents were not valid JSON.
    #[error("invalid config file {path}: {source}")]
    InvalidJson {
        /// Path that failed to parse.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// An environment variable held a value of the wrong type.
    #[error("environment variable {key} has invalid value: {message}")]
    InvalidEnvValue {
        /// Offending variable name.
        key: String,
        /// Description of what was expected.
        message: String,
    },

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Selects which `RuleLoader` implementation the runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    /// Fetch artifacts from the remote HTTP registry.
    Cloud,
    /// Read artifacts from a local directory tree.
    Local,
}

/// Bounded-capacity, tag-indexed cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries retained (LRU eviction beyond this).
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

/// Keep-alive HTTP connection pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent in-flight requests (models `maxConnections`).
    pub max_connections: usize,
    /// Requests served by one permit before it is retired.
    pub max_requests_per_connection: u64,
    /// How long an idle permit is kept warm.
    pub keep_alive_timeout: Duration,
    /// Ceiling on a single request's round trip.
    pub request_timeout: Duration,
    /// How long a caller waits for a free permit before `pool-exhausted`.
    pub queue_timeout: Duration,
    /// Retry attempts for network/timeout failures.
    pub max_retries: u32,
    /// Fixed delay between retries.
    pub retry_delay: Duration,
    /// Whether timeouts (as opposed to only connection failures) are retried.
    pub retry_on_timeout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_requests_per_connection: 1000,
            keep_alive_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(250),
            retry_on_timeout: false,
        }
    }
}

/// Request-coalescing batcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Dispatch a batch once this many requests are pending.
    pub max_batch_size: usize,
    /// Dispatch a batch once the oldest pending request has waited this long.
    pub max_wait_time: Duration,
    /// Maximum number of batches dispatched concurrently.
    pub max_concurrent_batches: usize,
    /// Whether coalescing is active at all; when false every request is its own batch.
    pub enable_auto_batching: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_wait_time: Duration::from_millis(100),
            max_concurrent_batches: 4,
            enable_auto_batching: true,
        }
    }
}

/// Compression tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether compression is active at all.
    pub enabled: bool,
    /// Algorithm used when compression is active.
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this many bytes pass through uncompressed.
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: CompressionAlgorithm::Gzip,
            threshold_bytes: 1024,
        }
    }
}

/// Remote registry loader tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteLoaderConfig {
    /// Registry base URL, e.g. `https://registry.example.com`.
    pub api_url: String,
    /// Bearer token sent as `Authorization: Bearer {api_key}`.
    pub api_key: String,
    /// Project scoping the rule set.
    pub project_id: String,
    /// Per-request timeout ceiling.
    pub http_timeout: Duration,
    /// Whether the connection pool is used (vs. a bare one-off client).
    pub enable_connection_pooling: bool,
    /// Whether the request batcher coalesces `loadRule` calls.
    pub enable_request_batching: bool,
    /// Whether `Accept-Encoding` is sent and the transport response is
    /// decompressed before the per-artifact codec runs.
    pub enable_compression: bool,
    /// Algorithm advertised via `Accept-Encoding` when compression is enabled.
    pub compression_algorithm: CompressionAlgorithm,
}

impl Default for RemoteLoaderConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            project_id: String::new(),
            http_timeout: Duration::from_secs(30),
            enable_connection_pooling: true,
            enable_request_batching: true,
            enable_compression: false,
            compression_algorithm: CompressionAlgorithm::Gzip,
        }
    }
}

/// Local directory loader tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLoaderConfig {
    /// Root directory scanned for rule artifacts.
    pub root: String,
    /// Whether subdirectories are scanned.
    pub recursive: bool,
    /// Artifact file extension (default `.json`).
    pub extension: String,
    /// Sidecar metadata suffix (default `.meta.json`).
    pub metadata_suffix: String,
    /// Whether a `notify`-backed watcher emits hot-reload events.
    pub enable_hot_reload: bool,
}

impl Default for LocalLoaderConfig {
    fn default() -> Self {
        Self {
            root: String::from("./rules"),
            recursive: true,
            extension: String::from(".json"),
            metadata_suffix: String::from(".meta.json"),
            enable_hot_reload: false,
        }
    }
}

/// Version manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionManagerConfig {
    /// Batch size used when fetching upstream metadata for comparison.
    pub batch_size: usize,
    /// Snapshots retained per rule (newest-first ring buffer).
    pub max_snapshots_per_rule: usize,
    /// Retry attempts for `invalidate_rules` reloads.
    pub max_retries: u32,
    /// Delay between reload retries.
    pub retry_delay: Duration,
}

impl Default for VersionManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_snapshots_per_rule: 5,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk size used by `execute_batch` to cap fan-out.
    pub max_concurrency: usize,
    /// Whether a per-item error becomes a `_system` validation error
    /// instead of aborting the whole batch.
    pub continue_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            continue_on_error: true,
        }
    }
}

/// Memory-pressure cache cleanup tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagementConfig {
    /// Occupancy fraction (0.0-1.0 of `cache.max_size`) at which a warning is logged.
    pub warning_threshold: f64,
    /// Occupancy fraction at which unsolicited eviction is triggered.
    pub critical_threshold: f64,
    /// How often the cleanup check runs.
    pub cleanup_interval: Duration,
}

impl Default for MemoryManagementConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Aggregate runtime configuration handed to every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which loader implementation is active.
    pub rule_source: RuleSource,
    /// Cache tuning.
    pub cache: CacheConfig,
    /// Connection pool tuning (remote loader only).
    pub pool: PoolConfig,
    /// Request batcher tuning (remote loader only).
    pub batching: BatcherConfig,
    /// Payload compression tuning.
    pub compression: CompressionConfig,
    /// Remote registry loader tuning.
    pub remote: RemoteLoaderConfig,
    /// Local directory loader tuning.
    pub local: LocalLoaderConfig,
    /// Version manager tuning.
    pub version: VersionManagerConfig,
    /// Execution engine tuning.
    pub engine: EngineConfig,
    /// Memory-pressure cleanup tuning.
    pub memory_management: MemoryManagementConfig,
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rule_source: RuleSource::Local,
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            batching: BatcherConfig::default(),
            compression: CompressionConfig::default(),
            remote: RemoteLoaderConfig::default(),
            local: LocalLoaderConfig::default(),
            version: VersionManagerConfig::default(),
            engine: EngineConfig::default(),
            memory_management: MemoryManagementConfig::default(),
            log_filter: String::from("info"),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from compiled defaults, optionally overlaid by a
    /// JSON file, then by `RULECORE_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::merge_file(config, path)?;
        }

        config.apply_env_overrides(&std::env::vars().collect())?;
        config.validate()?;

        Ok(config)
    }

    fn merge_file(base: Self, path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;

        let file_config: RuntimeConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::InvalidJson {
                path: path.display().to_string(),
                source,
            })?;

        let _ = base;
        Ok(file_config)
    }

    fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = env.get("RULECORE_RULE_SOURCE") {
            self.rule_source = match v.to_ascii_lowercase().as_str() {
                "cloud" => RuleSource::Cloud,
                "local" => RuleSource::Local,
                other => {
                    return Err(ConfigError::InvalidEnvValue {
                        key: "RULECORE_RULE_SOURCE".into(),
                        message: format!("expected cloud|local, got {other}"),
                    })
                }
            };
        }
        if let Some(v) = env.get("RULECORE_CACHE__MAX_SIZE") {
            self.cache.max_size = parse_env(v, "RULECORE_CACHE__MAX_SIZE")?;
        }
        if let Some(v) = env.get("RULECORE_POOL__MAX_CONNECTIONS") {
            self.pool.max_connections = parse_env(v, "RULECORE_POOL__MAX_CONNECTIONS")?;
        }
        if let Some(v) = env.get("RULECORE_REMOTE__API_URL") {
            self.remote.api_url = v.clone();
        }
        if let Some(v) = env.get("RULECORE_REMOTE__API_KEY") {
            self.remote.api_key = v.clone();
        }
        if let Some(v) = env.get("RULECORE_REMOTE__PROJECT_ID") {
            self.remote.project_id = v.clone();
        }
        if let Some(v) = env.get("RULECORE_LOCAL__ROOT") {
            self.local.root = v.clone();
        }
        if let Some(v) = env.get("RULECORE_LOG_FILTER") {
            self.log_filter = v.clone();
        }

        Ok(())
    }

    /// Validate required fields for the selected rule source, failing fast
    /// rather than letting the loader discover the gap later.
    pub fn validate(&self) -> Result<()> {
        match self.rule_source {
            RuleSource::Cloud => {
                if self.remote.api_url.is_empty() {
                    return Err(ConfigError::Invalid(
                        "rule_source=cloud requires remote.api_url".into(),
                    ));
                }
                if self.remote.project_id.is_empty() {
                    return Err(ConfigError::Invalid(
                        "rule_source=cloud requires remote.project_id".into(),
                    ));
                }
            }
            RuleSource::Local => {
                if self.local.root.is_empty() {
                    return Err(ConfigError::Invalid(
                        "rule_source=local requires local.root".into(),
                    ));
                }
            }
        }

        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid("cache.max_size must be > 0".into()));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value.parse().map_err(|_| ConfigError::InvalidEnvValue {
        key: key.to_string(),
        message: format!("could not parse {value:?}"),
    })
}
