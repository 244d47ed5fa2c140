//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.
//!
//! The live configuration is published as a [`SharedConfig`] snapshot.
//! [`spawn_refresh`] periodically re-reads the file and swaps in a new
//! snapshot with only the routing table replaced; every other section keeps
//! the values it had at startup.

use crate::backend::http::HttpSettings;
use crate::backend::PoolSettings;
use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Atomically swappable configuration snapshot
pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub rollup: RollupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stage-timing verbosity, 0 (off) to 5 (per cursor loop)
    #[serde(default)]
    pub debug_level: u8,
}

/// Tag schema registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_max_tag_slots")]
    pub max_tag_slots: usize,

    #[serde(default = "default_storage_group_count")]
    pub storage_group_count: u32,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Persist the tag mapping to `<data_dir>/tag_schema.json`
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_max_tag_slots() -> usize {
    50
}

fn default_storage_group_count() -> u32 {
    50
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tagbridge").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tagbridge_data".to_string())
}

fn default_persist() -> bool {
    true
}

impl SchemaConfig {
    pub fn schema_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tag_schema.json")
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_tag_slots: default_max_tag_slots(),
            storage_group_count: default_storage_group_count(),
            data_dir: default_data_dir(),
            persist: default_persist(),
        }
    }
}

/// Connection pool configuration, applied to every target
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_core_size")]
    pub core_size: usize,

    #[serde(default = "default_max_size")]
    pub max_size: usize,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_core_size() -> usize {
    2
}

fn default_max_size() -> usize {
    10
}

fn default_acquire_timeout() -> u64 {
    5000
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            core_size: self.core_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: default_core_size(),
            max_size: default_max_size(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

/// Shard routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Epoch boundaries, as epoch milliseconds or dates
    #[serde(default)]
    pub time_boundaries: Vec<Boundary>,

    /// One entry per epoch; must number `time_boundaries.len() + 1`
    #[serde(default = "default_epochs")]
    pub epochs: Vec<EpochConfig>,

    /// Optional protocol table: each metric hashes to one machine list
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

/// A time boundary between two epochs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Boundary {
    Millis(i64),
    Date(String),
}

impl Boundary {
    /// Epoch milliseconds of this boundary
    ///
    /// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (midnight UTC).
    pub fn to_millis(&self) -> Result<i64, ConfigError> {
        match self {
            Boundary::Millis(ms) => Ok(*ms),
            Boundary::Date(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(dt.timestamp_millis());
                }
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc().timestamp_millis())
                    .ok_or_else(|| ConfigError::Invalid(format!("Unparseable time boundary '{}'", s)))
            }
        }
    }
}

/// Instances serving one epoch
#[derive(Debug, Clone, Deserialize)]
pub struct EpochConfig {
    pub primary: Vec<String>,

    #[serde(default)]
    pub read_only: Vec<String>,
}

/// One protocol bucket's machine list
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub machines: Vec<String>,
}

fn default_epochs() -> Vec<EpochConfig> {
    vec![EpochConfig {
        primary: vec!["http://127.0.0.1:18080".to_string()],
        read_only: Vec::new(),
    }]
}

fn default_refresh_interval() -> u64 {
    1800 // 30 minutes
}

impl RoutingConfig {
    /// Check the epoch table is consistent with the boundaries
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs.len() != self.time_boundaries.len() + 1 {
            return Err(ConfigError::Invalid(format!(
                "{} time boundaries need {} epochs, found {}",
                self.time_boundaries.len(),
                self.time_boundaries.len() + 1,
                self.epochs.len()
            )));
        }

        if let Some(i) = self.epochs.iter().position(|e| e.primary.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "Epoch {} has no primary instances",
                i
            )));
        }

        if let Some(i) = self.protocols.iter().position(|p| p.machines.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "Protocol {} has no machines",
                i
            )));
        }

        let mut boundaries = self
            .time_boundaries
            .iter()
            .map(Boundary::to_millis)
            .collect::<Result<Vec<_>, _>>()?;
        let count = boundaries.len();
        boundaries.sort_unstable();
        boundaries.dedup();
        if boundaries.len() != count {
            return Err(ConfigError::Invalid(
                "Duplicate time boundaries".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            time_boundaries: Vec::new(),
            epochs: default_epochs(),
            protocols: Vec::new(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Remote backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_username() -> String {
    "root".to_string()
}

fn default_password() -> String {
    "root".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

impl BackendConfig {
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            username: self.username.clone(),
            password: self.password.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Rollup scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_max_rollups")]
    pub max_rollups: usize,

    /// Interval used when a task definition does not give one
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
}

fn default_max_rollups() -> usize {
    100
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            max_rollups: default_max_rollups(),
            default_interval_secs: default_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in Self::default_paths() {
            if path.exists() {
                match Self::load_with_env(&path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Config file locations searched by `load_default`, in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("tagbridge").join("config.toml")),
            Some(PathBuf::from("/etc/tagbridge/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.max_tag_slots == 0 {
            return Err(ConfigError::Invalid(
                "schema.max_tag_slots must be at least 1".to_string(),
            ));
        }
        if self.schema.storage_group_count == 0 {
            return Err(ConfigError::Invalid(
                "schema.storage_group_count must be at least 1".to_string(),
            ));
        }
        if self.pool.max_size == 0 || self.pool.core_size > self.pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool sizes are inconsistent (core_size = {}, max_size = {})",
                self.pool.core_size, self.pool.max_size
            )));
        }
        if self.debug_level > 5 {
            return Err(ConfigError::Invalid(format!(
                "debug_level must be between 0 and 5, found {}",
                self.debug_level
            )));
        }
        self.routing.validate()
    }

    /// Publish this configuration as a swappable snapshot
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self))
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Schema overrides
        if let Ok(data_dir) = std::env::var("TAGBRIDGE_DATA_DIR") {
            self.schema.data_dir = data_dir;
        }
        if let Ok(slots) = std::env::var("TAGBRIDGE_MAX_TAG_SLOTS") {
            if let Ok(s) = slots.parse() {
                self.schema.max_tag_slots = s;
            }
        }

        // Backend overrides
        if let Ok(username) = std::env::var("TAGBRIDGE_BACKEND_USER") {
            self.backend.username = username;
        }
        if let Ok(password) = std::env::var("TAGBRIDGE_BACKEND_PASSWORD") {
            self.backend.password = password;
        }

        // Routing override: a single epoch served by the listed instances
        if let Ok(primary) = std::env::var("TAGBRIDGE_PRIMARY") {
            let instances: Vec<String> = primary
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !instances.is_empty() {
                self.routing.time_boundaries.clear();
                self.routing.epochs = vec![EpochConfig {
                    primary: instances,
                    read_only: Vec::new(),
                }];
            }
        }

        if let Ok(level) = std::env::var("TAGBRIDGE_DEBUG_LEVEL") {
            if let Ok(l) = level.parse() {
                self.debug_level = l;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("TAGBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TAGBRIDGE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: SchemaConfig::default(),
            pool: PoolConfig::default(),
            routing: RoutingConfig::default(),
            backend: BackendConfig::default(),
            rollup: RollupConfig::default(),
            logging: LoggingConfig::default(),
            debug_level: 0,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Periodically reload the routing table from `path`
///
/// Each reload swaps in a copy of the current snapshot whose `routing`
/// section comes from the file; `on_reload` is then called with the new
/// snapshot. A file that fails to load or validate is logged and the
/// previous snapshot stays in place.
pub fn spawn_refresh<F>(shared: SharedConfig, path: PathBuf, on_reload: F) -> JoinHandle<()>
where
    F: Fn(&Config) + Send + Sync + 'static,
{
    let period = Duration::from_secs(shared.load().routing.refresh_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // The first tick fires immediately; the startup config is already current
        interval.tick().await;

        loop {
            interval.tick().await;

            match Config::load_with_env(&path) {
                Ok(loaded) => {
                    let mut next = Config::clone(&shared.load());
                    next.routing = loaded.routing;
                    let next = Arc::new(next);
                    shared.store(Arc::clone(&next));
                    on_reload(&next);
                    tracing::info!(
                        path = %path.display(),
                        epochs = next.routing.epochs.len(),
                        protocols = next.routing.protocols.len(),
                        "Reloaded routing configuration"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to reload routing configuration, keeping previous"
                    );
                }
            }
        }
    })
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tagbridge Configuration
#
# Environment variables override these settings:
# - TAGBRIDGE_DATA_DIR
# - TAGBRIDGE_MAX_TAG_SLOTS
# - TAGBRIDGE_BACKEND_USER
# - TAGBRIDGE_BACKEND_PASSWORD
# - TAGBRIDGE_PRIMARY (comma-separated; replaces the routing table with one epoch)
# - TAGBRIDGE_DEBUG_LEVEL
# - TAGBRIDGE_LOG_LEVEL
# - TAGBRIDGE_LOG_FORMAT

# Stage timing logs: 0 = off, 2 = per query, 3 = per metric,
# 4 = per stage, 5 = per cursor loop
debug_level = 0

[schema]
# Maximum number of distinct tag keys per metric
max_tag_slots = 50

# Number of storage groups metrics are spread over
storage_group_count = 50

# Directory holding tag_schema.json
data_dir = "~/.local/share/tagbridge"

# Persist the tag mapping across restarts
persist = true

[pool]
# Connections opened per instance at startup
core_size = 2

# Maximum concurrent connections per instance
max_size = 10

# How long to wait for a free connection (ms)
acquire_timeout_ms = 5000

[routing]
# Epoch boundaries (epoch ms or dates); N boundaries need N + 1 epochs
time_boundaries = []

# How often the routing table is re-read from this file (seconds)
refresh_interval_secs = 1800

[[routing.epochs]]
primary = ["http://127.0.0.1:18080"]
read_only = []

# Optional protocol table; when present, writes for a metric go to
# the machines of bucket crc32(metric) % number of protocols
# [[routing.protocols]]
# machines = ["http://127.0.0.1:18080"]

[backend]
username = "root"
password = "root"

# Per-request timeout (ms)
request_timeout_ms = 10000

[rollup]
# Maximum number of registered rollup tasks
max_rollups = 100

# Execution interval for tasks that do not specify one (seconds)
default_interval_secs = 3600

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_parses() {
        let config = Config::from_toml(&generate_default_config()).unwrap();
        assert_eq!(config.schema.max_tag_slots, 50);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.routing.epochs.len(), 1);
        assert_eq!(config.routing.refresh_interval_secs, 1800);
        assert_eq!(config.rollup.max_rollups, 100);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.pool.core_size, 2);
        assert_eq!(config.debug_level, 0);
        assert_eq!(config.routing.epochs[0].primary.len(), 1);
    }

    #[test]
    fn test_boundaries_accept_millis_and_dates() {
        let config = Config::from_toml(
            r#"
            [routing]
            time_boundaries = [3000, "2024-01-01", "2024-06-01T00:00:00Z"]

            [[routing.epochs]]
            primary = ["a"]
            [[routing.epochs]]
            primary = ["b"]
            [[routing.epochs]]
            primary = ["c"]
            [[routing.epochs]]
            primary = ["d"]
            read_only = ["d-replica"]
            "#,
        )
        .unwrap();

        let millis: Vec<i64> = config
            .routing
            .time_boundaries
            .iter()
            .map(|b| b.to_millis().unwrap())
            .collect();
        assert_eq!(millis, vec![3000, 1_704_067_200_000, 1_717_200_000_000]);
        assert_eq!(config.routing.epochs[3].read_only, vec!["d-replica"]);
    }

    #[test]
    fn test_epoch_count_must_match_boundaries() {
        let err = Config::from_toml(
            r#"
            [routing]
            time_boundaries = [3000]

            [[routing.epochs]]
            primary = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_pool_sizes() {
        let err = Config::from_toml("[pool]\ncore_size = 20\nmax_size = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debug_level = \"loud\"").unwrap();

        match Config::load(&path).unwrap_err() {
            ConfigError::Parse { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replaces_only_routing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "debug_level = 4\n[routing]\nrefresh_interval_secs = 10\n[[routing.epochs]]\nprimary = [\"new\"]\n",
        )
        .unwrap();

        let mut initial = Config::default();
        initial.routing.refresh_interval_secs = 10;
        let shared = initial.into_shared();

        let reloads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        let handle = spawn_refresh(Arc::clone(&shared), path, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        let current = shared.load();
        assert_eq!(current.routing.epochs[0].primary, vec!["new"]);
        assert_eq!(current.debug_level, 0);
        assert_eq!(reloads.load(std::sync::atomic::Ordering::SeqCst), 1);

        handle.abort();
    }
}
