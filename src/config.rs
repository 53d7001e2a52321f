//! Configuration types for usenet-indexer
//!
//! Every section has sensible defaults so an empty JSON object (`{}`) is a
//! valid configuration pointing at `localhost:119`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{path::Path, path::PathBuf, time::Duration};

/// Main configuration for the indexer
///
/// Fields are organized into sub-configs:
/// - [`server`](NewsServerConfig) - upstream news server connection
/// - [`scan`](ScanConfig) - group scanning and batch processing limits
/// - [`release`](ReleaseConfig) - release finalization policy
/// - [`persistence`](PersistenceConfig) - database location
/// - [`retry`](RetryConfig) - bounded retry for transient protocol failures
/// - [`publish`](PublishConfig) - optional release publishing hosts
/// - [`categories`](CategoryConfig) - rules for the built-in category classifier
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// News server connection settings
    #[serde(default)]
    pub server: NewsServerConfig,

    /// Scanning and batch processing settings
    #[serde(default)]
    pub scan: ScanConfig,

    /// Release finalization policy
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Retry policy for scan windows and reconnects
    #[serde(default)]
    pub retry: RetryConfig,

    /// Release publishing
    #[serde(default)]
    pub publish: PublishConfig,

    /// Category classification rules
    #[serde(default)]
    pub categories: CategoryConfig,
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            message: format!("failed to read config file '{}': {}", path.display(), e),
            key: None,
        })?;

        let config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            message: format!("failed to parse config file '{}': {}", path.display(), e),
            key: None,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline stall or spin
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Error {
            Error::Config {
                message: message.to_string(),
                key: Some(key.to_string()),
            }
        }

        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "server host must not be empty"));
        }
        if self.scan.update_threads == 0 {
            return Err(invalid("scan.update_threads", "at least one scan thread is required"));
        }
        if self.scan.message_scan_limit == 0 {
            return Err(invalid("scan.message_scan_limit", "message limit must be positive"));
        }
        if self.scan.group_scan_limit == Some(0) {
            return Err(invalid(
                "scan.group_scan_limit",
                "group scan limit must be positive or null",
            ));
        }
        if self.scan.part_chunk_size == 0
            || self.scan.binary_process_chunk_size == 0
            || self.scan.release_chunk_size == 0
        {
            return Err(invalid("scan", "chunk sizes must be positive"));
        }
        for (idx, host) in self.publish.hosts.iter().enumerate() {
            url::Url::parse(host).map_err(|e| Error::Config {
                message: format!("invalid publish host '{}': {}", host, e),
                key: Some(format!("publish.hosts[{}]", idx)),
            })?;
        }
        for (idx, rule) in self.categories.rules.iter().enumerate() {
            crate::patterns::compile_pattern(&rule.pattern).map_err(|e| Error::Config {
                message: format!("invalid category pattern '{}': {}", rule.pattern, e),
                key: Some(format!("categories.rules[{}]", idx)),
            })?;
        }
        Ok(())
    }
}

/// Upstream news server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewsServerConfig {
    /// Server hostname
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use implicit TLS
    #[serde(default)]
    pub tls: bool,

    /// Username for AUTHINFO
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Read/connect timeout for every protocol exchange (default: 60 seconds)
    #[serde(default = "default_server_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for NewsServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            username: None,
            password: None,
            timeout: default_server_timeout(),
        }
    }
}

// Conversion from our NewsServerConfig to nntp-rs's ServerConfig
impl From<&NewsServerConfig> for nntp_rs::ServerConfig {
    fn from(config: &NewsServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: false,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        }
    }
}

/// Group scanning and batch-processing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Number of concurrent group scanners, each with its own connection (default: 4)
    #[serde(default = "default_update_threads")]
    pub update_threads: usize,

    /// Sleep between update cycles (default: 300 seconds)
    #[serde(default = "default_update_wait", with = "duration_serde")]
    pub update_wait: Duration,

    /// Maximum articles requested in one overview window (default: 20000)
    #[serde(default = "default_message_scan_limit")]
    pub message_scan_limit: u64,

    /// Maximum articles taken from one group per update cycle (None = unlimited)
    #[serde(default = "default_group_scan_limit")]
    pub group_scan_limit: Option<u64>,

    /// How far back a never-scanned group starts, in days (default: 5)
    #[serde(default = "default_new_group_scan_days")]
    pub new_group_scan_days: u32,

    /// Default backfill target age, in days (default: 10)
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,

    /// Re-request article ids that were absent from overview responses (default: false)
    #[serde(default)]
    pub retry_missed: bool,

    /// Attempts per missed article id before it is given up (default: 3)
    #[serde(default = "default_miss_retry_limit")]
    pub miss_retry_limit: u32,

    /// Stored segment count above which parts are processed before scanning
    /// (None = never process early)
    #[serde(default = "default_early_process_threshold")]
    pub early_process_threshold: Option<u64>,

    /// Age in days after which unmatched parts and incomplete binaries are deleted
    /// (default: 1, 0 disables reaping)
    ///
    /// Set this to 0 while backfilling, otherwise freshly backfilled parts that are
    /// older than the age are reaped before they can be assembled.
    #[serde(default = "default_dead_binary_age_days")]
    pub dead_binary_age_days: u32,

    /// How long a part without a part/total marker waits before it is treated as a
    /// single-part binary (default: 3 hours)
    #[serde(default = "default_orphan_grace_period", with = "duration_serde")]
    pub orphan_grace_period: Duration,

    /// Parts written per transaction by the aggregator (default: 500)
    #[serde(default = "default_part_chunk_size")]
    pub part_chunk_size: usize,

    /// Parts matched per assembler chunk (default: 10000)
    #[serde(default = "default_binary_process_chunk_size")]
    pub binary_process_chunk_size: usize,

    /// Binaries finalized per release chunk (default: 500)
    #[serde(default = "default_release_chunk_size")]
    pub release_chunk_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            update_threads: default_update_threads(),
            update_wait: default_update_wait(),
            message_scan_limit: default_message_scan_limit(),
            group_scan_limit: default_group_scan_limit(),
            new_group_scan_days: default_new_group_scan_days(),
            backfill_days: default_backfill_days(),
            retry_missed: false,
            miss_retry_limit: default_miss_retry_limit(),
            early_process_threshold: default_early_process_threshold(),
            dead_binary_age_days: default_dead_binary_age_days(),
            orphan_grace_period: default_orphan_grace_period(),
            part_chunk_size: default_part_chunk_size(),
            binary_process_chunk_size: default_binary_process_chunk_size(),
            release_chunk_size: default_release_chunk_size(),
        }
    }
}

/// Release finalization policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Minimum number of archive-bearing (rar/zip-like) parts a binary needs
    /// to become a release (default: 1, 0 disables the check)
    ///
    /// Either one number for every group or a map of group name to minimum,
    /// e.g. `{"alt.binaries.e-books": 0, "*": 1}`.
    #[serde(default)]
    pub min_archives: MinArchives,
}

/// Archive minimum, globally or per group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MinArchives {
    /// Same minimum for every group
    Global(u32),
    /// Minimum by exact group name; `*` covers groups not listed
    PerGroup(BTreeMap<String, u32>),
}

impl MinArchives {
    /// Minimum that applies to binaries posted in `group`
    ///
    /// A per-group map without an entry for `group` or `*` falls back to the
    /// global default.
    pub fn for_group(&self, group: &str) -> u32 {
        match self {
            MinArchives::Global(min) => *min,
            MinArchives::PerGroup(by_group) => by_group
                .get(group)
                .or_else(|| by_group.get("*"))
                .copied()
                .unwrap_or_else(default_min_archives),
        }
    }
}

impl Default for MinArchives {
    fn default() -> Self {
        MinArchives::Global(default_min_archives())
    }
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "./indexer.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 15 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Release publishing configuration
///
/// When enabled, every newly created release is POSTed as JSON to each host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Enable publishing (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Full URLs to POST release summaries to
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Request timeout (default: 10 seconds)
    #[serde(default = "default_publish_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            timeout: default_publish_timeout(),
        }
    }
}

/// Rules for the built-in category classifier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Category assigned when no rule matches (default: 7010)
    #[serde(default = "default_category_id")]
    pub default_id: i64,

    /// Display name of the default category (default: "Misc")
    #[serde(default = "default_category_name")]
    pub default_name: String,

    /// Ordered rules, first match wins
    #[serde(default)]
    pub rules: Vec<CategoryRule>,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            default_id: default_category_id(),
            default_name: default_category_name(),
            rules: Vec::new(),
        }
    }
}

/// One classifier rule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Case-insensitive pattern matched against the release name
    pub pattern: String,

    /// Restrict the rule to groups starting with this prefix
    #[serde(default)]
    pub group_prefix: Option<String>,

    /// Category id assigned on match
    pub id: i64,

    /// Category display name written into NZB metadata
    pub name: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    119
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_update_threads() -> usize {
    4
}

fn default_update_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_message_scan_limit() -> u64 {
    20_000
}

fn default_group_scan_limit() -> Option<u64> {
    Some(2_000_000)
}

fn default_new_group_scan_days() -> u32 {
    5
}

fn default_backfill_days() -> u32 {
    10
}

fn default_miss_retry_limit() -> u32 {
    3
}

fn default_early_process_threshold() -> Option<u64> {
    Some(50_000_000)
}

fn default_dead_binary_age_days() -> u32 {
    1
}

fn default_orphan_grace_period() -> Duration {
    Duration::from_secs(3 * 60 * 60)
}

fn default_part_chunk_size() -> usize {
    500
}

fn default_binary_process_chunk_size() -> usize {
    10_000
}

fn default_release_chunk_size() -> usize {
    500
}

fn default_min_archives() -> u32 {
    1
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./indexer.db")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_category_id() -> i64 {
    7010
}

fn default_category_name() -> String {
    "Misc".to_string()
}

// Duration serialization helper (seconds)
mod duration_serde {
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
