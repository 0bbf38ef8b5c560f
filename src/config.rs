//! Configuration
//!
//! YAML configuration for the store, the cache manager, the streaming
//! consumers and every registered namespace.
//!
//! # Example
//!
//! ```yaml
//! store:
//!   root_dir: /var/lib/nscache
//! namespaces:
//!   - name: countries
//!     source:
//!       kind: bulk_relational
//!       connection: "host=db user=lookup dbname=ref"
//!       table: public.countries
//!       version_column: last_updated
//!     key_column: code
//!     value_columns: [name, region]
//!     refresh_period: 10m
//!     backend: durable
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::SourceQuery;
use crate::error::{Error, Result};
use crate::store::compression::CompressionConfig;

/// Maximum namespace name length
pub const MAX_NAMESPACE_NAME_LEN: usize = 128;

// =============================================================================
// Enumerations
// =============================================================================

/// Kind of source of truth behind a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Periodic snapshot pulled from a relational database
    BulkRelational,
    /// Bootstrap from a compacted update log, then live streaming
    InMemoryStreamed,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::BulkRelational => write!(f, "bulk_relational"),
            SourceKind::InMemoryStreamed => write!(f, "in_memory_streamed"),
        }
    }
}

/// Backing storage for a namespace's generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process concurrent map; nothing survives a restart
    #[default]
    Memory,
    /// Embedded on-disk store, one region per generation
    Durable,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Durable => write!(f, "durable"),
        }
    }
}

/// Where a consumer starts when it has no usable checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

/// What a consumer does when the log no longer holds the offset it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Log, then continue from the earliest retained offset
    #[default]
    ResumeFromEarliest,
    /// Continue from the earliest retained offset and force a full reload
    ForceReload,
}

// =============================================================================
// Namespace Configuration
// =============================================================================

/// Source descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    BulkRelational {
        /// Driver connection string
        #[serde(default)]
        connection: Option<String>,
        /// Table name, optionally schema-qualified
        table: String,
        /// Row filter passed through to the source
        #[serde(default)]
        filter: Option<String>,
        /// Column whose maximum identifies the snapshot version
        #[serde(default)]
        version_column: Option<String>,
        /// Connection pool size
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
    InMemoryStreamed {
        /// Compacted topic used both for bootstrap and live updates
        topic: String,
    },
}

/// Streamed update subscription for a bulk namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesConfig {
    pub topic: String,
    #[serde(default)]
    pub start_from: StartPosition,
}

/// Configuration of one namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Unique namespace name
    pub name: String,

    /// Source of truth
    pub source: SourceConfig,

    /// Column holding the lookup key
    pub key_column: String,

    /// Columns stored in the value
    pub value_columns: Vec<String>,

    /// Column returned by a plain lookup (defaults to the first value column)
    #[serde(default)]
    pub default_value_column: Option<String>,

    /// Period between scheduled full reloads; zero loads once
    #[serde(with = "duration_format", default = "default_refresh_period")]
    pub refresh_period: Duration,

    /// Storage backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Fraction of undecodable records tolerated per load
    #[serde(default = "default_max_decode_error_rate")]
    pub max_decode_error_rate: f64,

    /// Streamed updates held while the namespace is not Ready
    #[serde(default = "default_update_buffer_capacity")]
    pub update_buffer_capacity: usize,

    /// Optional streamed updates for a bulk namespace
    #[serde(default)]
    pub updates: Option<UpdatesConfig>,
}

impl NamespaceConfig {
    /// Create a bulk relational namespace with defaults.
    pub fn bulk(
        name: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
        value_columns: &[&str],
    ) -> Self {
        Self::with_source(
            name,
            SourceConfig::BulkRelational {
                connection: None,
                table: table.into(),
                filter: None,
                version_column: None,
                pool_size: default_pool_size(),
            },
            key_column,
            value_columns,
        )
    }

    /// Create a streamed namespace with defaults.
    pub fn streamed(
        name: impl Into<String>,
        topic: impl Into<String>,
        key_column: impl Into<String>,
        value_columns: &[&str],
    ) -> Self {
        Self::with_source(
            name,
            SourceConfig::InMemoryStreamed {
                topic: topic.into(),
            },
            key_column,
            value_columns,
        )
    }

    fn with_source(
        name: impl Into<String>,
        source: SourceConfig,
        key_column: impl Into<String>,
        value_columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            source,
            key_column: key_column.into(),
            value_columns: value_columns.iter().map(|c| c.to_string()).collect(),
            default_value_column: None,
            refresh_period: default_refresh_period(),
            backend: StoreBackend::default(),
            max_decode_error_rate: default_max_decode_error_rate(),
            update_buffer_capacity: default_update_buffer_capacity(),
            updates: None,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self.source {
            SourceConfig::BulkRelational { .. } => SourceKind::BulkRelational,
            SourceConfig::InMemoryStreamed { .. } => SourceKind::InMemoryStreamed,
        }
    }

    /// Query issued by the bulk factory, if this is a bulk namespace.
    pub fn bulk_query(&self) -> Option<SourceQuery> {
        match &self.source {
            SourceConfig::BulkRelational {
                table,
                filter,
                version_column,
                ..
            } => {
                let mut columns = Vec::with_capacity(self.value_columns.len() + 1);
                columns.push(self.key_column.clone());
                for column in &self.value_columns {
                    if !columns.contains(column) {
                        columns.push(column.clone());
                    }
                }
                Some(SourceQuery {
                    table: table.clone(),
                    columns,
                    filter: filter.clone(),
                    version_column: version_column.clone(),
                })
            }
            SourceConfig::InMemoryStreamed { .. } => None,
        }
    }

    /// Topic carrying streamed updates for this namespace, if any.
    pub fn update_topic(&self) -> Option<&str> {
        match &self.source {
            SourceConfig::InMemoryStreamed { topic } => Some(topic),
            SourceConfig::BulkRelational { .. } => self.updates.as_ref().map(|u| u.topic.as_str()),
        }
    }

    /// Consumer start position without a checkpoint. Streamed namespaces
    /// always replay from the start of their compacted topic.
    pub fn start_position(&self) -> StartPosition {
        match (&self.source, &self.updates) {
            (SourceConfig::BulkRelational { .. }, Some(updates)) => updates.start_from,
            _ => StartPosition::Earliest,
        }
    }

    /// Column returned by a plain lookup.
    pub fn default_column(&self) -> Option<&str> {
        self.default_value_column
            .as_deref()
            .or_else(|| self.value_columns.first().map(String::as_str))
    }

    /// Validate this namespace in isolation.
    pub fn validate(&self) -> Result<()> {
        validate_namespace_name(&self.name)?;

        if self.key_column.trim().is_empty() {
            return Err(Error::Config(format!(
                "namespace {}: key_column must not be empty",
                self.name
            )));
        }
        if self.value_columns.is_empty() {
            return Err(Error::Config(format!(
                "namespace {}: at least one value column is required",
                self.name
            )));
        }
        if let Some(column) = &self.default_value_column {
            if !self.value_columns.contains(column) {
                return Err(Error::Config(format!(
                    "namespace {}: default_value_column {} is not a value column",
                    self.name, column
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.max_decode_error_rate) {
            return Err(Error::Config(format!(
                "namespace {}: max_decode_error_rate must be within [0, 1], got {}",
                self.name, self.max_decode_error_rate
            )));
        }
        if self.update_buffer_capacity == 0 {
            return Err(Error::Config(format!(
                "namespace {}: update_buffer_capacity must be positive",
                self.name
            )));
        }
        if let SourceConfig::BulkRelational { table, .. } = &self.source {
            if table.trim().is_empty() {
                return Err(Error::Config(format!(
                    "namespace {}: table must not be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Check that a namespace name is structurally valid.
///
/// Names double as directory names in the durable store, so they are limited
/// to `[A-Za-z0-9_.-]`, may not start with `.`, and are at most
/// [`MAX_NAMESPACE_NAME_LEN`] characters.
pub fn validate_namespace_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAMESPACE_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidNamespace(name.to_string()))
    }
}

// =============================================================================
// Component Configuration
// =============================================================================

/// Durable store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for generation regions and offsets
    pub root_dir: PathBuf,
    /// Maximum regions open at once across all namespaces
    pub max_open_regions: usize,
    /// Stored value compression
    pub compression: CompressionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data"),
            max_open_regions: 256,
            compression: CompressionConfig::default(),
        }
    }
}

/// Cache manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Time in-flight loads get to finish on shutdown
    #[serde(with = "duration_format")]
    pub shutdown_grace_period: Duration,
    /// First retry delay after a retryable failure
    #[serde(with = "duration_format")]
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay
    #[serde(with = "duration_format")]
    pub max_retry_backoff: Duration,
    /// Entries written per store transaction during a full load
    pub write_batch_size: usize,
    /// Interval between sweeps of retired generations
    #[serde(with = "duration_format")]
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(5),
            max_retry_backoff: Duration::from_secs(300),
            write_batch_size: 10_000,
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Streaming consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum records per fetch
    pub batch_size: usize,
    /// Long-poll wait when the partition is idle
    #[serde(with = "duration_format")]
    pub poll_wait: Duration,
    /// Maximum time between checkpoints
    #[serde(with = "duration_format")]
    pub checkpoint_interval: Duration,
    /// Maximum applied records between checkpoints
    pub checkpoint_every: u64,
    /// Behaviour on offset gaps
    pub gap_policy: GapPolicy,
    /// Delay after a transport or store error
    #[serde(with = "duration_format")]
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_wait: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(10),
            checkpoint_every: 1_000,
            gap_policy: GapPolicy::default(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Update transport configuration used by the binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Directory holding one sub-directory of partition files per topic
    pub log_dir: PathBuf,
    /// Partitions created for a topic seen for the first time
    pub partitions: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/logs"),
            partitions: 1,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub manager: ManagerConfig,
    pub consumer: ConsumerConfig,
    pub transport: TransportConfig,
    pub namespaces: Vec<NamespaceConfig>,
}

impl AppConfig {
    /// Parse and validate YAML configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Validate cross-namespace constraints and every namespace.
    pub fn validate(&self) -> Result<()> {
        if self.store.max_open_regions == 0 {
            return Err(Error::Config(
                "store.max_open_regions must be positive".to_string(),
            ));
        }
        if self.manager.write_batch_size == 0 {
            return Err(Error::Config(
                "manager.write_batch_size must be positive".to_string(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(Error::Config(
                "consumer.batch_size must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for namespace in &self.namespaces {
            namespace.validate()?;
            if let SourceConfig::BulkRelational {
                connection: None, ..
            } = namespace.source
            {
                return Err(Error::Config(format!(
                    "namespace {}: bulk_relational source needs a connection string",
                    namespace.name
                )));
            }
            if !seen.insert(namespace.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate namespace: {}",
                    namespace.name
                )));
            }
        }
        Ok(())
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_refresh_period() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_decode_error_rate() -> f64 {
    0.1
}

fn default_update_buffer_capacity() -> usize {
    10_000
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration string such as `"90s"`, `"5m"`, `"1h30m"` or `"2d"`.
///
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
        } else {
            let num: u64 = num_buf
                .parse()
                .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
            num_buf.clear();

            let multiplier = match c {
                'd' | 'D' => 86400,
                'h' | 'H' => 3600,
                'm' | 'M' => 60,
                's' | 'S' => 1,
                _ => {
                    return Err(Error::DurationParse(format!(
                        "unknown duration unit: {}",
                        c
                    )))
                }
            };

            total_secs += num * multiplier;
        }
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs += num;
    }

    Ok(Duration::from_secs(total_secs))
}

/// Format a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let mut rest = secs;
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60), ("s", 1)] {
        if rest >= size {
            out.push_str(&format!("{}{}", rest / size, unit));
            rest %= size;
        }
    }
    out
}

/// Serde adapter accepting `"5m"` style strings or integer seconds.
pub mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
