//! Configuration for the shipper
//!
//! Loaded from a YAML file with `${VAR}` / `${VAR:-default}` environment
//! expansion. Validation failures are fatal at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Result, ShipperError};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ShipperConfig {
    /// Service name used in logs
    #[serde(default = "default_service_name")]
    pub service: String,

    /// Consumer group id
    #[validate(length(min = 1, max = 249))]
    pub group: String,

    /// Topics to ship
    #[validate(length(min = 1))]
    pub topics: Vec<String>,

    /// Local staging directory for open and finalized files
    pub local_path: PathBuf,

    /// Remote root URI (`s3://bucket/root`, `file:///path`, `memory://`)
    #[validate(length(min = 1))]
    pub remote_uri: String,

    /// Consumer generation; bumped across non-compatible releases so old
    /// and new files coexist
    #[serde(default)]
    pub generation: u32,

    /// Output file settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Message parser settings
    #[serde(default)]
    #[validate(nested)]
    pub parser: ParserConfig,

    /// Flush policy settings
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Upload settings
    #[serde(default)]
    pub uploader: UploaderConfig,

    /// Consumer loop settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_service_name() -> String {
    "loghaul".to_string()
}

/// Record format written to local files and uploaded
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Byte-framed records separated by a delimiter
    #[default]
    Delimited,
    /// Length-prefixed binary key/value records
    Sequence,
}

/// Compression applied beneath the record format
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
    /// Present for parity with topic settings; the built-in codecs write
    /// these topics uncompressed
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Extension suffix contributed by the compression layer
    pub fn extension_suffix(&self) -> &'static str {
        match self {
            CompressionKind::Gzip => ".gz",
            _ => "",
        }
    }

    /// Whether the built-in codecs actually compress for this kind
    pub fn is_gzip(&self) -> bool {
        matches!(self, CompressionKind::Gzip)
    }
}

/// Output file settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Record format
    #[serde(default)]
    pub codec: CodecKind,

    /// Compression codec of the topic; gzip maps to gzip output, anything
    /// else to uncompressed output for the built-in codecs
    #[serde(default)]
    pub compression: CompressionKind,

    /// File extension before the compression suffix (e.g. ".log")
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Optional remote object key pattern; when set it replaces the default
    /// `topic/partitions/basename` layout after the remote prefix
    #[serde(default)]
    pub file_pattern: Option<String>,

    /// Delimiter byte expected between records on read
    #[serde(default = "default_delimiter")]
    pub reader_delimiter: u8,

    /// Delimiter byte appended after each record; `None` appends nothing
    #[serde(default = "default_writer_delimiter")]
    pub writer_delimiter: Option<u8>,
}

fn default_extension() -> String {
    ".log".to_string()
}

fn default_delimiter() -> u8 {
    b'\n'
}

fn default_writer_delimiter() -> Option<u8> {
    Some(b'\n')
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::default(),
            compression: CompressionKind::default(),
            extension: default_extension(),
            file_pattern: None,
            reader_delimiter: default_delimiter(),
            writer_delimiter: default_writer_delimiter(),
        }
    }
}

impl OutputConfig {
    /// Full extension including the compression suffix
    pub fn full_extension(&self) -> String {
        format!("{}{}", self.extension, self.compression.extension_suffix())
    }
}

/// Parser variant selector
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Timestamp field from the payload, formatted into date partitions
    #[default]
    Timestamped,
    /// Like `timestamped`, but string timestamps are parsed with a
    /// configurable input pattern, with optional per-record folder prefixes
    PatternDate,
    /// Date is "now"; a second `offset=` partition buckets by offset range
    DailyOffset,
}

/// Unit of numeric timestamps in payloads
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum TimestampUnit {
    #[serde(rename = "s")]
    Seconds,
    #[default]
    #[serde(rename = "ms")]
    Millis,
    #[serde(rename = "ns")]
    Nanos,
}

/// Message parser settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ParserConfig {
    /// Parser variant
    #[serde(default)]
    pub kind: ParserKind,

    /// Payload field holding the timestamp (dotted path)
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    /// Fallback payload field consulted when the primary one is absent
    #[serde(default)]
    pub fallback_timestamp_field: Option<String>,

    /// Unit of numeric timestamp values
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,

    /// Date-parse pattern for string timestamps (`pattern_date` only)
    #[serde(default)]
    pub input_pattern: Option<String>,

    /// Output format of the date partition
    #[serde(default = "default_output_format")]
    pub output_format: String,

    /// Append an `hr=HH` partition
    #[serde(default)]
    pub hourly: bool,

    /// Append a `min=MM` partition (implies hourly granularity)
    #[serde(default)]
    pub minutely: bool,

    /// Time zone the date partition is rendered in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Partition receiving messages whose parse failed
    #[serde(default = "default_fallback_partition")]
    pub fallback_partition: String,

    /// Prepend a per-record folder prefix to the date partition
    #[serde(default)]
    pub prefix_enabled: bool,

    /// Payload field (dotted path) selecting the folder prefix
    #[serde(default)]
    pub prefix_identifier: String,

    /// Identifier value to folder mapping; must contain `DEFAULT` when
    /// prefixing is enabled
    #[serde(default)]
    pub prefix_mapping: Option<HashMap<String, String>>,

    /// Dotted payload path of the routing label exposed to the
    /// `{message_channel_identifier}` placeholder
    #[serde(default)]
    pub channel_identifier: Option<String>,

    /// Offset bucket width of the `daily_offset` parser
    #[serde(default = "default_offsets_per_partition")]
    #[validate(range(min = 1))]
    pub offsets_per_partition: u64,
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_output_format() -> String {
    "dt=%Y-%m-%d".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_fallback_partition() -> String {
    "dt=1970-01-01".to_string()
}

fn default_offsets_per_partition() -> u64 {
    10_000
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            kind: ParserKind::default(),
            timestamp_field: default_timestamp_field(),
            fallback_timestamp_field: None,
            timestamp_unit: TimestampUnit::default(),
            input_pattern: None,
            output_format: default_output_format(),
            hourly: false,
            minutely: false,
            timezone: default_timezone(),
            fallback_partition: default_fallback_partition(),
            prefix_enabled: false,
            prefix_identifier: String::new(),
            prefix_mapping: None,
            channel_identifier: None,
            offsets_per_partition: default_offsets_per_partition(),
        }
    }
}

/// Which file's age trips the age threshold
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgePolicy {
    /// Age of the oldest open file, measured from its creation
    #[default]
    Oldest,
    /// Age of the most recent write across open files
    Newest,
}

/// Flush policy settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Flush when any open file reaches this many on-disk bytes
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,

    /// Flush when the age threshold is reached
    #[serde(default = "default_max_file_age_seconds")]
    pub max_file_age_seconds: u64,

    /// Basis of the age threshold
    #[serde(default)]
    pub age_policy: AgePolicy,

    /// Flush when any open file holds this many records (0 disables)
    #[serde(default)]
    pub max_file_records: u64,
}

fn default_max_file_size_bytes() -> u64 {
    200 * 1024 * 1024
}

fn default_max_file_age_seconds() -> u64 {
    3600
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
            max_file_age_seconds: default_max_file_age_seconds(),
            age_policy: AgePolicy::default(),
            max_file_records: 0,
        }
    }
}

/// Upload settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploaderConfig {
    /// Retries per upload or offset commit after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Concurrent uploads across all partitions
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_parallelism() -> usize {
    8
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            parallelism: default_parallelism(),
        }
    }
}

/// Consumer loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Messages pulled per poll
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Sleep between empty polls, in milliseconds; also the cadence of
    /// timer-driven policy checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Flush and exit once the source runs dry instead of idling; meant for
    /// backfill runs and for draining staged files
    #[serde(default)]
    pub exit_on_idle: bool,

    /// How long a cooperative shutdown may drain before the process exits
    /// without advancing offsets for still-flushing partitions
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_poll_batch_size() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_seconds() -> u64 {
    60
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: default_poll_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            exit_on_idle: false,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl ShipperConfig {
    /// Load a configuration file, expanding environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when the file is unreadable, the YAML does
    /// not deserialize, or validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShipperError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ShipperError::config(e.to_string()))?;
        if self.parser.prefix_enabled {
            let mapping = self.parser.prefix_mapping.as_ref().ok_or_else(|| {
                ShipperError::config("prefix_enabled requires parser.prefix_mapping")
            })?;
            if !mapping.contains_key("DEFAULT") {
                return Err(ShipperError::config(
                    "parser.prefix_mapping must contain a DEFAULT entry",
                ));
            }
            if self.parser.prefix_identifier.is_empty() {
                return Err(ShipperError::config(
                    "prefix_enabled requires parser.prefix_identifier",
                ));
            }
        }
        if self.parser.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ShipperError::config(format!(
                "unknown time zone {}",
                self.parser.timezone
            )));
        }
        if self.uploader.parallelism == 0 {
            return Err(ShipperError::config("uploader.parallelism must be > 0"));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references from the environment
fn expand_env_vars(raw: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_else(
                    || caps[0].to_string(), // leave unresolved references visible
                ),
            }
        })
        .into_owned()
}
