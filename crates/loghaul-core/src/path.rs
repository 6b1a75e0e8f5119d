//! Log file addressing
//!
//! A [`LogFilePath`] names one output file of the shipper, locally while it
//! is being written and remotely once uploaded:
//!
//! ```text
//! prefix/topic/partition1/.../partitionN/generation_kafkaPartition_firstMessageOffset
//! ```
//!
//! `partition1..N` are logical partitions derived from message content
//! (e.g. `dt=2024-01-02`), distinct from the Kafka partition. The first
//! message offset is zero-padded to 20 digits so lexicographic file order is
//! offset order, and it makes re-uploads idempotent: retrying a file puts
//! the same bytes under the same object name.

use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime};
use rand::Rng;
use regex::Regex;

use crate::error::{Result, ShipperError};

/// Digits in a rendered first-message offset
const OFFSET_WIDTH: usize = 20;

/// Placeholder syntax in output file patterns: `{name}`
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("placeholder regex pattern is invalid - this is a bug")
});

/// Path of one log file
///
/// Immutable after construction. Files covering a single Kafka partition
/// (the common case) round-trip through [`render`](Self::render) and
/// [`parse`](Self::parse); merged multi-partition files render but are
/// rejected on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogFilePath {
    prefix: String,
    topic: String,
    partitions: Vec<String>,
    generation: u32,
    kafka_partitions: Vec<u32>,
    offsets: Vec<u64>,
    extension: String,
    channel_identifier: Vec<String>,
    output_pattern: Option<String>,
}

impl LogFilePath {
    /// Build a path, validating the partition/offset invariants.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation when the kafka partition and offset
    /// lists differ in length, are empty, or the kafka partitions are not
    /// consecutive ascending.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefix: impl Into<String>,
        topic: impl Into<String>,
        partitions: Vec<String>,
        generation: u32,
        kafka_partitions: Vec<u32>,
        offsets: Vec<u64>,
        extension: impl Into<String>,
    ) -> Result<Self> {
        if kafka_partitions.is_empty() || kafka_partitions.len() != offsets.len() {
            return Err(ShipperError::invariant(format!(
                "kafka partitions {:?} and offsets {:?} must be equal-length and non-empty",
                kafka_partitions, offsets
            )));
        }
        for pair in kafka_partitions.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(ShipperError::invariant(format!(
                    "non-consecutive kafka partitions {} and {}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self {
            prefix: prefix.into(),
            topic: topic.into(),
            partitions,
            generation,
            kafka_partitions,
            offsets,
            extension: extension.into(),
            channel_identifier: Vec::new(),
            output_pattern: None,
        })
    }

    /// Shorthand for the single Kafka partition case
    pub fn single(
        prefix: impl Into<String>,
        topic: impl Into<String>,
        partitions: Vec<String>,
        generation: u32,
        kafka_partition: u32,
        offset: u64,
        extension: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            prefix,
            topic,
            partitions,
            generation,
            vec![kafka_partition],
            vec![offset],
            extension,
        )
    }

    /// Same path rooted at a different prefix
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.prefix = prefix.into();
        path
    }

    /// Attach an output file pattern consulted by [`render`](Self::render)
    pub fn with_pattern(mut self, pattern: Option<String>) -> Self {
        self.output_pattern = pattern;
        self
    }

    /// Attach the message channel identifier used by the
    /// `{message_channel_identifier}` placeholder
    pub fn with_channel_identifier(mut self, identifier: Vec<String>) -> Self {
        self.channel_identifier = identifier;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn kafka_partitions(&self) -> &[u32] {
        &self.kafka_partitions
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// First message offset of the leading Kafka partition
    pub fn first_offset(&self) -> u64 {
        self.offsets[0]
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Directory holding the file: `prefix/topic/partition1/.../partitionN`
    pub fn file_dir(&self) -> String {
        let mut elements: Vec<&str> = Vec::with_capacity(2 + self.partitions.len());
        if !self.prefix.is_empty() {
            elements.push(&self.prefix);
        }
        if !self.topic.is_empty() {
            elements.push(&self.topic);
        }
        for partition in &self.partitions {
            elements.push(partition);
        }
        elements.join("/")
    }

    /// File basename without extension.
    ///
    /// Single Kafka partition: `generation_kafkaPartition_offset` with the
    /// offset zero-padded to 20 digits. Merged partitions:
    /// `generation_kpFirst-kpLast_digest` where the digest is the
    /// URL-safe unpadded base64 of the MD5 over the decimal offsets joined
    /// with `_`.
    pub fn basename(&self) -> String {
        if self.kafka_partitions.len() > 1 {
            let offsets = self
                .offsets
                .iter()
                .map(|o| o.to_string())
                .collect::<Vec<_>>()
                .join("_");
            let digest = md5::compute(offsets.as_bytes());
            use base64::Engine as _;
            let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.0);
            format!(
                "{}_{}-{}_{}",
                self.generation,
                self.kafka_partitions[0],
                self.kafka_partitions[self.kafka_partitions.len() - 1],
                encoded
            )
        } else {
            format!(
                "{}_{}_{:0width$}",
                self.generation,
                self.kafka_partitions[0],
                self.offsets[0],
                width = OFFSET_WIDTH
            )
        }
    }

    /// Full path of the file.
    ///
    /// Without an output pattern this is `{file_dir}/{basename}{extension}`.
    /// With a pattern, everything after the prefix is the substituted
    /// pattern; see [`render_with`](Self::render_with) for the placeholder
    /// set.
    pub fn render(&self) -> String {
        self.render_with(&RenderContext::capture())
    }

    /// Like [`render`](Self::render) with an explicit render context, so
    /// time- and randomness-dependent placeholders are reproducible.
    pub fn render_with(&self, ctx: &RenderContext) -> String {
        match &self.output_pattern {
            Some(pattern) if !pattern.trim().is_empty() => {
                let substituted = self.substitute(pattern, ctx);
                let mut rendered = String::new();
                if !self.prefix.is_empty() {
                    rendered.push_str(&self.prefix);
                    rendered.push('/');
                }
                rendered.push_str(&substituted);
                rendered.push_str(&self.extension);
                rendered
            }
            _ => format!("{}/{}{}", self.file_dir(), self.basename(), self.extension),
        }
    }

    /// Path of the checksum sidecar: same directory, `.basename.crc`,
    /// no extension
    pub fn crc_path(&self) -> String {
        format!("{}/.{}.crc", self.file_dir(), self.basename())
    }

    fn substitute(&self, pattern: &str, ctx: &RenderContext) -> String {
        PLACEHOLDER_REGEX
            .replace_all(pattern, |caps: &regex::Captures<'_>| {
                match &caps[1] {
                    "topic" => self.topic.clone(),
                    "partition" => self.partitions.first().cloned().unwrap_or_default(),
                    "generation" => self.generation.to_string(),
                    "kafkaPartition" => self.kafka_partitions[0].to_string(),
                    "fmOffset" => format!("{:0width$}", self.offsets[0], width = OFFSET_WIDTH),
                    "randomHex" => ctx.random_hex.clone(),
                    "currentTimestamp" => ctx.timestamp_ms.to_string(),
                    "currentTime" => ctx.local.format("%H-%M").to_string(),
                    "currentDate" => ctx.local.format("%Y%m%d").to_string(),
                    "message_channel_identifier" => {
                        self.channel_identifier.first().cloned().unwrap_or_default()
                    }
                    // unknown placeholders stay literal
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Reconstruct a path from a rendered one.
    ///
    /// Only the default layout with a single Kafka partition parses; merged
    /// multi-partition basenames are ambiguous (the digest does not encode
    /// its offsets) and are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ShipperError::MalformedPath`] when the path does not start
    /// with the prefix, has fewer than topic + partition + basename
    /// segments, or the basename does not decompose into
    /// `generation_kafkaPartition_offset`.
    pub fn parse(prefix: &str, full_path: &str) -> Result<Self> {
        let trimmed_prefix = prefix.trim_end_matches('/');
        let rest = full_path.strip_prefix(trimmed_prefix).ok_or_else(|| {
            ShipperError::malformed_path(format!(
                "{} does not start with prefix {}",
                full_path, trimmed_prefix
            ))
        })?;
        // the prefix must end on a path segment boundary
        if !trimmed_prefix.is_empty() && !rest.is_empty() && !rest.starts_with('/') {
            return Err(ShipperError::malformed_path(format!(
                "{} does not start with prefix {}",
                full_path, trimmed_prefix
            )));
        }
        let suffix = rest.trim_start_matches('/');

        let elements: Vec<&str> = suffix.split('/').filter(|s| !s.is_empty()).collect();
        if elements.len() < 3 {
            return Err(ShipperError::malformed_path(format!(
                "expected topic, at least one partition and a basename in {}",
                suffix
            )));
        }

        let topic = elements[0].to_string();
        let partitions: Vec<String> = elements[1..elements.len() - 1]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let full_basename = elements[elements.len() - 1];

        // Everything from the first dot is the extension, so multi-part
        // extensions like .log.gz survive a round trip.
        let (basename, extension) = match full_basename.find('.') {
            Some(idx) => (&full_basename[..idx], &full_basename[idx..]),
            None => (full_basename, ""),
        };

        let fields: Vec<&str> = basename.split('_').collect();
        if fields.len() != 3 {
            return Err(ShipperError::malformed_path(format!(
                "basename {} does not decompose into generation_kafkaPartition_offset",
                full_basename
            )));
        }
        let generation: u32 = fields[0].parse().map_err(|_| {
            ShipperError::malformed_path(format!("bad generation in {}", full_basename))
        })?;
        let kafka_partition: u32 = fields[1].parse().map_err(|_| {
            ShipperError::malformed_path(format!("bad kafka partition in {}", full_basename))
        })?;
        if fields[2].len() != OFFSET_WIDTH || !fields[2].bytes().all(|b| b.is_ascii_digit()) {
            return Err(ShipperError::malformed_path(format!(
                "offset in {} is not {} digits",
                full_basename, OFFSET_WIDTH
            )));
        }
        let offset: u64 = fields[2].parse().map_err(|_| {
            ShipperError::malformed_path(format!("bad offset in {}", full_basename))
        })?;

        Self::single(
            trimmed_prefix,
            topic,
            partitions,
            generation,
            kafka_partition,
            offset,
            extension,
        )
    }
}

/// Snapshot of the time- and randomness-dependent placeholder inputs
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Epoch milliseconds for `{currentTimestamp}`
    pub timestamp_ms: i64,
    /// Local time for `{currentTime}` / `{currentDate}`
    pub local: NaiveDateTime,
    /// Four lowercase hex chars for `{randomHex}`
    pub random_hex: String,
}

impl RenderContext {
    /// Capture the current wall clock and a fresh random suffix
    pub fn capture() -> Self {
        let now = Local::now();
        Self {
            timestamp_ms: now.timestamp_millis(),
            local: now.naive_local(),
            random_hex: format!("{:04x}", rand::thread_rng().gen::<u16>()),
        }
    }

    /// Fixed context for reproducible rendering
    pub fn fixed(timestamp_ms: i64, local: NaiveDateTime, random_hex: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            local,
            random_hex: random_hex.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> LogFilePath {
        LogFilePath::single(
            "s3://bucket/root",
            "events",
            vec!["dt=2014-05-13".into()],
            0,
            3,
            100,
            ".log",
        )
        .unwrap()
    }

    #[test]
    fn test_render_default_layout() {
        assert_eq!(
            sample().render(),
            "s3://bucket/root/events/dt=2014-05-13/0_3_00000000000000000100.log"
        );
    }

    #[test]
    fn test_render_empty_prefix() {
        let path = sample().with_prefix("");
        assert_eq!(
            path.render(),
            "events/dt=2014-05-13/0_3_00000000000000000100.log"
        );
    }

    #[test]
    fn test_basename_single_partition_shape() {
        let re = Regex::new(r"^\d+_\d+_\d{20}$").unwrap();
        assert!(re.is_match(&sample().basename()));
    }

    #[test]
    fn test_basename_multi_partition_shape() {
        let path = LogFilePath::new(
            "prefix",
            "events",
            vec!["dt=2024-01-02".into()],
            1,
            vec![4, 5, 6],
            vec![10, 20, 30],
            ".log",
        )
        .unwrap();
        let re = Regex::new(r"^\d+_\d+-\d+_[A-Za-z0-9_-]+$").unwrap();
        assert!(re.is_match(&path.basename()));
        assert!(path.basename().starts_with("1_4-6_"));
        assert!(!path.basename().contains('='));
        assert!(!path.basename().contains('+'));
        assert!(!path.basename().contains('/'));
    }

    #[test]
    fn test_multi_partition_digest_is_offset_sensitive() {
        let a = LogFilePath::new(
            "p",
            "t",
            vec!["dt=2024-01-02".into()],
            0,
            vec![0, 1],
            vec![1, 23],
            "",
        )
        .unwrap();
        // concatenated these would both read "123"
        let b = LogFilePath::new(
            "p",
            "t",
            vec!["dt=2024-01-02".into()],
            0,
            vec![0, 1],
            vec![12, 3],
            "",
        )
        .unwrap();
        assert_ne!(a.basename(), b.basename());
    }

    #[test]
    fn test_non_consecutive_kafka_partitions_rejected() {
        let err = LogFilePath::new(
            "p",
            "t",
            vec!["dt=2024-01-02".into()],
            0,
            vec![1, 3],
            vec![0, 0],
            "",
        )
        .unwrap_err();
        assert!(matches!(err, ShipperError::Invariant(_)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = LogFilePath::new(
            "p",
            "t",
            vec!["dt=2024-01-02".into()],
            0,
            vec![1, 2],
            vec![0],
            "",
        )
        .unwrap_err();
        assert!(matches!(err, ShipperError::Invariant(_)));
    }

    #[test]
    fn test_round_trip() {
        let path = sample();
        let parsed = LogFilePath::parse("s3://bucket/root", &path.render()).unwrap();
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_round_trip_multi_level_partitions_and_extension() {
        let path = LogFilePath::single(
            "/var/loghaul",
            "events",
            vec!["dt=2024-01-02".into(), "hr=07".into()],
            2,
            11,
            987,
            ".log.gz",
        )
        .unwrap();
        let parsed = LogFilePath::parse("/var/loghaul", &path.render()).unwrap();
        assert_eq!(parsed, path);
        assert_eq!(parsed.extension(), ".log.gz");
    }

    #[test]
    fn test_round_trip_prefix_trailing_slash() {
        let path = sample();
        let parsed = LogFilePath::parse("s3://bucket/root/", &path.render()).unwrap();
        assert_eq!(parsed.topic(), "events");
        assert_eq!(parsed.first_offset(), 100);
    }

    #[test]
    fn test_parse_rejects_multi_partition_basename() {
        let err =
            LogFilePath::parse("p", "p/events/dt=2024-01-02/0_4-6_q2m8UOHMBhMUSrXDEa5nvw").unwrap_err();
        assert!(matches!(err, ShipperError::MalformedPath(_)));
    }

    #[test]
    fn test_parse_rejects_short_paths() {
        let err = LogFilePath::parse("p", "p/events/0_3_00000000000000000100").unwrap_err();
        assert!(matches!(err, ShipperError::MalformedPath(_)));
    }

    #[test]
    fn test_parse_rejects_unpadded_offset() {
        let err = LogFilePath::parse("p", "p/events/dt=2024-01-02/0_3_100").unwrap_err();
        assert!(matches!(err, ShipperError::MalformedPath(_)));
    }

    #[test]
    fn test_parse_rejects_foreign_prefix() {
        let err = LogFilePath::parse("other", "p/events/dt=x/0_3_00000000000000000100").unwrap_err();
        assert!(matches!(err, ShipperError::MalformedPath(_)));
    }

    #[test]
    fn test_crc_path() {
        assert_eq!(
            sample().crc_path(),
            "s3://bucket/root/events/dt=2014-05-13/.0_3_00000000000000000100.crc"
        );
    }

    #[test]
    fn test_pattern_render_frozen_context() {
        let path = LogFilePath::single(
            "prefix",
            "events",
            vec!["dt=2024-01-02".into()],
            0,
            7,
            42,
            "",
        )
        .unwrap()
        .with_pattern(Some("{partition}-{currentTimestamp}.json".into()));
        let local = NaiveDate::from_ymd_opt(2023, 11, 14)
            .unwrap()
            .and_hms_opt(22, 13, 20)
            .unwrap();
        let ctx = RenderContext::fixed(1_700_000_000_000, local, "ab12");
        assert_eq!(path.render_with(&ctx), "prefix/dt=2024-01-02-1700000000000.json");
    }

    #[test]
    fn test_pattern_placeholders() {
        let path = LogFilePath::single("p", "events", vec!["dt=2024-01-02".into()], 3, 7, 42, ".json")
            .unwrap()
            .with_pattern(Some(
                "{topic}/{generation}/{kafkaPartition}/{fmOffset}-{randomHex}-{currentDate}-{currentTime}".into(),
            ));
        let local = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let ctx = RenderContext::fixed(1, local, "beef");
        assert_eq!(
            path.render_with(&ctx),
            "p/events/3/7/00000000000000000042-beef-20240315-10-30.json"
        );
    }

    #[test]
    fn test_pattern_unknown_placeholder_stays_literal() {
        let path = sample().with_pattern(Some("{topic}/{mystery}".into()));
        let local = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let ctx = RenderContext::fixed(0, local, "0000");
        assert_eq!(
            path.render_with(&ctx),
            "s3://bucket/root/events/{mystery}.log"
        );
    }

    #[test]
    fn test_pattern_channel_identifier() {
        let path = sample()
            .with_pattern(Some("{message_channel_identifier}/{topic}".into()))
            .with_channel_identifier(vec!["web".into()]);
        let local = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let ctx = RenderContext::fixed(0, local, "0000");
        assert_eq!(path.render_with(&ctx), "s3://bucket/root/web/events.log");
    }
}
