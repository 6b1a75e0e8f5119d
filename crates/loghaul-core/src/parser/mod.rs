//! Message parsers
//!
//! A parser derives the logical partitions (e.g. `dt=2024-01-02`) and a
//! timestamp from a raw message. Variants are plain structs behind the
//! [`MessageParser`] trait, selected by a tagged config value; shared
//! behavior lives in free functions rather than a base type.
//!
//! Parse failures never abort a consumer loop: the caller routes the
//! message to the configured fallback partition and logs it. Losing the
//! archival of a malformed record would be worse than a polluted date
//! bucket.

mod daily_offset;
mod pattern_date;
mod timestamped;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub use daily_offset::DailyOffsetParser;
pub use pattern_date::PatternDateParser;
pub use timestamped::TimestampedParser;

use crate::clock::Clock;
use crate::config::{ParserConfig, ParserKind, TimestampUnit};
use crate::error::{Result, ShipperError};
use crate::message::Message;

/// Derives logical partitions and a timestamp from a raw message
pub trait MessageParser: Send + Sync {
    /// Ordered logical partitions for the message
    fn extract_partitions(&self, message: &Message) -> Result<Vec<String>>;

    /// Timestamp of the message in epoch milliseconds
    fn extract_timestamp_millis(&self, message: &Message) -> Result<i64>;
}

/// Build the parser selected by configuration.
///
/// # Errors
///
/// Returns a `Config` error for an unparseable time zone or a prefix
/// mapping without a `DEFAULT` entry.
pub fn build_parser(config: &ParserConfig, clock: Clock) -> Result<Arc<dyn MessageParser>> {
    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|_| ShipperError::config(format!("unknown time zone {}", config.timezone)))?;
    let parser: Arc<dyn MessageParser> = match config.kind {
        ParserKind::Timestamped => Arc::new(TimestampedParser::new(config, tz)?),
        ParserKind::PatternDate => Arc::new(PatternDateParser::new(config, tz, clock)?),
        ParserKind::DailyOffset => Arc::new(DailyOffsetParser::new(config, tz, clock)?),
    };
    Ok(parser)
}

/// Partitions a message is routed to when its parse failed
pub fn fallback_partitions(config: &ParserConfig) -> Vec<String> {
    let mut partition = config.fallback_partition.clone();
    if config.prefix_enabled {
        if let Some(mapping) = &config.prefix_mapping {
            partition = format!("{}{}", folder_prefix(mapping, None), partition);
        }
    }
    vec![partition]
}

/// Extract the routing label for `{message_channel_identifier}`; empty when
/// unconfigured or absent from the payload
pub fn extract_channel_identifier(config: &ParserConfig, message: &Message) -> Vec<String> {
    let Some(path) = &config.channel_identifier else {
        return Vec::new();
    };
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&message.payload) else {
        return Vec::new();
    };
    match lookup_field(&payload, path) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(other) if !other.is_null() => vec![other.to_string()],
        _ => Vec::new(),
    }
}

/// Walk a dotted path (`a.b.c`) through a JSON value
pub(crate) fn lookup_field<'a>(
    root: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Convert a numeric timestamp to epoch milliseconds
pub(crate) fn to_millis(value: i64, unit: TimestampUnit) -> i64 {
    match unit {
        TimestampUnit::Seconds => value * 1000,
        TimestampUnit::Millis => value,
        TimestampUnit::Nanos => value / 1_000_000,
    }
}

/// Read a payload field as an epoch timestamp in the configured unit
pub(crate) fn field_as_epoch_millis(
    value: &serde_json::Value,
    unit: TimestampUnit,
) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().map(|v| to_millis(v, unit)),
        serde_json::Value::String(s) => s.parse::<i64>().ok().map(|v| to_millis(v, unit)),
        _ => None,
    }
}

/// Render the date partition component(s) for a timestamp.
///
/// `output_format` is a chrono format string with its literal `dt=` style
/// prefix baked in; `hourly` / `minutely` append `hr=HH` / `min=MM`.
pub(crate) fn partition_components(
    timestamp_ms: i64,
    tz: Tz,
    output_format: &str,
    hourly: bool,
    minutely: bool,
) -> Result<Vec<String>> {
    let utc = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .ok_or_else(|| ShipperError::parse(format!("timestamp {} out of range", timestamp_ms)))?;
    let local = utc.with_timezone(&tz);

    let mut first = String::new();
    write!(first, "{}", local.format(output_format))
        .map_err(|_| ShipperError::config(format!("bad date format {}", output_format)))?;

    let mut components = vec![first];
    if hourly || minutely {
        components.push(local.format("hr=%H").to_string());
    }
    if minutely {
        components.push(local.format("min=%M").to_string());
    }
    Ok(components)
}

/// Folder prefix for an identifier value; falls back to `DEFAULT`, then to
/// no prefix. A non-empty prefix always ends with `/`.
pub(crate) fn folder_prefix(mapping: &HashMap<String, String>, identifier: Option<&str>) -> String {
    let folder = identifier
        .and_then(|id| mapping.get(id))
        .or_else(|| mapping.get("DEFAULT"));
    match folder {
        Some(f) if !f.is_empty() => format!("{}/", f.trim_end_matches('/')),
        _ => String::new(),
    }
}
