//! Pattern-date parser

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;

use super::{
    field_as_epoch_millis, folder_prefix, lookup_field, partition_components, MessageParser,
};
use crate::clock::Clock;
use crate::config::{ParserConfig, TimestampUnit};
use crate::error::{Result, ShipperError};
use crate::message::Message;

/// Like [`TimestampedParser`](super::TimestampedParser), but string
/// timestamp values are parsed with a configurable date pattern, and a
/// per-record folder prefix can be prepended to the date partition based on
/// an identifier field.
#[derive(Debug)]
pub struct PatternDateParser {
    timestamp_field: String,
    fallback_field: Option<String>,
    unit: TimestampUnit,
    input_pattern: Option<String>,
    tz: Tz,
    output_format: String,
    prefix_enabled: bool,
    prefix_identifier: String,
    prefix_mapping: HashMap<String, String>,
    clock: Clock,
}

impl PatternDateParser {
    pub fn new(config: &ParserConfig, tz: Tz, clock: Clock) -> Result<Self> {
        if config.prefix_enabled {
            let mapping = config.prefix_mapping.as_ref().ok_or_else(|| {
                ShipperError::config("prefix_enabled requires parser.prefix_mapping")
            })?;
            if !mapping.contains_key("DEFAULT") {
                return Err(ShipperError::config(
                    "parser.prefix_mapping must contain a DEFAULT entry",
                ));
            }
        }
        Ok(Self {
            timestamp_field: config.timestamp_field.clone(),
            fallback_field: config.fallback_timestamp_field.clone(),
            unit: config.timestamp_unit,
            input_pattern: config.input_pattern.clone(),
            tz,
            output_format: config.output_format.clone(),
            prefix_enabled: config.prefix_enabled,
            prefix_identifier: config.prefix_identifier.clone(),
            prefix_mapping: config.prefix_mapping.clone().unwrap_or_default(),
            clock,
        })
    }

    fn parse_string_timestamp(&self, raw: &str) -> Result<i64> {
        let pattern = self.input_pattern.as_deref().ok_or_else(|| {
            ShipperError::parse(format!(
                "string timestamp {} without parser.input_pattern",
                raw
            ))
        })?;
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, pattern) {
            return self.local_to_millis(dt);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, pattern) {
            let dt = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| ShipperError::parse(format!("bad date {}", raw)))?;
            return self.local_to_millis(dt);
        }
        Err(ShipperError::parse(format!(
            "timestamp {} does not match pattern {}",
            raw, pattern
        )))
    }

    fn local_to_millis(&self, dt: NaiveDateTime) -> Result<i64> {
        use chrono::TimeZone as _;
        self.tz
            .from_local_datetime(&dt)
            .single()
            .map(|d| d.timestamp_millis())
            .ok_or_else(|| ShipperError::parse(format!("ambiguous local time {}", dt)))
    }
}

impl MessageParser for PatternDateParser {
    fn extract_partitions(&self, message: &Message) -> Result<Vec<String>> {
        let payload: serde_json::Value = serde_json::from_slice(&message.payload)
            .map_err(|e| ShipperError::parse(format!("payload is not JSON: {}", e)))?;

        let timestamp_ms = self.extract_timestamp_millis(message)?;
        let mut components =
            partition_components(timestamp_ms, self.tz, &self.output_format, false, false)?;

        if self.prefix_enabled {
            let identifier = lookup_field(&payload, &self.prefix_identifier)
                .and_then(|v| v.as_str().map(|s| s.to_string()));
            let prefix = folder_prefix(&self.prefix_mapping, identifier.as_deref());
            components[0] = format!("{}{}", prefix, components[0]);
        }
        Ok(components)
    }

    fn extract_timestamp_millis(&self, message: &Message) -> Result<i64> {
        let payload: serde_json::Value = serde_json::from_slice(&message.payload)
            .map_err(|e| ShipperError::parse(format!("payload is not JSON: {}", e)))?;

        let field = lookup_field(&payload, &self.timestamp_field).or_else(|| {
            self.fallback_field
                .as_deref()
                .and_then(|f| lookup_field(&payload, f))
        });

        match field {
            // absent timestamp means "now", matching the availability
            // choice of routing rather than dropping
            None => Ok(self.clock.now_millis()),
            Some(serde_json::Value::String(s)) => self.parse_string_timestamp(s),
            Some(value) => field_as_epoch_millis(value, self.unit).ok_or_else(|| {
                ShipperError::parse(format!(
                    "{} field is not a timestamp: {}",
                    self.timestamp_field, value
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserKind;

    fn config() -> ParserConfig {
        ParserConfig {
            kind: ParserKind::PatternDate,
            input_pattern: Some("%Y-%m-%d %H:%M:%S".into()),
            ..ParserConfig::default()
        }
    }

    fn parser(config: &ParserConfig, clock: Clock) -> PatternDateParser {
        PatternDateParser::new(config, config.timezone.parse().unwrap(), clock).unwrap()
    }

    fn message(payload: serde_json::Value) -> Message {
        Message::new("events", 0, 0, serde_json::to_vec(&payload).unwrap())
    }

    #[test]
    fn test_string_timestamp_with_pattern() {
        let p = parser(&config(), Clock::system());
        let partitions = p
            .extract_partitions(&message(
                serde_json::json!({"timestamp": "2014-05-13 16:53:20"}),
            ))
            .unwrap();
        assert_eq!(partitions, vec!["dt=2014-05-13".to_string()]);
    }

    #[test]
    fn test_date_only_pattern() {
        let mut cfg = config();
        cfg.input_pattern = Some("%d/%m/%Y".into());
        let p = parser(&cfg, Clock::system());
        let partitions = p
            .extract_partitions(&message(serde_json::json!({"timestamp": "02/01/2024"})))
            .unwrap();
        assert_eq!(partitions, vec!["dt=2024-01-02".to_string()]);
    }

    #[test]
    fn test_numeric_timestamp_bypasses_pattern() {
        let p = parser(&config(), Clock::system());
        let partitions = p
            .extract_partitions(&message(serde_json::json!({"timestamp": 1_400_000_000_000i64})))
            .unwrap();
        assert_eq!(partitions, vec!["dt=2014-05-13".to_string()]);
    }

    #[test]
    fn test_missing_field_uses_now() {
        let p = parser(&config(), Clock::fixed(1_400_000_000_000));
        let partitions = p
            .extract_partitions(&message(serde_json::json!({"other": true})))
            .unwrap();
        assert_eq!(partitions, vec!["dt=2014-05-13".to_string()]);
    }

    #[test]
    fn test_unparseable_string_is_parse_error() {
        let p = parser(&config(), Clock::system());
        let err = p
            .extract_partitions(&message(serde_json::json!({"timestamp": "yesterday"})))
            .unwrap_err();
        assert!(matches!(err, ShipperError::Parse(_)));
    }

    #[test]
    fn test_prefix_mapping() {
        let mut cfg = config();
        cfg.prefix_enabled = true;
        cfg.prefix_identifier = "app".into();
        cfg.prefix_mapping = Some(
            [
                ("web".to_string(), "web-events".to_string()),
                ("DEFAULT".to_string(), "misc".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let p = parser(&cfg, Clock::system());

        let partitions = p
            .extract_partitions(&message(
                serde_json::json!({"timestamp": "2014-05-13 16:53:20", "app": "web"}),
            ))
            .unwrap();
        assert_eq!(partitions, vec!["web-events/dt=2014-05-13".to_string()]);

        let partitions = p
            .extract_partitions(&message(
                serde_json::json!({"timestamp": "2014-05-13 16:53:20", "app": "android"}),
            ))
            .unwrap();
        assert_eq!(partitions, vec!["misc/dt=2014-05-13".to_string()]);
    }

    #[test]
    fn test_prefix_mapping_requires_default() {
        let mut cfg = config();
        cfg.prefix_enabled = true;
        cfg.prefix_identifier = "app".into();
        cfg.prefix_mapping = Some([("web".to_string(), "w".to_string())].into_iter().collect());
        let err =
            PatternDateParser::new(&cfg, cfg.timezone.parse().unwrap(), Clock::system()).unwrap_err();
        assert!(matches!(err, ShipperError::Config(_)));
    }
}
