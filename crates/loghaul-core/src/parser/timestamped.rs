//! Timestamp-field parser

use chrono_tz::Tz;

use super::{field_as_epoch_millis, lookup_field, partition_components, MessageParser};
use crate::config::{ParserConfig, TimestampUnit};
use crate::error::{Result, ShipperError};
use crate::message::Message;

/// Extracts a numeric timestamp field from the JSON payload and formats it
/// into date partitions in a configured time zone.
pub struct TimestampedParser {
    timestamp_field: String,
    fallback_field: Option<String>,
    unit: TimestampUnit,
    tz: Tz,
    output_format: String,
    hourly: bool,
    minutely: bool,
}

impl TimestampedParser {
    pub fn new(config: &ParserConfig, tz: Tz) -> Result<Self> {
        Ok(Self {
            timestamp_field: config.timestamp_field.clone(),
            fallback_field: config.fallback_timestamp_field.clone(),
            unit: config.timestamp_unit,
            tz,
            output_format: config.output_format.clone(),
            hourly: config.hourly,
            minutely: config.minutely,
        })
    }
}

impl MessageParser for TimestampedParser {
    fn extract_partitions(&self, message: &Message) -> Result<Vec<String>> {
        let timestamp_ms = self.extract_timestamp_millis(message)?;
        partition_components(
            timestamp_ms,
            self.tz,
            &self.output_format,
            self.hourly,
            self.minutely,
        )
    }

    fn extract_timestamp_millis(&self, message: &Message) -> Result<i64> {
        let payload: serde_json::Value = serde_json::from_slice(&message.payload)
            .map_err(|e| ShipperError::parse(format!("payload is not JSON: {}", e)))?;

        let field = lookup_field(&payload, &self.timestamp_field).or_else(|| {
            self.fallback_field
                .as_deref()
                .and_then(|f| lookup_field(&payload, f))
        });
        let field = field.ok_or_else(|| {
            ShipperError::parse(format!("no {} field in payload", self.timestamp_field))
        })?;

        field_as_epoch_millis(field, self.unit).ok_or_else(|| {
            ShipperError::parse(format!(
                "{} field is not a numeric timestamp: {}",
                self.timestamp_field, field
            ))
        })
    }
}
