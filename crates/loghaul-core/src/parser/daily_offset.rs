//! Daily offset-bucket parser

use chrono_tz::Tz;

use super::{partition_components, MessageParser};
use crate::clock::Clock;
use crate::config::ParserConfig;
use crate::error::{Result, ShipperError};
use crate::message::Message;

/// Groups messages by the current date plus an offset bucket.
///
/// The date partition reflects arrival time rather than message content;
/// the second partition is `offset=N` where `N` is the message offset
/// rounded down to a multiple of the bucket width. Useful for offset-ranged
/// archival of topics without usable timestamps.
pub struct DailyOffsetParser {
    tz: Tz,
    output_format: String,
    hourly: bool,
    minutely: bool,
    offsets_per_partition: u64,
    clock: Clock,
}

impl DailyOffsetParser {
    pub fn new(config: &ParserConfig, tz: Tz, clock: Clock) -> Result<Self> {
        if config.offsets_per_partition == 0 {
            return Err(ShipperError::config(
                "parser.offsets_per_partition must be > 0",
            ));
        }
        Ok(Self {
            tz,
            output_format: config.output_format.clone(),
            hourly: config.hourly,
            minutely: config.minutely,
            offsets_per_partition: config.offsets_per_partition,
            clock,
        })
    }
}

impl MessageParser for DailyOffsetParser {
    fn extract_partitions(&self, message: &Message) -> Result<Vec<String>> {
        let bucket = (message.offset / self.offsets_per_partition) * self.offsets_per_partition;
        let date_components = partition_components(
            self.clock.now_millis(),
            self.tz,
            &self.output_format,
            self.hourly,
            self.minutely,
        )?;
        Ok(vec![
            date_components.join("/"),
            format!("offset={}", bucket),
        ])
    }

    fn extract_timestamp_millis(&self, _message: &Message) -> Result<i64> {
        Ok(self.clock.now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserKind;

    fn parser(offsets_per_partition: u64, clock: Clock) -> DailyOffsetParser {
        let config = ParserConfig {
            kind: ParserKind::DailyOffset,
            offsets_per_partition,
            ..ParserConfig::default()
        };
        DailyOffsetParser::new(&config, chrono_tz::UTC, clock).unwrap()
    }

    #[test]
    fn test_offset_bucketing() {
        // 2024-03-01 00:00:00 UTC
        let p = parser(10_000, Clock::fixed(1_709_251_200_000));
        let partitions = p
            .extract_partitions(&Message::new("t", 0, 23_457, &b"{}"[..]))
            .unwrap();
        assert_eq!(
            partitions,
            vec!["dt=2024-03-01".to_string(), "offset=20000".to_string()]
        );
    }

    #[test]
    fn test_bucket_boundary() {
        let p = parser(10_000, Clock::fixed(1_709_251_200_000));
        let partitions = p
            .extract_partitions(&Message::new("t", 0, 20_000, &b"{}"[..]))
            .unwrap();
        assert_eq!(partitions[1], "offset=20000");
        let partitions = p
            .extract_partitions(&Message::new("t", 0, 19_999, &b"{}"[..]))
            .unwrap();
        assert_eq!(partitions[1], "offset=10000");
    }

    #[test]
    fn test_hourly_components_fold_into_date_path() {
        let config = ParserConfig {
            kind: ParserKind::DailyOffset,
            hourly: true,
            ..ParserConfig::default()
        };
        let p = DailyOffsetParser::new(&config, chrono_tz::UTC, Clock::fixed(1_709_260_200_000))
            .unwrap();
        let partitions = p
            .extract_partitions(&Message::new("t", 0, 5, &b"{}"[..]))
            .unwrap();
        assert_eq!(partitions[0], "dt=2024-03-01/hr=02");
        assert_eq!(partitions[1], "offset=0");
    }

    #[test]
    fn test_zero_bucket_width_rejected() {
        let config = ParserConfig {
            kind: ParserKind::DailyOffset,
            offsets_per_partition: 0,
            ..ParserConfig::default()
        };
        assert!(DailyOffsetParser::new(&config, chrono_tz::UTC, Clock::system()).is_err());
    }
}
