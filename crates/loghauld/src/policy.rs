//! Flush policy
//!
//! Decides when a partition's in-flight files must be sealed and uploaded.
//! Evaluated after every appended batch and on the poll timer, so age
//! thresholds fire even on quiet partitions.

use loghaul_core::config::{AgePolicy, PolicyConfig};
use loghaul_core::Clock;

use crate::registry::FileRegistry;

/// Why a flush was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// An open file reached the size threshold
    MaxSize { bytes: u64 },
    /// The age threshold was reached
    MaxAge { age_seconds: u64 },
    /// An open file reached the record-count threshold
    MaxRecords { records: u64 },
    /// Explicit request: shutdown, rebalance revoke, or recovery
    Explicit,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxSize { bytes } => write!(f, "max size ({} bytes)", bytes),
            Self::MaxAge { age_seconds } => write!(f, "max age ({}s)", age_seconds),
            Self::MaxRecords { records } => write!(f, "max records ({})", records),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

/// Size/age/count thresholds over a partition's open files
#[derive(Debug, Clone)]
pub struct CommitPolicy {
    config: PolicyConfig,
    clock: Clock,
}

impl CommitPolicy {
    pub fn new(config: PolicyConfig, clock: Clock) -> Self {
        Self { config, clock }
    }

    /// Check whether the registry's in-flight data must be flushed
    pub fn should_flush(&self, registry: &FileRegistry) -> Option<FlushReason> {
        if registry.is_empty() {
            return None;
        }

        let max_bytes = registry.max_bytes_written();
        if max_bytes >= self.config.max_file_size_bytes {
            return Some(FlushReason::MaxSize { bytes: max_bytes });
        }

        if self.config.max_file_records > 0 {
            let max_records = registry.max_record_count();
            if max_records >= self.config.max_file_records {
                return Some(FlushReason::MaxRecords {
                    records: max_records,
                });
            }
        }

        let reference_ms = match self.config.age_policy {
            AgePolicy::Oldest => registry.min_created_at_ms(),
            AgePolicy::Newest => registry.max_last_write_at_ms(),
        }?;
        let age_seconds = (self.clock.now_millis() - reference_ms).max(0) as u64 / 1000;
        if age_seconds >= self.config.max_file_age_seconds {
            return Some(FlushReason::MaxAge { age_seconds });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghaul_core::codec::DelimitedCodec;
    use loghaul_core::KeyValue;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn registry(root: &std::path::Path, clock: Clock) -> FileRegistry {
        FileRegistry::new(
            "events",
            0,
            0,
            root.to_str().unwrap(),
            ".log",
            Arc::new(DelimitedCodec::new(b'\n', Some(b'\n'), false)),
            clock,
        )
    }

    fn policy(config: PolicyConfig, clock: Clock) -> CommitPolicy {
        CommitPolicy::new(config, clock)
    }

    #[test]
    fn test_empty_registry_never_flushes() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(0);
        let registry = registry(dir.path(), clock.clone());
        let policy = policy(
            PolicyConfig {
                max_file_age_seconds: 0,
                ..PolicyConfig::default()
            },
            clock,
        );
        assert_eq!(policy.should_flush(&registry), None);
    }

    #[test]
    fn test_size_trigger() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(0);
        let mut registry = registry(dir.path(), clock.clone());
        let policy = policy(
            PolicyConfig {
                max_file_size_bytes: 10,
                ..PolicyConfig::default()
            },
            clock,
        );

        registry
            .append(&["dt=a".to_string()], &KeyValue::new(0, &b"small"[..]), &[])
            .unwrap();
        assert_eq!(policy.should_flush(&registry), None);

        registry
            .append(&["dt=a".to_string()], &KeyValue::new(1, &b"more-bytes"[..]), &[])
            .unwrap();
        assert!(matches!(
            policy.should_flush(&registry),
            Some(FlushReason::MaxSize { .. })
        ));
    }

    #[test]
    fn test_record_count_trigger() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(0);
        let mut registry = registry(dir.path(), clock.clone());
        let policy = policy(
            PolicyConfig {
                max_file_records: 3,
                ..PolicyConfig::default()
            },
            clock,
        );

        for offset in 0..3u64 {
            registry
                .append(&["dt=a".to_string()], &KeyValue::new(offset, &b"r"[..]), &[])
                .unwrap();
        }
        assert!(matches!(
            policy.should_flush(&registry),
            Some(FlushReason::MaxRecords { records: 3 })
        ));
    }

    #[test]
    fn test_age_trigger_oldest() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(0);
        let mut registry = registry(dir.path(), clock.clone());
        let policy = policy(
            PolicyConfig {
                max_file_age_seconds: 60,
                age_policy: AgePolicy::Oldest,
                ..PolicyConfig::default()
            },
            clock.clone(),
        );

        registry
            .append(&["dt=a".to_string()], &KeyValue::new(0, &b"r"[..]), &[])
            .unwrap();
        assert_eq!(policy.should_flush(&registry), None);

        clock.set_millis(61_000);
        assert!(matches!(
            policy.should_flush(&registry),
            Some(FlushReason::MaxAge { age_seconds: 61 })
        ));
    }

    #[test]
    fn test_age_trigger_newest_tracks_last_write() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(0);
        let mut registry = registry(dir.path(), clock.clone());
        let policy = policy(
            PolicyConfig {
                max_file_age_seconds: 60,
                age_policy: AgePolicy::Newest,
                ..PolicyConfig::default()
            },
            clock.clone(),
        );

        registry
            .append(&["dt=a".to_string()], &KeyValue::new(0, &b"r"[..]), &[])
            .unwrap();
        // keep writing; the newest-write age stays fresh past the oldest
        // file's age
        clock.set_millis(50_000);
        registry
            .append(&["dt=a".to_string()], &KeyValue::new(1, &b"r"[..]), &[])
            .unwrap();
        clock.set_millis(80_000);
        assert_eq!(policy.should_flush(&registry), None);

        clock.set_millis(111_000);
        assert!(matches!(
            policy.should_flush(&registry),
            Some(FlushReason::MaxAge { .. })
        ));
    }
}
