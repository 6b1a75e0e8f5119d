//! Injectable clock
//!
//! File age thresholds and date-derived partitions both depend on "now".
//! Components take a [`Clock`] so tests can pin time instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A cheaply clonable time source
#[derive(Debug, Clone, Default)]
pub struct Clock {
    fixed: Option<Arc<AtomicI64>>,
}

impl Clock {
    /// Wall-clock time
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// A clock frozen at the given epoch milliseconds; advance with
    /// [`set_millis`](Self::set_millis)
    pub fn fixed(millis: i64) -> Self {
        Self {
            fixed: Some(Arc::new(AtomicI64::new(millis))),
        }
    }

    /// Current time in epoch milliseconds
    pub fn now_millis(&self) -> i64 {
        match &self.fixed {
            Some(ms) => ms.load(Ordering::Relaxed),
            None => Utc::now().timestamp_millis(),
        }
    }

    /// Current time as a UTC datetime
    pub fn now_utc(&self) -> DateTime<Utc> {
        match &self.fixed {
            Some(ms) => DateTime::from_timestamp_millis(ms.load(Ordering::Relaxed))
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }

    /// Move a fixed clock; no-op on a system clock
    pub fn set_millis(&self, millis: i64) {
        if let Some(ms) = &self.fixed {
            ms.store(millis, Ordering::Relaxed);
        }
    }
}
