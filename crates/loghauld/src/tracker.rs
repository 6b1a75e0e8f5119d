//! Partition state tracking
//!
//! Each (topic, kafka-partition) loop is a small state machine:
//!
//! ```text
//! Idle ──start──▶ Consuming ──flush trip──▶ Flushing ──ok──▶ Consuming
//!                     │                        │
//!                  revoke ───────▶ Flushing ──ok──▶ Idle
//!                                              └─fatal─▶ Failed
//! ```
//!
//! A revoke or shutdown drains synchronously: the loop finishes its flush
//! before giving up the partition, so the next owner resumes from a fresh
//! committed offset.

use loghaul_core::{Result, ShipperError};

/// Consumer loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Consuming,
    Flushing,
    Failed,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Consuming => write!(f, "consuming"),
            Self::Flushing => write!(f, "flushing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Working-set bookkeeping of one (topic, kafka-partition)
#[derive(Debug)]
pub struct PartitionTracker {
    topic: String,
    kafka_partition: u32,
    state: LoopState,
    /// Committed boundary this run started from, and the resume point of
    /// the earliest uncommitted offset
    committed: Option<u64>,
    /// First append since the last successful flush, epoch millis
    first_write_at_ms: Option<i64>,
    /// Most recent append, epoch millis
    last_write_at_ms: Option<i64>,
}

impl PartitionTracker {
    pub fn new(topic: impl Into<String>, kafka_partition: u32) -> Self {
        Self {
            topic: topic.into(),
            kafka_partition,
            state: LoopState::Idle,
            committed: None,
            first_write_at_ms: None,
            last_write_at_ms: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kafka_partition(&self) -> u32 {
        self.kafka_partition
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Earliest offset not yet covered by a committed upload
    pub fn earliest_uncommitted(&self) -> u64 {
        self.committed.unwrap_or(0)
    }

    /// Idle -> Consuming
    pub fn start(&mut self, committed: Option<u64>) -> Result<()> {
        self.expect(LoopState::Idle, "start")?;
        self.committed = committed;
        self.state = LoopState::Consuming;
        Ok(())
    }

    /// Consuming -> Flushing
    pub fn begin_flush(&mut self) -> Result<()> {
        self.expect(LoopState::Consuming, "begin_flush")?;
        self.state = LoopState::Flushing;
        Ok(())
    }

    /// Flushing -> Consuming, with the new committed boundary (if the cycle
    /// uploaded anything)
    pub fn flush_ok(&mut self, committed: Option<u64>) -> Result<()> {
        self.expect(LoopState::Flushing, "flush_ok")?;
        if let Some(committed) = committed {
            self.committed = Some(committed);
        }
        self.first_write_at_ms = None;
        self.state = LoopState::Consuming;
        Ok(())
    }

    /// Flushing -> Idle (revoke or shutdown drained)
    pub fn release(&mut self, committed: Option<u64>) -> Result<()> {
        self.expect(LoopState::Flushing, "release")?;
        if let Some(committed) = committed {
            self.committed = Some(committed);
        }
        self.first_write_at_ms = None;
        self.state = LoopState::Idle;
        Ok(())
    }

    /// Any state -> Failed
    pub fn fail(&mut self) {
        self.state = LoopState::Failed;
    }

    /// Record an append
    pub fn record_write(&mut self, now_ms: i64) {
        self.first_write_at_ms.get_or_insert(now_ms);
        self.last_write_at_ms = Some(now_ms);
    }

    pub fn first_write_at_ms(&self) -> Option<i64> {
        self.first_write_at_ms
    }

    pub fn last_write_at_ms(&self) -> Option<i64> {
        self.last_write_at_ms
    }

    fn expect(&self, state: LoopState, transition: &str) -> Result<()> {
        if self.state != state {
            return Err(ShipperError::invariant(format!(
                "{} for {}/{} in state {}",
                transition, self.topic, self.kafka_partition, self.state
            )));
        }
        Ok(())
    }
}
