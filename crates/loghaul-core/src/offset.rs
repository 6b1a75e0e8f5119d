//! Offset bookkeeping
//!
//! Two monotonic counters per `(group, topic, kafka_partition)`:
//!
//! - `committed`: highest offset whose records are durably uploaded; the
//!   consumer resumes here. Advanced only by the uploader after every
//!   upload of a cycle succeeded.
//! - `last_seen`: highest offset the consumer loop has observed, for lag
//!   accounting.
//!
//! `committed <= last_seen`; both only ever grow. Re-committing the current
//! value is an accepted no-op because the crash-retry path replays it;
//! moving backwards is a bug.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, ShipperError};

/// Number of `last_seen` updates between automatic checkpoints.
///
/// `committed` is checkpointed write-through (it is rare and crash-critical);
/// `last_seen` changes on every batch and is only advisory, so it is flushed
/// in batches and on shutdown.
const CHECKPOINT_INTERVAL: u32 = 50;

/// Both counters of one partition
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OffsetState {
    #[serde(default)]
    pub committed: Option<u64>,
    #[serde(default)]
    pub last_seen: Option<u64>,
}

/// Partition to offset state mapping
type PartitionOffsets = HashMap<u32, OffsetState>;
/// Topic to partition offsets mapping
type TopicOffsets = HashMap<String, PartitionOffsets>;
/// Consumer group to topic offsets mapping
type GroupOffsets = HashMap<String, TopicOffsets>;

/// Durable map of consumed and observed offsets
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Highest durably uploaded offset boundary, if any
    async fn committed(&self, group: &str, topic: &str, kafka_partition: u32)
        -> Result<Option<u64>>;

    /// Record a new committed boundary. Must not decrease.
    async fn set_committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()>;

    /// Highest observed offset, if any
    async fn last_seen(&self, group: &str, topic: &str, kafka_partition: u32)
        -> Result<Option<u64>>;

    /// Record a newly observed offset; older values are ignored
    async fn set_last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()>;

    /// Persist any buffered state; called on graceful shutdown
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Reject regressions, report whether the value actually moved
fn advance_committed(current: &mut Option<u64>, offset: u64) -> Result<bool> {
    match *current {
        Some(existing) if offset < existing => Err(ShipperError::invariant(format!(
            "committed offset would move backwards: {} -> {}",
            existing, offset
        ))),
        Some(existing) if offset == existing => Ok(false),
        _ => {
            *current = Some(offset);
            Ok(true)
        }
    }
}

/// In-memory offset store for tests and single-process runs
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: RwLock<GroupOffsets>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        let offsets = self.offsets.read().await;
        Ok(lookup(&offsets, group, topic, kafka_partition).and_then(|s| s.committed))
    }

    async fn set_committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        let mut offsets = self.offsets.write().await;
        let state = entry(&mut offsets, group, topic, kafka_partition);
        advance_committed(&mut state.committed, offset)?;
        Ok(())
    }

    async fn last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        let offsets = self.offsets.read().await;
        Ok(lookup(&offsets, group, topic, kafka_partition).and_then(|s| s.last_seen))
    }

    async fn set_last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        let mut offsets = self.offsets.write().await;
        let state = entry(&mut offsets, group, topic, kafka_partition);
        state.last_seen = Some(state.last_seen.map_or(offset, |seen| seen.max(offset)));
        Ok(())
    }
}

/// Offset store checkpointed to `<data_dir>/offsets.json`.
///
/// Checkpoints are written atomically (tmp file + rename). Committed
/// offsets are flushed immediately; last-seen updates are batched every
/// [`CHECKPOINT_INTERVAL`] calls, so call [`flush`](OffsetStore::flush)
/// during graceful shutdown.
pub struct FileOffsetStore {
    offsets: RwLock<GroupOffsets>,
    path: PathBuf,
    pending_updates: AtomicU32,
}

impl FileOffsetStore {
    /// Open or create the store under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created. A corrupt
    /// checkpoint is logged and treated as empty rather than blocking
    /// startup.
    pub fn open(data_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("offsets.json");

        let offsets = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<GroupOffsets>(&content) {
                    Ok(loaded) => {
                        debug!(
                            groups = loaded.len(),
                            path = %path.display(),
                            "loaded offset checkpoint"
                        );
                        loaded
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unparseable offset checkpoint, starting empty");
                        HashMap::new()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable offset checkpoint, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            offsets: RwLock::new(offsets),
            path,
            pending_updates: AtomicU32::new(0),
        })
    }

    async fn checkpoint(&self) -> Result<()> {
        let snapshot = {
            let offsets = self.offsets.read().await;
            serde_json::to_vec_pretty(&*offsets)?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, snapshot)
            .await
            .map_err(|e| ShipperError::offset_store(format!("checkpoint write: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ShipperError::offset_store(format!("checkpoint rename: {}", e)))?;
        self.pending_updates.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        let offsets = self.offsets.read().await;
        Ok(lookup(&offsets, group, topic, kafka_partition).and_then(|s| s.committed))
    }

    async fn set_committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        let moved = {
            let mut offsets = self.offsets.write().await;
            let state = entry(&mut offsets, group, topic, kafka_partition);
            advance_committed(&mut state.committed, offset)?
        };
        if moved {
            self.checkpoint().await?;
        }
        Ok(())
    }

    async fn last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        let offsets = self.offsets.read().await;
        Ok(lookup(&offsets, group, topic, kafka_partition).and_then(|s| s.last_seen))
    }

    async fn set_last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        {
            let mut offsets = self.offsets.write().await;
            let state = entry(&mut offsets, group, topic, kafka_partition);
            state.last_seen = Some(state.last_seen.map_or(offset, |seen| seen.max(offset)));
        }
        let pending = self.pending_updates.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= CHECKPOINT_INTERVAL {
            self.checkpoint().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.checkpoint().await
    }
}

fn lookup<'a>(
    offsets: &'a GroupOffsets,
    group: &str,
    topic: &str,
    kafka_partition: u32,
) -> Option<&'a OffsetState> {
    offsets.get(group)?.get(topic)?.get(&kafka_partition)
}

fn entry<'a>(
    offsets: &'a mut GroupOffsets,
    group: &str,
    topic: &str,
    kafka_partition: u32,
) -> &'a mut OffsetState {
    offsets
        .entry(group.to_string())
        .or_default()
        .entry(topic.to_string())
        .or_default()
        .entry(kafka_partition)
        .or_default()
}

/// Wraps a store, failing a configurable number of `set_committed` calls.
/// Test instrumentation for the upload/commit retry path.
pub struct FlakyOffsetStore<S> {
    inner: S,
    commit_failures: AtomicU32,
}

impl<S: OffsetStore> FlakyOffsetStore<S> {
    pub fn new(inner: S, commit_failures: u32) -> Self {
        Self {
            inner,
            commit_failures: AtomicU32::new(commit_failures),
        }
    }
}

#[async_trait]
impl<S: OffsetStore> OffsetStore for FlakyOffsetStore<S> {
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        self.inner.committed(group, topic, kafka_partition).await
    }

    async fn set_committed(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        let remaining = self.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.commit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ShipperError::offset_store("injected commit failure"));
        }
        self.inner
            .set_committed(group, topic, kafka_partition, offset)
            .await
    }

    async fn last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
    ) -> Result<Option<u64>> {
        self.inner.last_seen(group, topic, kafka_partition).await
    }

    async fn set_last_seen(
        &self,
        group: &str,
        topic: &str,
        kafka_partition: u32,
        offset: u64,
    ) -> Result<()> {
        self.inner
            .set_last_seen(group, topic, kafka_partition, offset)
            .await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryOffsetStore::new();
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), None);

        store.set_committed("g", "t", 0, 102).await.unwrap();
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), Some(102));

        store.set_last_seen("g", "t", 0, 110).await.unwrap();
        assert_eq!(store.last_seen("g", "t", 0).await.unwrap(), Some(110));
    }

    #[tokio::test]
    async fn test_committed_is_monotonic() {
        let store = MemoryOffsetStore::new();
        store.set_committed("g", "t", 0, 100).await.unwrap();

        // same value is an accepted no-op (crash-retry path)
        store.set_committed("g", "t", 0, 100).await.unwrap();

        let err = store.set_committed("g", "t", 0, 99).await.unwrap_err();
        assert!(matches!(err, ShipperError::Invariant(_)));
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_last_seen_ignores_regressions() {
        let store = MemoryOffsetStore::new();
        store.set_last_seen("g", "t", 0, 50).await.unwrap();
        store.set_last_seen("g", "t", 0, 20).await.unwrap();
        assert_eq!(store.last_seen("g", "t", 0).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = MemoryOffsetStore::new();
        store.set_committed("g", "t", 0, 10).await.unwrap();
        store.set_committed("g", "t", 1, 20).await.unwrap();
        store.set_committed("g", "other", 0, 30).await.unwrap();

        assert_eq!(store.committed("g", "t", 0).await.unwrap(), Some(10));
        assert_eq!(store.committed("g", "t", 1).await.unwrap(), Some(20));
        assert_eq!(store.committed("g", "other", 0).await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileOffsetStore::open(dir.path()).unwrap();
            store.set_committed("g", "t", 3, 102).await.unwrap();
            store.set_last_seen("g", "t", 3, 110).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = FileOffsetStore::open(dir.path()).unwrap();
        assert_eq!(store.committed("g", "t", 3).await.unwrap(), Some(102));
        assert_eq!(store.last_seen("g", "t", 3).await.unwrap(), Some(110));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_checkpoint_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("offsets.json"), b"not json").unwrap();

        let store = FileOffsetStore::open(dir.path()).unwrap();
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flaky_store_fails_then_recovers() {
        let store = FlakyOffsetStore::new(MemoryOffsetStore::new(), 1);
        let err = store.set_committed("g", "t", 0, 10).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_committed("g", "t", 0, 10).await.unwrap();
        assert_eq!(store.committed("g", "t", 0).await.unwrap(), Some(10));
    }
}
