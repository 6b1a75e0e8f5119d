//! Upload and commit
//!
//! One flush cycle for a (topic, kafka-partition):
//!
//! 1. seal every open file (the owning loop is suspended, so nothing races
//!    the snapshot),
//! 2. upload the finalized files, in parallel through the shared bounded
//!    pool, each with capped backoff,
//! 3. only after **all** uploads succeeded, advance the committed offset to
//!    `max(last_offset) + 1` - this write is the linearization point,
//! 4. delete the local files and drop the entries.
//!
//! A crash between 2 and 3 leaves uploaded objects without a commit; the
//! orphan scan re-uploads them on restart, overwriting byte-identical
//! objects under the same names. Exhausted retries are partition-fatal and
//! leave the committed offset untouched.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use loghaul_core::config::UploaderConfig;
use loghaul_core::offset::OffsetStore;
use loghaul_core::retry::{retry, RetryConfig};
use loghaul_core::{Result, ShipperError};
use loghaul_storage::BlobStore;

use crate::registry::FileRegistry;

/// Outcome of one non-empty flush cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadCycle {
    /// New committed boundary
    pub committed: u64,
    /// Files uploaded
    pub files: u64,
    /// On-disk bytes uploaded
    pub bytes: u64,
}

/// Uploads sealed registry entries and advances committed offsets
pub struct Uploader {
    store: Arc<dyn BlobStore>,
    offsets: Arc<dyn OffsetStore>,
    group: String,
    output_pattern: Option<String>,
    retry: RetryConfig,
    /// Bounded upload pool shared across all consumer loops
    pool: Arc<Semaphore>,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn BlobStore>,
        offsets: Arc<dyn OffsetStore>,
        group: impl Into<String>,
        output_pattern: Option<String>,
        config: &UploaderConfig,
    ) -> Self {
        let retry = RetryConfig::default()
            .with_max_retries(config.max_retries)
            .with_initial_delay(std::time::Duration::from_millis(config.initial_delay_ms))
            .with_max_delay(std::time::Duration::from_millis(config.max_delay_ms));
        Self {
            store,
            offsets,
            group: group.into(),
            output_pattern: output_pattern.clone(),
            retry,
            pool: Arc::new(Semaphore::new(config.parallelism.max(1))),
        }
    }

    /// Upload everything the registry holds and commit the new offset
    /// boundary. Returns `None` when there was nothing to flush.
    pub async fn upload_partition(&self, registry: &mut FileRegistry) -> Result<Option<UploadCycle>> {
        if registry.is_empty() {
            return Ok(None);
        }

        let topic = registry.topic().to_string();
        let kafka_partition = registry.kafka_partition();

        registry.seal_all()?;
        let candidate = registry
            .max_last_offset()
            .ok_or_else(|| ShipperError::invariant("non-empty registry without offsets"))?
            + 1;

        // remote keys use the configured pattern; local staging files never
        // do, so the orphan scan can parse them back
        let uploads: Vec<(PathBuf, String, u64)> = registry
            .entries()
            .map(|entry| {
                let key = entry
                    .path
                    .with_prefix("")
                    .with_pattern(self.output_pattern.clone())
                    .render();
                (entry.local_path.clone(), key, entry.bytes_written)
            })
            .collect();
        let files = uploads.len() as u64;
        let bytes = uploads.iter().map(|(_, _, b)| *b).sum();

        futures::future::try_join_all(
            uploads
                .iter()
                .map(|(local, key, _)| self.upload_file(local, key)),
        )
        .await?;

        // the linearization point: committed advances only after every
        // upload of the cycle succeeded
        let offsets = self.offsets.clone();
        let group = self.group.clone();
        retry(&self.retry, || {
            let offsets = offsets.clone();
            let group = group.clone();
            let topic = topic.clone();
            async move {
                offsets
                    .set_committed(&group, &topic, kafka_partition, candidate)
                    .await
            }
        })
        .await?;

        registry.drop_all()?;

        info!(
            topic = %topic,
            kafka_partition,
            committed = candidate,
            files,
            bytes,
            "flush cycle committed"
        );
        Ok(Some(UploadCycle {
            committed: candidate,
            files,
            bytes,
        }))
    }

    async fn upload_file(&self, local: &std::path::Path, key: &str) -> Result<()> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ShipperError::invariant("upload pool closed"))?;
        retry(&self.retry, || {
            let store = self.store.clone();
            let local = local.to_path_buf();
            let key = key.to_string();
            async move { store.upload(&local, &key).await }
        })
        .await?;
        debug!(key, "uploaded file");
        Ok(())
    }
}
