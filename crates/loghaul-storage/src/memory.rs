//! In-memory blob store
//!
//! Byte-for-byte inspectable storage for tests, with optional failure
//! injection for exercising upload retry paths.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use loghaul_core::{Result, ShipperError};

use crate::BlobStore;

/// Objects in a process-local map
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Bytes>>,
    puts: AtomicU64,
    upload_failures: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` uploads with a retryable error
    pub fn fail_next_uploads(&self, count: u32) {
        self.upload_failures.store(count, Ordering::SeqCst);
    }

    /// Total successful uploads, including overwrites
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Snapshot of an object's bytes
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    /// All stored keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let remaining = self.upload_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.upload_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ShipperError::upload("injected upload failure"));
        }
        let bytes = tokio::fs::read(local).await?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), Bytes::from(bytes));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}
