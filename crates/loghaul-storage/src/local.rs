//! Local filesystem blob store
//!
//! Stores objects as plain files under a root directory. Useful for
//! development and for archiving onto mounted network storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use loghaul_core::{Result, ShipperError};

use crate::BlobStore;

/// Objects as files under a root directory
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ShipperError::upload(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| ShipperError::upload(format!("copy to {}: {}", target.display(), e)))?;
        debug!(key, target = %target.display(), "stored object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_list_delete() {
        let remote = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let store = LocalBlobStore::new(remote.path().to_path_buf());

        let local = staging.path().join("file.log");
        tokio::fs::write(&local, b"payload").await.unwrap();

        store
            .upload(&local, "events/dt=2024-01-02/0_0_00000000000000000000.log")
            .await
            .unwrap();

        let keys = store.list("events/").await.unwrap();
        assert_eq!(
            keys,
            vec!["events/dt=2024-01-02/0_0_00000000000000000000.log".to_string()]
        );
        assert!(store.list("other/").await.unwrap().is_empty());

        store
            .delete("events/dt=2024-01-02/0_0_00000000000000000000.log")
            .await
            .unwrap();
        assert!(store.list("events/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_overwrites() {
        let remote = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let store = LocalBlobStore::new(remote.path().to_path_buf());

        let local = staging.path().join("file.log");
        tokio::fs::write(&local, b"first").await.unwrap();
        store.upload(&local, "k").await.unwrap();
        tokio::fs::write(&local, b"second").await.unwrap();
        store.upload(&local, "k").await.unwrap();

        assert_eq!(
            tokio::fs::read(remote.path().join("k")).await.unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let remote = tempdir().unwrap();
        let store = LocalBlobStore::new(remote.path().to_path_buf());
        store.delete("missing").await.unwrap();
    }
}
