//! Amazon S3 blob store
//!
//! Works against S3 and S3-compatible services (MinIO, LocalStack, R2).
//! Credentials come from the default AWS provider chain; a custom endpoint
//! can be set through `AWS_ENDPOINT_URL` for compatible services.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::debug;

use loghaul_core::{Result, ShipperError};

use crate::BlobStore;

/// S3 bucket driver
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    root: String,
}

impl S3BlobStore {
    /// Connect using the default AWS configuration chain
    pub async fn connect(bucket: String, root: String) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = S3Client::new(&aws_config);
        Ok(Self::with_client(client, bucket, root))
    }

    /// Use an externally configured client (custom endpoint, credentials)
    pub fn with_client(client: S3Client, bucket: String, root: String) -> Self {
        Self {
            client,
            bucket,
            root: root.trim_matches('/').to_string(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let object_key = self.object_key(key);
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| ShipperError::upload(format!("read {}: {}", local.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(body)
            .send()
            .await
            .map_err(|e| ShipperError::upload(format!("put s3://{}/{}: {}", self.bucket, object_key, e)))?;

        debug!(bucket = %self.bucket, key = %object_key, "stored object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.object_key(prefix);
        let mut keys = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ShipperError::transient(format!("list s3://{}/{}: {}", self.bucket, full_prefix, e))
            })?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let relative = if self.root.is_empty() {
                        key.to_string()
                    } else {
                        key.strip_prefix(&format!("{}/", self.root))
                            .unwrap_or(key)
                            .to_string()
                    };
                    keys.push(relative);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_key = self.object_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                ShipperError::transient(format!(
                    "delete s3://{}/{}: {}",
                    self.bucket, object_key, e
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &str) -> S3BlobStore {
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .build();
        S3BlobStore::with_client(S3Client::from_conf(config), "bucket".into(), root.into())
    }

    #[test]
    fn test_object_key_with_root() {
        let s = store("archive/raw");
        assert_eq!(s.object_key("events/f.log"), "archive/raw/events/f.log");
        assert_eq!(s.object_key("/events/f.log"), "archive/raw/events/f.log");
    }

    #[test]
    fn test_object_key_without_root() {
        let s = store("");
        assert_eq!(s.object_key("events/f.log"), "events/f.log");
    }
}
