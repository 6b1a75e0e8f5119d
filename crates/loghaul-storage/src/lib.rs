//! Blob store drivers for loghaul
//!
//! The shipper talks to remote storage through the minimal [`BlobStore`]
//! trait: upload a local file under a key, list keys, delete a key. Keys
//! are slash-separated paths relative to the store's root URI, and
//! uploading an existing key overwrites it — retried uploads of the same
//! file are idempotent because object names encode the first message
//! offset.
//!
//! # Drivers
//!
//! - **local** - a directory on the local filesystem (`file://`)
//! - **memory** - in-process map, for tests and dry runs (`memory://`)
//! - **s3** - Amazon S3 and S3-compatible storage, behind the `s3` feature
//!   (`s3://bucket/root`)
//!
//! # Feature Flags
//!
//! ```toml
//! # S3 support
//! loghaul-storage = { version = "0.3", features = ["s3"] }
//! ```

pub mod local;
pub mod memory;

#[cfg(feature = "s3")]
pub mod s3;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use loghaul_core::{Result, ShipperError};

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

/// Remote object storage, minimal surface
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a local file under `key`, overwriting any existing object
    async fn upload(&self, local: &Path, key: &str) -> Result<()>;

    /// Keys under the given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A parsed remote root URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobUri {
    /// `file:///var/archive` or a bare path
    File { root: String },
    /// `memory://`
    Memory,
    /// `s3://bucket/root/prefix`
    S3 { bucket: String, root: String },
}

impl BlobUri {
    /// Parse a root URI.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for unknown schemes or an S3 URI without a
    /// bucket.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, root) = match rest.split_once('/') {
                Some((bucket, root)) => (bucket, root.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(ShipperError::config(format!("s3 uri {} has no bucket", uri)));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                root: root.to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(Self::File {
                root: rest.to_string(),
            });
        }
        if uri.starts_with("memory://") {
            return Ok(Self::Memory);
        }
        if uri.starts_with('/') {
            return Ok(Self::File {
                root: uri.to_string(),
            });
        }
        Err(ShipperError::config(format!("unsupported remote uri {}", uri)))
    }
}

/// Build the driver for a remote root URI.
///
/// # Errors
///
/// Returns a `Config` error for unknown schemes, or for `s3://` URIs when
/// the crate was built without the `s3` feature.
pub async fn build_store(uri: &str) -> Result<Arc<dyn BlobStore>> {
    match BlobUri::parse(uri)? {
        BlobUri::File { root } => Ok(Arc::new(LocalBlobStore::new(root.into()))),
        BlobUri::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        #[cfg(feature = "s3")]
        BlobUri::S3 { bucket, root } => Ok(Arc::new(S3BlobStore::connect(bucket, root).await?)),
        #[cfg(not(feature = "s3"))]
        BlobUri::S3 { .. } => Err(ShipperError::config(
            "s3 uri requires the loghaul-storage `s3` feature",
        )),
    }
}
