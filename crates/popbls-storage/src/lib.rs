//! Content store abstraction + HTTP fetch utilities.
//!
//! The pipeline only ever talks to a [`ContentStore`]; concrete backends are
//! chosen once at process entry and injected as `Arc<dyn ContentStore>`.

use async_trait::async_trait;
use popbls_core::ObjectInfo;
use sha2::{Digest, Sha256};
use thiserror::Error;

mod fs_store;
mod http;
mod memory;
mod s3;

pub use fs_store::FsContentStore;
pub use http::{
    ensure_success, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer,
};
pub use memory::MemoryContentStore;
pub use s3::{S3ContentStore, S3StoreConfig};

pub const CRATE_NAME: &str = "popbls-storage";

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// Versioned key/value blob store addressed by hierarchical string keys.
///
/// `list` matches keys by plain string prefix, like S3 `ListObjectsV2`.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Bucket (or logical store name) this handle is bound to.
    fn bucket(&self) -> &str;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError>;

    /// Metadata for `key`, or `None` when no object exists there.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Write (or overwrite) `key`.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo, StoreError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.head(key).await?.is_some())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// MD5 hex digest, comparable with the ETag S3 reports for single-part uploads.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part == ".." || part == ".")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
