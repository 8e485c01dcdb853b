mod gcs;
pub mod keys;
mod local;
mod s3;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use s3::{S3Credentials, S3Store};

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use crate::storage::models::StorageType;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("Key {0} is outside the owner's namespace")]
    OwnershipMismatch(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ObjectStoreError {
    /// Transient failures are the ones a fallback path may absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Io(_) | ObjectStoreError::Backend(_) | ObjectStoreError::Timeout(_)
        )
    }
}

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ObjectStoreError>> + Send>>;

/// Abstraction over object storage backends.
/// Keys are namespaced per owner; the raw blobs are meaningless without the metadata DB.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn storage_type(&self) -> StorageType;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    /// Upload the contents of a local file without buffering it in memory.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn get_stream(&self, key: &str) -> Result<ByteStream, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
    /// Time-limited URL for direct reads. Local stores return a filesystem path.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError>;
}
