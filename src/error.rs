use thiserror::Error;

use crate::cache::CacheError;
use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;

/// Errors surfaced by the orchestration core.
///
/// Provider failures only reach this type when no degraded path exists;
/// accounting and event failures are logged and counted instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Storage quota exceeded: {used} of {limit} bytes used, {requested} requested")]
    QuotaExceeded { used: u64, limit: u64, requested: u64 },

    #[error("Monthly bandwidth exceeded: {used} of {limit} bytes used, {requested} requested")]
    BandwidthExceeded { used: u64, limit: u64, requested: u64 },

    #[error("Storage backend error: {0}")]
    StorageBackend(ObjectStoreError),

    #[error("Deduplication failed: {0}")]
    Deduplication(String),

    #[error("File not found: {0}")]
    RecordNotFound(String),

    #[error("File {file_id} has a record but no bytes at {locator}")]
    OrphanFile { file_id: String, locator: String },

    #[error(transparent)]
    Metadata(#[from] DatabaseError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<ObjectStoreError> for Error {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::OwnershipMismatch(key) => {
                Error::Authorization(format!("object {key} belongs to another owner"))
            }
            other => Error::StorageBackend(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
