use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a file's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    Local,
    S3Compatible,
    ManagedObjectStore,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::S3Compatible => "s3-compatible",
            StorageType::ManagedObjectStore => "managed-object-store",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, StorageType::Local)
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend plus the key/path under which the bytes were written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocator {
    pub storage_type: StorageType,
    pub key: String,
}

impl StorageLocator {
    pub fn new(storage_type: StorageType, key: impl Into<String>) -> Self {
        Self {
            storage_type,
            key: key.into(),
        }
    }

    pub fn local(key: impl Into<String>) -> Self {
        Self::new(StorageType::Local, key)
    }
}

impl std::fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage_type, self.key)
    }
}

/// Access-recency cost classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Cold,
    Archive,
}

/// Classification of a file derived from its MIME type
/// A file record stored in redb.
///
/// `logical_size` is what the owner is charged for; `physical_size` is the
/// number of bytes this record alone keeps on a backend. Deduplication
/// references have `physical_size == 0` and `reference_of` pointing at the
/// record that holds the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub mime_type: String,
    pub logical_size: u64,
    pub physical_size: u64,
    pub storage_type: StorageType,
    pub storage_key: String,
    #[serde(default)]
    pub content_fingerprint: Option<String>,
    #[serde(default)]
    pub reference_of: Option<String>,

    // Lifecycle
    #[serde(default)]
    pub cold_storage: bool,
    #[serde(default)]
    pub cold_storage_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,

    // Trash
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn locator(&self) -> StorageLocator {
        StorageLocator::new(self.storage_type, self.storage_key.clone())
    }

    /// Archive is a terminal label and wins over the cold flag.
    pub fn tier(&self) -> StorageTier {
        if self.archived_at.is_some() {
            StorageTier::Archive
        } else if self.cold_storage {
            StorageTier::Cold
        } else {
            StorageTier::Hot
        }
    }

    pub fn is_reference(&self) -> bool {
        self.reference_of.is_some()
    }
}

/// Outcome of a single-record mutation.
///
/// Background jobs race live traffic on the same rows, so "already in the
/// target state" and "gone" are ordinary results rather than errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    Applied(T),
    Unchanged(T),
    NotFound,
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Transition::Applied(v) | Transition::Unchanged(v) => Some(v),
            Transition::NotFound => None,
        }
    }
}
