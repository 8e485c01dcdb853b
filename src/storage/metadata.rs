//! The metadata-store seam the orchestration core talks to.
//!
//! Every mutation is scoped to one record id and reports a [`Transition`];
//! callers treat `Unchanged` and `NotFound` as no-ops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, StorageLocator, Transition};

/// New bytes for an existing record.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    pub locator: StorageLocator,
    pub logical_size: u64,
    pub physical_size: u64,
    pub mime_type: String,
    pub fingerprint: Option<String>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_file(&self, file: &FileRecord) -> Result<(), DatabaseError>;
    async fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError>;
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError>;
    async fn list_owners(&self) -> Result<Vec<String>, DatabaseError>;
    async fn find_by_fingerprint(
        &self,
        owner_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<FileRecord>, DatabaseError>;

    async fn rename(&self, id: &str, name: &str) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn set_fingerprint(
        &self,
        id: &str,
        fingerprint: &str,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    /// Point a record at another record's bytes: locator replaced, physical size zeroed.
    async fn resolve_duplicate(
        &self,
        id: &str,
        locator: &StorageLocator,
        reference_of: &str,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    /// Make `heir_id` the physical holder of its bytes and re-point the
    /// records that referenced any of `previous_holders` at it.
    async fn promote_holder(
        &self,
        heir_id: &str,
        previous_holders: &[String],
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn replace_content(
        &self,
        id: &str,
        update: ContentUpdate,
    ) -> Result<Transition<FileRecord>, DatabaseError>;

    async fn soft_delete(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn restore(&self, id: &str) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn permanent_delete(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError>;
    /// Permanently delete only if the record is still trashed since before `deleted_before`.
    async fn purge_trashed(
        &self,
        id: &str,
        deleted_before: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError>;

    async fn mark_cold(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn mark_archived(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn restore_from_cold(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
    async fn touch_accessed(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError>;
}

#[async_trait]
impl MetadataStore for Database {
    async fn create_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        self.put_file(file)
    }

    async fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        Database::get_file(self, id)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        self.get_files_by_owner(owner_id)
    }

    async fn list_owners(&self) -> Result<Vec<String>, DatabaseError> {
        self.get_owners()
    }

    async fn find_by_fingerprint(
        &self,
        owner_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.get_files_by_fingerprint(owner_id, fingerprint)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.name == name {
                return false;
            }
            file.name = name.to_string();
            true
        })
    }

    async fn set_fingerprint(
        &self,
        id: &str,
        fingerprint: &str,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.content_fingerprint.as_deref() == Some(fingerprint) {
                return false;
            }
            file.content_fingerprint = Some(fingerprint.to_string());
            true
        })
    }

    async fn resolve_duplicate(
        &self,
        id: &str,
        locator: &StorageLocator,
        reference_of: &str,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.reference_of.as_deref() == Some(reference_of) && file.locator() == *locator {
                return false;
            }
            file.storage_type = locator.storage_type;
            file.storage_key = locator.key.clone();
            file.physical_size = 0;
            file.reference_of = Some(reference_of.to_string());
            true
        })
    }

    async fn promote_holder(
        &self,
        heir_id: &str,
        previous_holders: &[String],
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        Database::promote_holder(self, heir_id, previous_holders)
    }

    async fn replace_content(
        &self,
        id: &str,
        update: ContentUpdate,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, move |file| {
            file.storage_type = update.locator.storage_type;
            file.storage_key = update.locator.key;
            file.logical_size = update.logical_size;
            file.physical_size = update.physical_size;
            file.mime_type = update.mime_type;
            file.content_fingerprint = update.fingerprint;
            file.reference_of = None;
            true
        })
    }

    async fn soft_delete(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.is_deleted {
                return false;
            }
            file.is_deleted = true;
            file.deleted_at = Some(at);
            true
        })
    }

    async fn restore(&self, id: &str) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if !file.is_deleted {
                return false;
            }
            file.is_deleted = false;
            file.deleted_at = None;
            true
        })
    }

    async fn permanent_delete(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        self.delete_file(id)
    }

    async fn purge_trashed(
        &self,
        id: &str,
        deleted_before: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.delete_file_if(id, |file| {
            file.is_deleted && file.deleted_at.is_some_and(|at| at < deleted_before)
        })
    }

    async fn mark_cold(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.cold_storage {
                return false;
            }
            file.cold_storage = true;
            file.cold_storage_date = Some(at);
            true
        })
    }

    async fn mark_archived(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if !file.cold_storage || file.archived_at.is_some() {
                return false;
            }
            file.archived_at = Some(at);
            true
        })
    }

    async fn restore_from_cold(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            file.cold_storage = false;
            file.cold_storage_date = None;
            file.last_accessed_at = at;
            true
        })
    }

    async fn touch_accessed(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        self.mutate_file(id, |file| {
            if file.last_accessed_at >= at {
                return false;
            }
            file.last_accessed_at = at;
            true
        })
    }
}
