//! Per-owner content deduplication.
//!
//! Fingerprints are only ever compared inside one owner's namespace. A
//! duplicate shares the holder's bytes either through a hard link (both
//! copies local) or by pointing at the holder's key; either way the record
//! keeps its logical size and drops its physical size to zero.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{DeleteOutcome, Reference, StorageBackend};
use crate::error::{Error, Result};
use crate::metrics;
use crate::object_store::keys::{self, ObjectName};
use crate::storage::models::{FileRecord, StorageLocator, Transition};
use crate::storage::MetadataStore;

#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    /// The record whose bytes can be shared.
    pub existing: Option<FileRecord>,
}

impl DuplicateCheck {
    fn none() -> Self {
        Self {
            is_duplicate: false,
            existing: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    /// Checked before the upload was acknowledged.
    Sync,
    /// Runs after the response, from the background queue.
    Deferred,
}

pub struct DeduplicationEngine {
    backend: Arc<StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    sync_threshold: u64,
}

impl DeduplicationEngine {
    pub fn new(
        backend: Arc<StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        sync_threshold: u64,
    ) -> Self {
        Self {
            backend,
            metadata,
            sync_threshold,
        }
    }

    pub fn mode_for(&self, size: u64) -> DedupMode {
        if size < self.sync_threshold {
            DedupMode::Sync
        } else {
            DedupMode::Deferred
        }
    }

    /// Find a record of `owner_id` with the same fingerprint whose bytes are
    /// still present. Records that hold bytes themselves are preferred over
    /// references. `accept` filters candidates (e.g. to skip the caller's
    /// own record).
    pub async fn check_duplicate<F>(
        &self,
        owner_id: &str,
        fingerprint: &str,
        accept: F,
    ) -> Result<DuplicateCheck>
    where
        F: Fn(&FileRecord) -> bool + Send,
    {
        let mut candidates: Vec<FileRecord> = self
            .metadata
            .find_by_fingerprint(owner_id, fingerprint)
            .await?
            .into_iter()
            .filter(|f| f.owner_id == owner_id && accept(f))
            .collect();
        candidates.sort_by_key(|f| (f.is_reference(), f.is_deleted, f.created_at));

        for candidate in candidates {
            if self.backend.exists(&candidate.locator(), owner_id).await {
                debug!(owner_id, file_id = %candidate.id, "Duplicate content found");
                return Ok(DuplicateCheck {
                    is_duplicate: true,
                    existing: Some(candidate),
                });
            }
            warn!(
                owner_id,
                file_id = %candidate.id,
                locator = %candidate.locator(),
                "Duplicate candidate has no bytes, skipping"
            );
        }
        Ok(DuplicateCheck::none())
    }

    /// Share `existing`'s bytes under a new object name without writing
    /// them again. Used before anything was persisted for the upload.
    pub async fn reference_for_upload(
        &self,
        existing: &FileRecord,
        name: &ObjectName,
    ) -> Result<Reference> {
        let owner_id = &existing.owner_id;
        let target = StorageLocator::local(keys::local_key(owner_id, name));
        self.backend
            .create_reference(&existing.locator(), &target, owner_id)
            .await
            .map_err(|e| Error::Deduplication(e.to_string()))
    }

    /// Turn an already-stored record into a reference to `existing`.
    ///
    /// The record's own copy is released only after its metadata points at
    /// the shared bytes. Any failure leaves the independent copy in place.
    pub async fn create_reference(
        &self,
        record: &FileRecord,
        existing: &FileRecord,
    ) -> Result<FileRecord> {
        if record.owner_id != existing.owner_id {
            return Err(Error::Authorization(
                "deduplication across owners is not allowed".to_string(),
            ));
        }
        let own = record.locator();
        let reference = self
            .backend
            .create_reference(&existing.locator(), &own, &record.owner_id)
            .await
            .map_err(|e| Error::Deduplication(e.to_string()))?;

        let holder = existing
            .reference_of
            .clone()
            .unwrap_or_else(|| existing.id.clone());
        let updated = match self
            .metadata
            .resolve_duplicate(&record.id, reference.locator(), &holder)
            .await?
        {
            Transition::Applied(f) | Transition::Unchanged(f) => f,
            Transition::NotFound => return Err(Error::RecordNotFound(record.id.clone())),
        };

        if let Reference::Shared(ref shared) = reference {
            if *shared != own
                && self.backend.delete(&own, &record.owner_id).await == DeleteOutcome::Failed
            {
                warn!(file_id = %record.id, locator = %own, "Deduplicated copy left behind");
            }
        }

        info!(
            file_id = %record.id,
            holder = %holder,
            locator = %updated.locator(),
            "File deduplicated"
        );
        Ok(updated)
    }

    /// Free the bytes a record no longer needs (after purge or content
    /// replacement), unless another record of the same owner still uses them.
    ///
    /// If `record` held the bytes, or referenced a holder that is already
    /// gone, one of the remaining sharers is promoted to be the new holder
    /// and the rest are pointed at it.
    pub async fn release(&self, record: &FileRecord) {
        let owner_id = &record.owner_id;
        let locator = record.locator();

        let sharers: Vec<FileRecord> = match record.content_fingerprint {
            Some(ref fp) => match self.metadata.find_by_fingerprint(owner_id, fp).await {
                Ok(files) => files.into_iter().filter(|f| f.id != record.id).collect(),
                Err(e) => {
                    // Without the sharer list deleting could orphan another record.
                    warn!(
                        file_id = %record.id,
                        error = %e,
                        "Could not look up sharers, keeping bytes"
                    );
                    metrics::record_best_effort_failure("dedup_release");
                    return;
                }
            },
            None => Vec::new(),
        };

        let mut previous = vec![record.id.clone()];
        let held_bytes = match record.reference_of {
            None => true,
            Some(ref holder) => match self.metadata.get_file(holder).await {
                Ok(None) => {
                    previous.push(holder.clone());
                    true
                }
                Ok(Some(_)) => false,
                Err(e) => {
                    warn!(file_id = %record.id, %holder, error = %e, "Could not look up holder");
                    false
                }
            },
        };

        if held_bytes {
            let heir = sharers
                .iter()
                .find(|f| f.locator() == locator)
                .or_else(|| {
                    sharers.iter().find(|f| {
                        f.reference_of
                            .as_ref()
                            .is_some_and(|holder| previous.contains(holder))
                    })
                });
            if let Some(heir) = heir {
                match self.metadata.promote_holder(&heir.id, &previous).await {
                    Ok(_) => info!(
                        file_id = %heir.id,
                        previous = %record.id,
                        "Reference promoted to holder"
                    ),
                    Err(e) => {
                        warn!(file_id = %heir.id, error = %e, "Failed to promote reference");
                        metrics::record_best_effort_failure("dedup_promote");
                    }
                }
            }
        }

        if sharers.iter().any(|f| f.locator() == locator) {
            debug!(file_id = %record.id, %locator, "Bytes still shared, not deleting");
            return;
        }
        self.backend.delete(&locator, owner_id).await;
    }
}
