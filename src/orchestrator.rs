//! End-to-end file operations composed from the storage, dedup, ledger,
//! lifecycle and event components.
//!
//! An upload moves through the stages of [`UploadStage`]. Anything that
//! fails before the record exists removes the bytes it wrote; anything after
//! the response is background work whose failures are logged, counted and
//! compensated by reconciliation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{Reference, SaveSource, StorageBackend};
use crate::dedup::{DedupMode, DeduplicationEngine};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::fingerprint;
use crate::lifecycle::LifecycleManager;
use crate::listing::ListingCache;
use crate::metrics;
use crate::object_store::keys::{self, ObjectName};
use crate::object_store::{ByteStream, ObjectStoreError};
use crate::plans::PlanDirectory;
use crate::preprocess::Preprocessor;
use crate::quota::{BandwidthLedger, BandwidthState, QuotaLedger, QuotaState};
use crate::storage::models::{FileRecord, StorageLocator, Transition};
use crate::storage::{ContentUpdate, MetadataStore};
use crate::tasks::BackgroundQueue;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Received,
    Validated,
    Preprocessed,
    QuotaReserved,
    DedupChecked,
    Persisted,
    Recorded,
    Acknowledged,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::Received => "received",
            UploadStage::Validated => "validated",
            UploadStage::Preprocessed => "preprocessed",
            UploadStage::QuotaReserved => "quota_reserved",
            UploadStage::DedupChecked => "dedup_checked",
            UploadStage::Persisted => "persisted",
            UploadStage::Recorded => "recorded",
            UploadStage::Acknowledged => "acknowledged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: String,
    pub file_name: String,
    /// Guessed from the file name when absent.
    pub mime_type: Option<String>,
    pub data: Bytes,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub file: FileRecord,
    pub is_duplicate: bool,
    /// Deduplication will run after the response.
    pub dedup_pending: bool,
}

pub struct Download {
    pub file: FileRecord,
    pub stream: ByteStream,
}

/// Everything the orchestrator composes.
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataStore>,
    pub backend: Arc<StorageBackend>,
    pub dedup: Arc<DeduplicationEngine>,
    pub quota: Arc<QuotaLedger>,
    pub bandwidth: Arc<BandwidthLedger>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: Arc<EventBus>,
    pub plans: Arc<dyn PlanDirectory>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub listing: Arc<ListingCache>,
    pub queue: Arc<BackgroundQueue>,
}

pub struct UploadOrchestrator {
    metadata: Arc<dyn MetadataStore>,
    backend: Arc<StorageBackend>,
    dedup: Arc<DeduplicationEngine>,
    quota: Arc<QuotaLedger>,
    bandwidth: Arc<BandwidthLedger>,
    lifecycle: Arc<LifecycleManager>,
    events: Arc<EventBus>,
    plans: Arc<dyn PlanDirectory>,
    preprocessor: Arc<dyn Preprocessor>,
    listing: Arc<ListingCache>,
    queue: Arc<BackgroundQueue>,
    max_upload_size: u64,
}

fn file_event(file: &FileRecord) -> serde_json::Value {
    serde_json::json!({
        "fileId": file.id,
        "ownerId": file.owner_id,
        "name": file.name,
        "mimeType": file.mime_type,
        "size": file.logical_size,
        "storageType": file.storage_type,
    })
}

fn validate_owner(owner_id: &str) -> Result<()> {
    if keys::is_valid_owner_id(owner_id) {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid owner id: {owner_id:?}")))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("File name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "File name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains('/') || name.contains('\\') || name.chars().any(char::is_control) {
        return Err(Error::Validation(
            "File name contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

fn signed(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

async fn hash(data: Bytes) -> Result<String> {
    tokio::task::spawn_blocking(move || fingerprint::of_bytes(&data))
        .await
        .map_err(|e| Error::Deduplication(format!("fingerprint task failed: {e}")))
}

impl UploadOrchestrator {
    pub fn new(c: Collaborators, max_upload_size: u64) -> Self {
        Self {
            metadata: c.metadata,
            backend: c.backend,
            dedup: c.dedup,
            quota: c.quota,
            bandwidth: c.bandwidth,
            lifecycle: c.lifecycle,
            events: c.events,
            plans: c.plans,
            preprocessor: c.preprocessor,
            listing: c.listing,
            queue: c.queue,
            max_upload_size,
        }
    }

    /// Queue background work. A refused job leaves the owner's counters to
    /// the next reconciliation.
    fn submit<F>(&self, name: &'static str, owner_id: &str, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.queue.try_submit(name, work) {
            metrics::record_best_effort_failure("background_submit");
            self.quota.mark_dirty(owner_id);
        }
    }

    /// A record of `owner_id`, deleted or not.
    async fn owned(&self, owner_id: &str, file_id: &str) -> Result<FileRecord> {
        let file = self
            .metadata
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(file_id.to_string()))?;
        if file.owner_id != owner_id {
            return Err(Error::Authorization(format!(
                "file {file_id} belongs to another owner"
            )));
        }
        Ok(file)
    }

    async fn owned_live(&self, owner_id: &str, file_id: &str) -> Result<FileRecord> {
        let file = self.owned(owner_id, file_id).await?;
        if file.is_deleted {
            return Err(Error::RecordNotFound(file_id.to_string()));
        }
        Ok(file)
    }

    // ========================================================================
    // Upload
    // ========================================================================

    pub async fn upload(self: &Arc<Self>, request: UploadRequest) -> Result<UploadOutcome> {
        let started = Instant::now();
        let owner_id = request.owner_id.clone();
        let mut stage = UploadStage::Received;

        let result = self.run_upload(request, &mut stage).await;
        match result {
            Ok(ref outcome) => {
                let label = if outcome.is_duplicate { "duplicate" } else { "stored" };
                metrics::UPLOADS.with_label_values(&[label]).inc();
                metrics::UPLOAD_DURATION.observe(started.elapsed().as_secs_f64());
            }
            Err(ref e) => {
                warn!(owner_id = %owner_id, stage = stage.as_str(), error = %e, "Upload failed");
                metrics::UPLOADS.with_label_values(&["failed"]).inc();
            }
        }
        result
    }

    async fn run_upload(
        self: &Arc<Self>,
        request: UploadRequest,
        stage: &mut UploadStage,
    ) -> Result<UploadOutcome> {
        let UploadRequest {
            owner_id,
            file_name,
            mime_type,
            data,
            request_id,
        } = request;
        let request_id = request_id.as_deref();

        validate_owner(&owner_id)?;
        validate_name(&file_name)?;
        let size = data.len() as u64;
        if size == 0 {
            return Err(Error::Validation("File is empty".to_string()));
        }
        if size > self.max_upload_size {
            return Err(Error::Validation(format!(
                "File exceeds the maximum upload size of {} bytes",
                self.max_upload_size
            )));
        }
        let plan = self.plans.plan_for(&owner_id).await?;
        if size > plan.max_file_size {
            return Err(Error::Validation(format!(
                "File exceeds the {} plan limit of {} bytes",
                plan.name, plan.max_file_size
            )));
        }
        self.bandwidth.check(&owner_id, size, request_id).await?;
        *stage = UploadStage::Validated;

        let mime_type = mime_type.unwrap_or_else(|| {
            mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .to_string()
        });
        let prepared = self.preprocessor.prepare(data, &mime_type).await?;
        let data = prepared.data;
        let mime_type = prepared.mime_type;
        let size = data.len() as u64;
        *stage = UploadStage::Preprocessed;

        self.quota.check(&owner_id, size, request_id).await?;
        *stage = UploadStage::QuotaReserved;

        let file_id = uuid::Uuid::new_v4().to_string();
        let name = ObjectName::new(file_id.clone(), &file_name);
        let mode = self.dedup.mode_for(size);

        let mut fingerprint = None;
        let mut existing = None;
        if mode == DedupMode::Sync {
            match hash(data.clone()).await {
                Ok(fp) => {
                    match self.dedup.check_duplicate(&owner_id, &fp, |_| true).await {
                        Ok(check) => existing = check.existing,
                        Err(e) => warn!(
                            owner_id = %owner_id,
                            error = %e,
                            "Duplicate check failed, storing independently"
                        ),
                    }
                    fingerprint = Some(fp);
                }
                Err(e) => warn!(
                    owner_id = %owner_id,
                    error = %e,
                    "Fingerprinting failed, storing independently"
                ),
            }
        }
        *stage = UploadStage::DedupChecked;

        // (locator, physical size, holder id, bytes we created that cleanup must remove)
        type Stored = (StorageLocator, u64, Option<String>, Option<StorageLocator>);
        let mut stored: Option<Stored> = None;
        if let Some(ref holder) = existing {
            match self.dedup.reference_for_upload(holder, &name).await {
                Ok(reference) => {
                    let created = match reference {
                        Reference::Linked(ref l) => Some(l.clone()),
                        Reference::Shared(_) => None,
                    };
                    let holder_id = holder
                        .reference_of
                        .clone()
                        .unwrap_or_else(|| holder.id.clone());
                    metrics::DEDUP_HITS.with_label_values(&["sync"]).inc();
                    stored = Some((reference.locator().clone(), 0, Some(holder_id), created));
                }
                Err(e) => {
                    warn!(
                        owner_id = %owner_id,
                        holder = %holder.id,
                        error = %e,
                        "Reference failed, storing independent copy"
                    );
                    metrics::record_best_effort_failure("dedup_reference");
                }
            }
        }
        let (locator, physical_size, reference_of, created) = match stored {
            Some(s) => s,
            None => {
                let saved = self
                    .backend
                    .save(SaveSource::Bytes(data.clone()), &name, &owner_id)
                    .await?;
                if saved.fell_back {
                    warn!(
                        owner_id = %owner_id,
                        locator = %saved.locator,
                        "Stored on local fallback"
                    );
                }
                (saved.locator.clone(), saved.size, None, Some(saved.locator))
            }
        };
        *stage = UploadStage::Persisted;

        let now = Utc::now();
        let record = FileRecord {
            id: file_id,
            owner_id: owner_id.clone(),
            name: file_name,
            mime_type,
            logical_size: size,
            physical_size,
            storage_type: locator.storage_type,
            storage_key: locator.key.clone(),
            content_fingerprint: fingerprint,
            reference_of,
            cold_storage: false,
            cold_storage_date: None,
            archived_at: None,
            last_accessed_at: now,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.metadata.create_file(&record).await {
            if let Some(ref written) = created {
                self.backend.delete(written, &owner_id).await;
            }
            return Err(e.into());
        }
        *stage = UploadStage::Recorded;

        let is_duplicate = record.is_reference();
        info!(
            owner_id = %owner_id,
            file_id = %record.id,
            size,
            locator = %record.locator(),
            is_duplicate,
            "Upload recorded"
        );

        let deferred = mode == DedupMode::Deferred;
        self.schedule_post_upload(&record, deferred, request_id);
        *stage = UploadStage::Acknowledged;

        Ok(UploadOutcome {
            file: record,
            is_duplicate,
            dedup_pending: deferred,
        })
    }

    fn schedule_post_upload(
        self: &Arc<Self>,
        record: &FileRecord,
        deferred_dedup: bool,
        request_id: Option<&str>,
    ) {
        let this = Arc::clone(self);
        let record = record.clone();
        let owner_id = record.owner_id.clone();
        let request_id = request_id.map(str::to_string);

        self.submit("post_upload", &owner_id, async move {
            let owner_id = record.owner_id.clone();
            this.quota.apply(&owner_id, signed(record.logical_size)).await;
            this.bandwidth.record(&owner_id, record.logical_size).await;
            this.listing.invalidate(&owner_id).await;

            let mut payload = file_event(&record);
            payload["isDuplicate"] = serde_json::Value::Bool(record.is_reference());
            this.events
                .publish(EventType::FileUploaded, payload, request_id.as_deref())
                .await;

            if deferred_dedup {
                let result = this
                    .deduplicate_later(&record, request_id.as_deref())
                    .await;
                if let Err(e) = result {
                    warn!(
                        file_id = %record.id,
                        error = %e,
                        "Deferred deduplication failed, keeping copy"
                    );
                    metrics::record_best_effort_failure("dedup_deferred");
                }
            }
        });
    }

    /// Fingerprint a stored large file and fold it into an older identical
    /// one, retracting the quota charge for the duplicate.
    ///
    /// The bytes are streamed back from storage rather than kept alive in
    /// the queued job.
    async fn deduplicate_later(&self, record: &FileRecord, request_id: Option<&str>) -> Result<()> {
        let stream = self
            .backend
            .open_read_stream(&record.locator(), &record.owner_id)
            .await
            .map_err(|e| Error::Deduplication(e.to_string()))?;
        let fp = fingerprint::of_stream(stream)
            .await
            .map_err(|e| Error::Deduplication(e.to_string()))?;
        match self.metadata.set_fingerprint(&record.id, &fp).await? {
            Transition::NotFound => return Ok(()),
            Transition::Applied(_) | Transition::Unchanged(_) => {}
        }

        // Only fold into older records so two concurrent duplicates can't
        // end up referencing each other.
        let key = (record.created_at, record.id.clone());
        let check = self
            .dedup
            .check_duplicate(&record.owner_id, &fp, |f| {
                !f.is_deleted && (f.created_at, f.id.clone()) < key
            })
            .await?;
        let Some(existing) = check.existing else {
            debug!(file_id = %record.id, "No duplicate for deferred check");
            return Ok(());
        };

        // Re-read so a rename or content change in the meantime is respected.
        let current = match self.metadata.get_file(&record.id).await? {
            Some(f)
                if f.content_fingerprint.as_deref() == Some(fp.as_str()) && !f.is_reference() =>
            {
                f
            }
            _ => return Ok(()),
        };
        let updated = self.dedup.create_reference(&current, &existing).await?;
        metrics::DEDUP_HITS.with_label_values(&["deferred"]).inc();

        self.quota
            .apply(&record.owner_id, -signed(updated.logical_size))
            .await;
        self.quota.mark_dirty(&record.owner_id);
        self.listing.invalidate(&record.owner_id).await;

        let mut payload = file_event(&updated);
        payload["referenceOf"] = serde_json::Value::from(updated.reference_of.clone());
        self.events
            .publish(EventType::FileDeduplicated, payload, request_id)
            .await;
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_file(&self, owner_id: &str, file_id: &str) -> Result<FileRecord> {
        self.owned(owner_id, file_id).await
    }

    pub async fn list_files(&self, owner_id: &str) -> Result<Arc<Vec<FileRecord>>> {
        validate_owner(owner_id)?;
        Ok(self.listing.list(owner_id, self.metadata.as_ref()).await?)
    }

    pub async fn download(
        self: &Arc<Self>,
        owner_id: &str,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<Download> {
        let file = self.owned_live(owner_id, file_id).await?;
        self.bandwidth
            .check(owner_id, file.logical_size, request_id)
            .await?;

        let locator = file.locator();
        let orphan = || Error::OrphanFile {
            file_id: file.id.clone(),
            locator: locator.to_string(),
        };
        if !self.backend.exists(&locator, owner_id).await {
            warn!(file_id, %locator, "File bytes missing");
            return Err(orphan());
        }
        let stream = match self.backend.open_read_stream(&locator, owner_id).await {
            Ok(stream) => stream,
            Err(ObjectStoreError::NotFound(_)) => return Err(orphan()),
            Err(e) => return Err(e.into()),
        };

        let this = Arc::clone(self);
        let owner = owner_id.to_string();
        let id = file.id.clone();
        let size = file.logical_size;
        self.submit("post_download", owner_id, async move {
            this.bandwidth.record(&owner, size).await;
            if let Err(e) = this.metadata.touch_accessed(&id, Utc::now()).await {
                warn!(file_id = %id, error = %e, "Failed to record access time");
            }
        });

        Ok(Download { file, stream })
    }

    pub async fn signed_url(&self, owner_id: &str, file_id: &str, ttl: Duration) -> Result<String> {
        let file = self.owned_live(owner_id, file_id).await?;
        Ok(self
            .backend
            .signed_url(&file.locator(), owner_id, ttl)
            .await?)
    }

    pub async fn quota(&self, owner_id: &str) -> Result<QuotaState> {
        validate_owner(owner_id)?;
        self.quota.state(owner_id).await
    }

    pub async fn bandwidth(&self, owner_id: &str) -> Result<BandwidthState> {
        validate_owner(owner_id)?;
        self.bandwidth.usage(owner_id).await
    }

    pub async fn reconcile(&self, owner_id: &str) -> Result<u64> {
        validate_owner(owner_id)?;
        self.quota.reconcile(owner_id).await
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn rename(&self, owner_id: &str, file_id: &str, name: &str) -> Result<FileRecord> {
        validate_name(name)?;
        self.owned(owner_id, file_id).await?;
        let file = self
            .metadata
            .rename(file_id, name)
            .await?
            .into_inner()
            .ok_or_else(|| Error::RecordNotFound(file_id.to_string()))?;
        self.listing.invalidate(owner_id).await;
        Ok(file)
    }

    /// Replace a file's bytes. The old bytes are released in the background
    /// unless another record still shares them.
    pub async fn update_content(
        self: &Arc<Self>,
        owner_id: &str,
        file_id: &str,
        data: Bytes,
        mime_type: Option<String>,
        request_id: Option<&str>,
    ) -> Result<FileRecord> {
        let old = self.owned_live(owner_id, file_id).await?;
        let size = data.len() as u64;
        if size == 0 {
            return Err(Error::Validation("File is empty".to_string()));
        }
        let plan = self.plans.plan_for(owner_id).await?;
        if size > self.max_upload_size.min(plan.max_file_size) {
            return Err(Error::Validation(format!(
                "File exceeds the maximum size of {} bytes",
                self.max_upload_size.min(plan.max_file_size)
            )));
        }
        self.bandwidth.check(owner_id, size, request_id).await?;

        let mime_type = mime_type.unwrap_or_else(|| old.mime_type.clone());
        let prepared = self.preprocessor.prepare(data, &mime_type).await?;
        let size = prepared.data.len() as u64;
        let delta = signed(size) - signed(old.logical_size);
        if delta > 0 {
            self.quota.check(owner_id, delta as u64, request_id).await?;
        }

        let fp = hash(prepared.data.clone()).await?;
        let name = ObjectName::new(uuid::Uuid::new_v4().to_string(), &old.name);
        let saved = self
            .backend
            .save(SaveSource::Bytes(prepared.data), &name, owner_id)
            .await?;

        let update = ContentUpdate {
            locator: saved.locator.clone(),
            logical_size: size,
            physical_size: saved.size,
            mime_type: prepared.mime_type,
            fingerprint: Some(fp),
        };
        let updated = match self.metadata.replace_content(file_id, update).await {
            Ok(Transition::Applied(f)) | Ok(Transition::Unchanged(f)) => f,
            Ok(Transition::NotFound) => {
                self.backend.delete(&saved.locator, owner_id).await;
                return Err(Error::RecordNotFound(file_id.to_string()));
            }
            Err(e) => {
                self.backend.delete(&saved.locator, owner_id).await;
                return Err(e.into());
            }
        };
        info!(owner_id, file_id, size, locator = %updated.locator(), "File content replaced");
        self.listing.invalidate(owner_id).await;

        let this = Arc::clone(self);
        let owner = owner_id.to_string();
        let payload = file_event(&updated);
        let request_id = request_id.map(str::to_string);
        self.submit("post_update", owner_id, async move {
            this.dedup.release(&old).await;
            this.quota.apply(&owner, delta).await;
            this.bandwidth.record(&owner, size).await;
            this.events
                .publish(EventType::FileUpdated, payload, request_id.as_deref())
                .await;
        });

        Ok(updated)
    }

    /// Move a file to the trash. Already-trashed files are returned as-is.
    pub async fn soft_delete(
        self: &Arc<Self>,
        owner_id: &str,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<FileRecord> {
        self.owned(owner_id, file_id).await?;
        let file = match self.metadata.soft_delete(file_id, Utc::now()).await? {
            Transition::Applied(file) => file,
            Transition::Unchanged(file) => return Ok(file),
            Transition::NotFound => return Err(Error::RecordNotFound(file_id.to_string())),
        };
        info!(owner_id, file_id, "File moved to trash");
        self.listing.invalidate(owner_id).await;

        let this = Arc::clone(self);
        let payload = file_event(&file);
        let owner = owner_id.to_string();
        let size = file.logical_size;
        let request_id = request_id.map(str::to_string);
        self.submit("post_delete", owner_id, async move {
            this.quota.apply(&owner, -signed(size)).await;
            this.events
                .publish(EventType::FileDeleted, payload, request_id.as_deref())
                .await;
        });
        Ok(file)
    }

    /// Bring a file back from the trash, provided it still fits the quota.
    pub async fn restore(
        self: &Arc<Self>,
        owner_id: &str,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<FileRecord> {
        let current = self.owned(owner_id, file_id).await?;
        if !current.is_deleted {
            return Ok(current);
        }
        self.quota
            .check(owner_id, current.logical_size, request_id)
            .await?;

        let file = match self.metadata.restore(file_id).await? {
            Transition::Applied(file) => file,
            Transition::Unchanged(file) => return Ok(file),
            Transition::NotFound => return Err(Error::RecordNotFound(file_id.to_string())),
        };
        info!(owner_id, file_id, "File restored from trash");
        self.listing.invalidate(owner_id).await;

        let this = Arc::clone(self);
        let payload = file_event(&file);
        let owner = owner_id.to_string();
        let size = file.logical_size;
        let request_id = request_id.map(str::to_string);
        self.submit("post_restore", owner_id, async move {
            this.quota.apply(&owner, signed(size)).await;
            this.events
                .publish(EventType::FileRestored, payload, request_id.as_deref())
                .await;
        });
        Ok(file)
    }

    /// Remove the record for good; bytes go once nothing else shares them.
    pub async fn permanent_delete(
        self: &Arc<Self>,
        owner_id: &str,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<FileRecord> {
        self.owned(owner_id, file_id).await?;
        let removed = self
            .metadata
            .permanent_delete(file_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(file_id.to_string()))?;
        info!(owner_id, file_id, "File permanently deleted");
        self.listing.invalidate(owner_id).await;

        let this = Arc::clone(self);
        let record = removed.clone();
        let request_id = request_id.map(str::to_string);
        self.submit("post_purge", owner_id, async move {
            this.dedup.release(&record).await;
            // Trashed files were already taken off the counter.
            if !record.is_deleted {
                this.quota
                    .apply(&record.owner_id, -signed(record.logical_size))
                    .await;
            }
            let mut payload = file_event(&record);
            payload["permanent"] = serde_json::Value::Bool(true);
            this.events
                .publish(EventType::FileDeleted, payload, request_id.as_deref())
                .await;
        });
        Ok(removed)
    }

    /// Explicit tier change requested by the owner.
    pub async fn set_cold(
        &self,
        owner_id: &str,
        file_id: &str,
        cold: bool,
        request_id: Option<&str>,
    ) -> Result<FileRecord> {
        self.owned_live(owner_id, file_id).await?;
        let transition = if cold {
            self.lifecycle.mark_as_cold_storage(file_id, request_id).await?
        } else {
            self.lifecycle
                .restore_from_cold_storage(file_id, request_id)
                .await?
        };
        transition
            .into_inner()
            .ok_or_else(|| Error::RecordNotFound(file_id.to_string()))
    }
}
