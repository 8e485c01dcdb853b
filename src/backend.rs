//! Uniform storage contract over the local store and the configured remotes.
//!
//! Uploads are always staged to local disk first. Remotes are then tried in
//! priority order with a bounded timeout and retry budget; if every remote
//! fails the staged copy becomes the file's home.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::object_store::keys::{self, ObjectName};
use crate::object_store::{ByteStream, LocalStore, ObjectStore, ObjectStoreError};
use crate::storage::models::{StorageLocator, StorageType};

/// What to persist.
pub enum SaveSource {
    Bytes(Bytes),
    /// A file on local disk; it is copied, never moved.
    LocalPath(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedObject {
    /// Where the bytes actually landed.
    pub locator: StorageLocator,
    pub size: u64,
    /// True when remotes were configured but all of them failed.
    pub fell_back: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Failed,
}

/// How a dedup reference was realised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// The new locator now hard-links the existing bytes; nothing to release.
    Linked(StorageLocator),
    /// The record must switch to this shared locator; its own copy can go.
    Shared(StorageLocator),
}

impl Reference {
    pub fn locator(&self) -> &StorageLocator {
        match self {
            Reference::Linked(l) | Reference::Shared(l) => l,
        }
    }
}

pub struct StorageBackend {
    local: Arc<LocalStore>,
    remotes: Vec<Arc<dyn ObjectStore>>,
    timeout: Duration,
    retries: u32,
}

impl StorageBackend {
    /// `remotes` must already be in priority order.
    pub fn new(
        local: Arc<LocalStore>,
        remotes: Vec<Arc<dyn ObjectStore>>,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            local,
            remotes,
            timeout,
            retries,
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Storage types a save may land on, in the order they are tried.
    pub fn providers(&self) -> Vec<StorageType> {
        self.remotes
            .iter()
            .map(|r| r.storage_type())
            .chain(std::iter::once(StorageType::Local))
            .collect()
    }

    fn store_for(&self, storage_type: StorageType) -> Result<&dyn ObjectStore, ObjectStoreError> {
        if storage_type == StorageType::Local {
            return Ok(self.local.as_ref());
        }
        self.remotes
            .iter()
            .find(|r| r.storage_type() == storage_type)
            .map(|r| r.as_ref())
            .ok_or_else(|| {
                ObjectStoreError::Config(format!("no {storage_type} provider is configured"))
            })
    }

    fn check_owner(locator: &StorageLocator, owner_id: &str) -> Result<(), ObjectStoreError> {
        if keys::belongs_to(owner_id, locator) {
            Ok(())
        } else {
            Err(ObjectStoreError::OwnershipMismatch(locator.key.clone()))
        }
    }

    async fn bounded<T, Fut>(&self, fut: Fut) -> Result<T, ObjectStoreError>
    where
        Fut: Future<Output = Result<T, ObjectStoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ObjectStoreError::Timeout(self.timeout)),
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    pub async fn save(
        &self,
        source: SaveSource,
        name: &ObjectName,
        owner_id: &str,
    ) -> Result<SavedObject, ObjectStoreError> {
        if !keys::is_valid_owner_id(owner_id) {
            return Err(ObjectStoreError::InvalidKey(owner_id.to_string()));
        }

        let local_key = keys::local_key(owner_id, name);
        let (staged, size) = match self.stage(source, &local_key).await {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(cleanup) = self.local.delete(&local_key).await {
                    warn!(
                        key = %local_key,
                        error = %cleanup,
                        "Failed to remove partial staged copy"
                    );
                    metrics::record_best_effort_failure("staging_cleanup");
                }
                return Err(e);
            }
        };
        debug!(owner_id, key = %local_key, size, "Staged upload locally");

        for remote in &self.remotes {
            let provider = remote.storage_type();
            let remote_key = keys::remote_key(owner_id, name);

            match self.put_with_retries(remote.as_ref(), &remote_key, &staged).await {
                Ok(()) => {
                    if let Err(e) = self.local.delete(&local_key).await {
                        warn!(key = %local_key, error = %e, "Failed to remove staged copy");
                        metrics::record_best_effort_failure("staging_cleanup");
                    }
                    info!(owner_id, %provider, key = %remote_key, size, "Stored upload remotely");
                    return Ok(SavedObject {
                        locator: StorageLocator::new(provider, remote_key),
                        size,
                        fell_back: false,
                    });
                }
                Err(e) => {
                    warn!(
                        owner_id,
                        %provider,
                        error = %e,
                        "Remote save failed, trying next provider"
                    );
                    metrics::STORAGE_FALLBACKS
                        .with_label_values(&[provider.as_str()])
                        .inc();
                }
            }
        }

        Ok(SavedObject {
            locator: StorageLocator::local(local_key),
            size,
            fell_back: !self.remotes.is_empty(),
        })
    }

    async fn stage(
        &self,
        source: SaveSource,
        local_key: &str,
    ) -> Result<(PathBuf, u64), ObjectStoreError> {
        match source {
            SaveSource::Bytes(data) => self.local.put(local_key, data).await?,
            SaveSource::LocalPath(path) => self.local.put_file(local_key, &path).await?,
        }
        let staged = self.local.object_path(local_key)?;
        let size = tokio::fs::metadata(&staged).await?.len();
        Ok((staged, size))
    }

    async fn put_with_retries(
        &self,
        remote: &dyn ObjectStore,
        key: &str,
        staged: &std::path::Path,
    ) -> Result<(), ObjectStoreError> {
        let mut attempt = 0;
        loop {
            match self.bounded(remote.put_file(key, staged)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    debug!(key, attempt, error = %e, "Retrying remote save");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Missing, unreachable and foreign objects all read as absent.
    pub async fn exists(&self, locator: &StorageLocator, owner_id: &str) -> bool {
        if Self::check_owner(locator, owner_id).is_err() {
            warn!(owner_id, %locator, "Existence check on a foreign locator");
            return false;
        }
        let store = match self.store_for(locator.storage_type) {
            Ok(store) => store,
            Err(e) => {
                warn!(%locator, error = %e, "No provider for locator");
                return false;
            }
        };
        match self.bounded(store.exists(&locator.key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%locator, error = %e, "Existence check failed, treating as missing");
                false
            }
        }
    }

    pub async fn open_read_stream(
        &self,
        locator: &StorageLocator,
        owner_id: &str,
    ) -> Result<ByteStream, ObjectStoreError> {
        Self::check_owner(locator, owner_id)?;
        let store = self.store_for(locator.storage_type)?;
        self.bounded(store.get_stream(&locator.key)).await
    }

    pub async fn signed_url(
        &self,
        locator: &StorageLocator,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        Self::check_owner(locator, owner_id)?;
        let store = self.store_for(locator.storage_type)?;
        self.bounded(store.signed_url(&locator.key, ttl)).await
    }

    // ========================================================================
    // Delete / references
    // ========================================================================

    /// Never fails; callers must not block metadata changes on storage state.
    pub async fn delete(&self, locator: &StorageLocator, owner_id: &str) -> DeleteOutcome {
        if let Err(e) = Self::check_owner(locator, owner_id) {
            warn!(owner_id, %locator, error = %e, "Refusing to delete a foreign locator");
            metrics::record_best_effort_failure("storage_delete");
            return DeleteOutcome::Failed;
        }
        let result = match self.store_for(locator.storage_type) {
            Ok(store) => self.bounded(store.delete(&locator.key)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) => {
                warn!(owner_id, %locator, error = %e, "Failed to delete stored object");
                metrics::record_best_effort_failure("storage_delete");
                DeleteOutcome::Failed
            }
        }
    }

    /// Make `new` share the bytes behind `existing`.
    ///
    /// Two local objects become hard links. Anything else shares the existing
    /// key. Both locators must belong to `owner_id`.
    pub async fn create_reference(
        &self,
        existing: &StorageLocator,
        new: &StorageLocator,
        owner_id: &str,
    ) -> Result<Reference, ObjectStoreError> {
        Self::check_owner(existing, owner_id)?;
        Self::check_owner(new, owner_id)?;

        if existing.storage_type == StorageType::Local && new.storage_type == StorageType::Local {
            self.local.link(&existing.key, &new.key).await?;
            return Ok(Reference::Linked(new.clone()));
        }

        let store = self.store_for(existing.storage_type)?;
        if !self.bounded(store.exists(&existing.key)).await? {
            return Err(ObjectStoreError::NotFound(existing.key.clone()));
        }
        Ok(Reference::Shared(existing.clone()))
    }
}
