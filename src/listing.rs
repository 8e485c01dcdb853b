//! Per-owner file listing cache.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::storage::models::FileRecord;
use crate::storage::{DatabaseError, MetadataStore};

/// Live (non-deleted) listings keyed by owner. Every mutation of an owner's
/// records must call [`ListingCache::invalidate`]; the TTL bounds staleness
/// when an invalidation is missed.
pub struct ListingCache {
    cache: Cache<String, Arc<Vec<FileRecord>>>,
}

impl ListingCache {
    pub fn new(max_owners: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_owners)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn list(
        &self,
        owner_id: &str,
        metadata: &dyn MetadataStore,
    ) -> Result<Arc<Vec<FileRecord>>, DatabaseError> {
        if let Some(files) = self.cache.get(owner_id).await {
            return Ok(files);
        }

        let files: Vec<FileRecord> = metadata
            .list_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|f| !f.is_deleted)
            .collect();
        let files = Arc::new(files);
        self.cache
            .insert(owner_id.to_string(), Arc::clone(&files))
            .await;
        Ok(files)
    }

    pub async fn invalidate(&self, owner_id: &str) {
        self.cache.invalidate(owner_id).await;
    }
}
