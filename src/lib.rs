//! storage-orchestrator - Storage orchestration for a multi-tenant file service
//!
//! This crate decides where uploaded bytes live and keeps per-owner
//! accounting honest:
//! - Provider fallback across a managed object store, an S3-compatible store
//!   and local disk
//! - Per-owner content deduplication (sync below a size threshold, deferred above)
//! - Cached storage quota and monthly bandwidth counters with reconciliation
//! - Hot / cold / archive classification and trash purging
//! - Domain events over Redis Streams, with in-process fallback
//! - redb embedded database for file metadata

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod lifecycle;
pub mod listing;
pub mod metrics;
pub mod object_store;
pub mod orchestrator;
pub mod plans;
pub mod preprocess;
pub mod quota;
pub mod scheduler;
pub mod storage;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use backend::StorageBackend;
use cache::CounterCache;
use config::Config;
use dedup::DeduplicationEngine;
use events::EventBus;
use lifecycle::LifecycleManager;
use listing::ListingCache;
use orchestrator::{Collaborators, UploadOrchestrator};
use plans::{PlanCatalog, PlanDirectory};
use preprocess::Preprocessor;
use quota::{BandwidthLedger, QuotaLedger};
use storage::{Database, MetadataStore};
use tasks::BackgroundQueue;

const LISTING_CACHE_OWNERS: u64 = 10_000;
const LISTING_CACHE_TTL: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub metadata: Arc<dyn MetadataStore>,
    pub orchestrator: Arc<UploadOrchestrator>,
    pub lifecycle: Arc<LifecycleManager>,
    pub quota: Arc<QuotaLedger>,
    pub plans: Arc<PlanCatalog>,
    pub events: Arc<EventBus>,
    pub queue: Arc<BackgroundQueue>,
}

impl AppState {
    /// Wire every component on top of already-connected infrastructure.
    /// Starts the background worker pool, so it must run inside a runtime.
    pub fn assemble(
        config: Config,
        db: Database,
        backend: StorageBackend,
        cache: Arc<dyn CounterCache>,
        events: Arc<EventBus>,
        preprocessor: Arc<dyn Preprocessor>,
    ) -> Self {
        let metadata: Arc<dyn MetadataStore> = Arc::new(db.clone());
        let backend = Arc::new(backend);
        let plans = Arc::new(PlanCatalog::new(
            config.plans.catalogue.clone(),
            &config.plans.default_plan,
            db.clone(),
        ));
        let directory: Arc<dyn PlanDirectory> = plans.clone();

        let queue = Arc::new(BackgroundQueue::start(
            config.workers.workers,
            config.workers.queue_capacity,
        ));
        let listing = Arc::new(ListingCache::new(LISTING_CACHE_OWNERS, LISTING_CACHE_TTL));
        let dedup = Arc::new(DeduplicationEngine::new(
            Arc::clone(&backend),
            Arc::clone(&metadata),
            config.dedup.sync_threshold,
        ));
        let quota = Arc::new(QuotaLedger::new(
            Arc::clone(&cache),
            Arc::clone(&metadata),
            Arc::clone(&directory),
            Arc::clone(&events),
        ));
        let bandwidth = Arc::new(BandwidthLedger::new(
            cache,
            Arc::clone(&directory),
            Arc::clone(&events),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&metadata),
            Arc::clone(&directory),
            Arc::clone(&events),
            Arc::clone(&dedup),
            Arc::clone(&listing),
            config.lifecycle.clone(),
        ));

        let orchestrator = Arc::new(UploadOrchestrator::new(
            Collaborators {
                metadata: Arc::clone(&metadata),
                backend,
                dedup,
                quota: Arc::clone(&quota),
                bandwidth,
                lifecycle: Arc::clone(&lifecycle),
                events: Arc::clone(&events),
                plans: directory,
                preprocessor,
                listing,
                queue: Arc::clone(&queue),
            },
            config.max_upload_size,
        ));

        Self {
            config,
            db,
            metadata,
            orchestrator,
            lifecycle,
            quota,
            plans,
            events,
            queue,
        }
    }
}
