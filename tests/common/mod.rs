#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use storage_orchestrator::backend::StorageBackend;
use storage_orchestrator::cache::MemoryCache;
use storage_orchestrator::config::Config;
use storage_orchestrator::events::{Event, EventBus, EventHandler, EventType, MemoryEventLog};
use storage_orchestrator::object_store::{ByteStream, LocalStore, ObjectStore, ObjectStoreError};
use storage_orchestrator::orchestrator::UploadRequest;
use storage_orchestrator::preprocess::Passthrough;
use storage_orchestrator::storage::models::{FileRecord, StorageType};
use storage_orchestrator::storage::Database;
use storage_orchestrator::AppState;

// ============================================================================
// Fake remote store
// ============================================================================

/// In-memory remote that can be switched into a failing state.
pub struct FakeRemote {
    storage_type: StorageType,
    objects: Mutex<HashMap<String, Bytes>>,
    failing: AtomicBool,
}

impl FakeRemote {
    pub fn new(storage_type: StorageType) -> Arc<Self> {
        Arc::new(Self {
            storage_type,
            objects: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), ObjectStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ObjectStoreError::Backend("remote is down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for FakeRemote {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.check()?;
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), ObjectStoreError> {
        self.check()?;
        let data = tokio::fs::read(path).await?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.check()?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let data = self.get(key).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.check()?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.check()?;
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        self.check()?;
        Ok(format!("https://remote.test/{key}?expires={}", ttl.as_secs()))
    }
}

// ============================================================================
// Event recorder
// ============================================================================

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn of_type(&self, event_type: EventType) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: Database,
    pub local: Arc<LocalStore>,
    pub remote: Option<Arc<FakeRemote>>,
    pub cache: Arc<MemoryCache>,
    pub recorder: Arc<Recorder>,
    pub state: Arc<AppState>,
}

/// Small limits so the tests can cross them cheaply.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.node.data_dir = dir.join("data").to_string_lossy().into_owned();
    config.storage.local_storage_path = dir.join("files").to_string_lossy().into_owned();
    config.storage.remote_timeout = Duration::from_secs(2);
    config.storage.remote_retries = 0;
    config.dedup.sync_threshold = 1024;
    config.workers.workers = 2;
    for plan in &mut config.plans.catalogue {
        if plan.name == "free" {
            plan.storage_limit_bytes = 10_000;
            plan.bandwidth_limit_bytes = 50_000;
            plan.max_file_size = 8_000;
        }
    }
    config
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(None, |_| {}).await
    }

    pub async fn with_remote() -> Self {
        Self::build(Some(FakeRemote::new(StorageType::S3Compatible)), |_| {}).await
    }

    pub async fn build(remote: Option<Arc<FakeRemote>>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let db = Database::open(&config.node.data_dir).unwrap();
        let local = Arc::new(LocalStore::new(&config.storage.local_storage_path).unwrap());
        let remotes: Vec<Arc<dyn ObjectStore>> = remote
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn ObjectStore>)
            .collect();
        let backend = StorageBackend::new(
            Arc::clone(&local),
            remotes,
            config.storage.remote_timeout,
            config.storage.remote_retries,
        );

        let cache = Arc::new(MemoryCache::new());
        let events = Arc::new(EventBus::fallback("test"));
        let recorder = Arc::new(Recorder::default());
        for event_type in EventType::ALL {
            events.subscribe(event_type, recorder.clone());
        }

        let state = Arc::new(AppState::assemble(
            config,
            db.clone(),
            backend,
            cache.clone(),
            events,
            Arc::new(Passthrough),
        ));

        Self {
            dir,
            db,
            local,
            remote,
            cache,
            recorder,
            state,
        }
    }

    pub async fn idle(&self) {
        self.state.queue.wait_idle().await;
    }

    pub async fn upload(&self, owner_id: &str, name: &str, data: &[u8]) -> FileRecord {
        let outcome = self
            .state
            .orchestrator
            .upload(upload_request(owner_id, name, data))
            .await
            .unwrap();
        self.idle().await;
        outcome.file
    }
}

pub fn upload_request(owner_id: &str, name: &str, data: &[u8]) -> UploadRequest {
    UploadRequest {
        owner_id: owner_id.to_string(),
        file_name: name.to_string(),
        mime_type: None,
        data: Bytes::copy_from_slice(data),
        request_id: Some("req-test".to_string()),
    }
}

/// A durable bus backed by an in-memory log. Failed entries are claimable
/// again on the next poll.
pub fn durable_bus(log: Arc<MemoryEventLog>) -> Arc<EventBus> {
    durable_node(log, "node-a", Duration::ZERO)
}

/// One consumer of the shared group, as a separate process would be.
pub fn durable_node(
    log: Arc<MemoryEventLog>,
    consumer: &str,
    claim_idle: Duration,
) -> Arc<EventBus> {
    let mut config = Config::default().events;
    config.claim_idle = claim_idle;
    config.max_deliveries = 3;
    Arc::new(EventBus::durable(log, &config, consumer))
}

/// A stored record for direct database tests.
pub fn sample_file(id: &str, owner_id: &str) -> FileRecord {
    let now = Utc::now();
    FileRecord {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        name: format!("{id}.png"),
        mime_type: "image/png".to_string(),
        logical_size: 1024,
        physical_size: 1024,
        storage_type: StorageType::Local,
        storage_key: format!("user_{owner_id}/{id}.png"),
        content_fingerprint: None,
        reference_of: None,
        cold_storage: false,
        cold_storage_date: None,
        archived_at: None,
        last_accessed_at: now,
        is_deleted: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}
