mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::{sample_file, Harness};
use storage_orchestrator::cache::{CacheError, CounterCache, MemoryCache};
use storage_orchestrator::error::Error;
use storage_orchestrator::events::{EventBus, EventType};
use storage_orchestrator::plans::{Plan, PlanCatalog, PlanDirectory};
use storage_orchestrator::quota::{period_key, BandwidthLedger, QuotaLedger};
use storage_orchestrator::scheduler;
use storage_orchestrator::storage::{Database, MetadataStore};

/// A cache that is always unreachable.
struct DownCache;

#[async_trait]
impl CounterCache for DownCache {
    async fn get(&self, _key: &str) -> Result<Option<i64>, CacheError> {
        Err(CacheError::Connection("refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: i64, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Err(CacheError::Connection("refused".to_string()))
    }

    async fn incr(
        &self,
        _key: &str,
        _delta: i64,
        _ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        Err(CacheError::Connection("refused".to_string()))
    }
}

fn ledger(db: &Database, cache: Arc<dyn CounterCache>) -> QuotaLedger {
    let metadata: Arc<dyn MetadataStore> = Arc::new(db.clone());
    let plans: Arc<dyn PlanDirectory> =
        Arc::new(PlanCatalog::new(Plan::builtin(), "free", db.clone()));
    QuotaLedger::new(cache, metadata, plans, Arc::new(EventBus::fallback("test")))
}

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

// ============================================================================
// Storage quota
// ============================================================================

#[tokio::test]
async fn missing_counter_is_rebuilt_from_records() {
    let (_dir, db) = test_db();
    db.put_file(&sample_file("a", "alice")).unwrap();
    let mut trashed = sample_file("b", "alice");
    trashed.is_deleted = true;
    trashed.deleted_at = Some(Utc::now());
    db.put_file(&trashed).unwrap();

    let cache = Arc::new(MemoryCache::new());
    let quota = ledger(&db, cache.clone());

    assert_eq!(quota.used("alice").await.unwrap(), 1024);
    assert_eq!(cache.get("quota:alice").await.unwrap(), Some(1024));
}

#[tokio::test]
async fn apply_leaves_missing_counters_alone() {
    let (_dir, db) = test_db();
    let cache = Arc::new(MemoryCache::new());
    let quota = ledger(&db, cache.clone());

    quota.apply("alice", 500).await;
    assert_eq!(cache.get("quota:alice").await.unwrap(), None);

    cache.set("quota:alice", 100, None).await.unwrap();
    quota.apply("alice", 500).await;
    quota.apply("alice", -50).await;
    assert_eq!(cache.get("quota:alice").await.unwrap(), Some(550));
}

#[tokio::test]
async fn unreachable_cache_sums_records_and_marks_dirty() {
    let (_dir, db) = test_db();
    db.put_file(&sample_file("a", "alice")).unwrap();
    let quota = ledger(&db, Arc::new(DownCache));

    assert_eq!(quota.used("alice").await.unwrap(), 1024);
    assert_eq!(quota.dirty_owners(), vec!["alice".to_string()]);

    // Adjustments can't fail the caller.
    quota.apply("bob", 10).await;
    assert!(quota.dirty_owners().contains(&"bob".to_string()));

    assert!(matches!(quota.reconcile("alice").await, Err(Error::Cache(_))));
}

#[tokio::test]
async fn check_denies_past_the_limit() {
    let h = Harness::new().await;
    h.cache.set("quota:alice", 9_000, None).await.unwrap();

    let state = h.state.quota.check("alice", 1_000, None).await.unwrap();
    assert_eq!(state.used_bytes, 9_000);
    assert_eq!(state.limit_bytes, 10_000);

    let denied = h.state.quota.check("alice", 1_001, Some("req-q")).await;
    assert!(matches!(
        denied,
        Err(Error::QuotaExceeded {
            used: 9_000,
            limit: 10_000,
            requested: 1_001
        })
    ));
    let events = h.recorder.of_type(EventType::QuotaExceeded);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["ownerId"], "alice");
    assert_eq!(events[0].metadata.request_id.as_deref(), Some("req-q"));
}

#[tokio::test]
async fn assigned_plan_changes_the_limit() {
    let h = Harness::new().await;
    h.state.plans.assign("alice", "pro").unwrap();
    let state = h.state.quota.state("alice").await.unwrap();
    assert_eq!(state.limit_bytes, 100 * 1024 * 1024 * 1024);

    assert!(matches!(
        h.state.plans.assign("alice", "platinum"),
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn reconcile_all_repairs_drifted_counters() {
    let h = Harness::new().await;
    h.upload("alice", "a.bin", &[1u8; 700]).await;
    h.upload("bob", "b.bin", &[2u8; 300]).await;

    h.cache.set("quota:alice", 9_999, None).await.unwrap();
    h.cache.set("quota:bob", -40, None).await.unwrap();
    h.state.quota.mark_dirty("carol");

    let reconciled = scheduler::reconcile_all(&h.state.quota, h.state.metadata.as_ref()).await;
    assert_eq!(reconciled, 3);
    assert_eq!(h.cache.get("quota:alice").await.unwrap(), Some(700));
    assert_eq!(h.cache.get("quota:bob").await.unwrap(), Some(300));
    assert_eq!(h.cache.get("quota:carol").await.unwrap(), Some(0));
    assert!(h.state.quota.dirty_owners().is_empty());
}

// ============================================================================
// Bandwidth
// ============================================================================

#[tokio::test]
async fn bandwidth_accumulates_per_month() {
    let (_dir, db) = test_db();
    let cache = Arc::new(MemoryCache::new());
    let plans: Arc<dyn PlanDirectory> =
        Arc::new(PlanCatalog::new(Plan::builtin(), "free", db.clone()));
    let bandwidth =
        BandwidthLedger::new(cache.clone(), plans, Arc::new(EventBus::fallback("test")));

    bandwidth.record("alice", 100).await;
    bandwidth.record("alice", 250).await;
    bandwidth.record("alice", 0).await;

    let usage = bandwidth.usage("alice").await.unwrap();
    assert_eq!(usage.used_bytes, 350);
    assert_eq!(usage.period, period_key(Utc::now()));
    let key = format!("bandwidth:alice:{}", usage.period);
    assert_eq!(cache.get(&key).await.unwrap(), Some(350));
    assert_eq!(bandwidth.usage("bob").await.unwrap().used_bytes, 0);
}

#[tokio::test]
async fn bandwidth_check_denies_and_publishes() {
    let h = Harness::new().await;
    let key = format!("bandwidth:alice:{}", period_key(Utc::now()));
    h.cache.set(&key, 50_000, None).await.unwrap();

    let denied = h
        .state
        .orchestrator
        .upload(common::upload_request("alice", "a.txt", b"x"))
        .await;
    assert!(matches!(
        denied,
        Err(Error::BandwidthExceeded {
            used: 50_000,
            limit: 50_000,
            requested: 1
        })
    ));
    assert_eq!(h.recorder.count(EventType::BandwidthExceeded), 1);

    let usage = h.state.orchestrator.bandwidth("bob").await.unwrap();
    assert_eq!(usage.used_bytes, 0);
    assert_eq!(usage.limit_bytes, 50_000);
}

#[tokio::test]
async fn scheduled_reconcile_runs_until_cancelled() {
    let h = Harness::new().await;
    h.upload("alice", "a.bin", &[1u8; 400]).await;
    h.cache.set("quota:alice", 1, None).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let handles = scheduler::spawn(
        h.state.lifecycle.clone(),
        h.state.quota.clone(),
        h.state.metadata.clone(),
        Duration::from_secs(3600),
        Duration::from_millis(50),
        cancel.clone(),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.cache.get("quota:alice").await.unwrap() != Some(400)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.cache.get("quota:alice").await.unwrap(), Some(400));

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
