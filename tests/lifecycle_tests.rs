mod common;

use bytes::Bytes;
use chrono::{Duration, Utc};

use common::{sample_file, Harness};
use storage_orchestrator::events::EventType;
use storage_orchestrator::object_store::ObjectStore;
use storage_orchestrator::storage::models::{FileRecord, StorageTier, Transition};

fn aged(id: &str, owner_id: &str, created_days: i64, accessed_days: i64) -> FileRecord {
    let now = Utc::now();
    let mut file = sample_file(id, owner_id);
    file.created_at = now - Duration::days(created_days);
    file.updated_at = file.created_at;
    file.last_accessed_at = now - Duration::days(accessed_days);
    file
}

#[tokio::test]
async fn idle_files_go_cold_and_old_cold_files_are_archived() {
    let h = Harness::new().await;
    h.db.put_file(&aged("fresh", "alice", 40, 2)).unwrap();
    h.db.put_file(&aged("idle", "alice", 40, 31)).unwrap();
    let mut old_cold = aged("ancient", "alice", 200, 190);
    old_cold.cold_storage = true;
    old_cold.cold_storage_date = Some(Utc::now() - Duration::days(150));
    h.db.put_file(&old_cold).unwrap();

    let report = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(report.owners_scanned, 1);
    assert_eq!(report.cold, 1);
    assert_eq!(report.archived, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(h.db.get_file("fresh").unwrap().unwrap().tier(), StorageTier::Hot);
    assert_eq!(h.db.get_file("idle").unwrap().unwrap().tier(), StorageTier::Cold);
    assert_eq!(h.db.get_file("ancient").unwrap().unwrap().tier(), StorageTier::Archive);
    assert_eq!(h.recorder.count(EventType::FileColdStorage), 1);
    assert_eq!(h.recorder.count(EventType::FileArchived), 1);

    // A second pass finds nothing new.
    let again = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!((again.cold, again.archived, again.purged), (0, 0, 0));
}

#[tokio::test]
async fn exempt_plans_are_skipped() {
    let h = Harness::new().await;
    h.state.plans.assign("corp", "enterprise").unwrap();
    h.db.put_file(&aged("idle", "corp", 400, 400)).unwrap();

    let report = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(report.owners_exempt, 1);
    assert_eq!(report.owners_scanned, 0);
    assert_eq!(h.db.get_file("idle").unwrap().unwrap().tier(), StorageTier::Hot);
}

#[tokio::test]
async fn expired_trash_is_purged_with_its_bytes() {
    let h = Harness::new().await;
    let now = Utc::now();

    let mut expired = aged("expired", "alice", 90, 90);
    expired.is_deleted = true;
    expired.deleted_at = Some(now - Duration::days(45));
    h.local
        .put(&expired.storage_key, Bytes::from("old bytes"))
        .await
        .unwrap();
    h.db.put_file(&expired).unwrap();

    let mut recent = aged("recent", "alice", 90, 90);
    recent.is_deleted = true;
    recent.deleted_at = Some(now - Duration::days(3));
    h.db.put_file(&recent).unwrap();

    let report = h.state.lifecycle.sweep(now).await;
    assert_eq!(report.purged, 1);
    assert!(h.db.get_file("expired").unwrap().is_none());
    assert!(h.db.get_file("recent").unwrap().is_some());
    assert!(!h.local.exists(&expired.storage_key).await.unwrap());

    let purged = h.recorder.of_type(EventType::FilePurged);
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].data["fileId"], "expired");

    // Trashed records are never moved between tiers.
    assert_eq!(h.db.get_file("recent").unwrap().unwrap().tier(), StorageTier::Hot);
}

#[tokio::test]
async fn purge_keeps_bytes_shared_with_a_live_record() {
    let h = Harness::with_remote().await;
    let data = [9u8; 256];
    let holder = h.upload("alice", "a.bin", &data).await;
    let copy = h.upload("alice", "b.bin", &data).await;
    assert_eq!(copy.reference_of.as_deref(), Some(holder.id.as_str()));

    let mut trashed = h.db.get_file(&holder.id).unwrap().unwrap();
    trashed.is_deleted = true;
    trashed.deleted_at = Some(Utc::now() - Duration::days(60));
    h.db.put_file(&trashed).unwrap();

    let report = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(report.purged, 1);
    let promoted = h.db.get_file(&copy.id).unwrap().unwrap();
    assert!(promoted.reference_of.is_none());
    assert!(h.remote.as_ref().unwrap().contains(&promoted.storage_key));
}

#[tokio::test]
async fn batch_limits_bound_a_pass() {
    let h = Harness::build(None, |config| {
        config.lifecycle.cold_batch = 2;
    })
    .await;
    for i in 0..5 {
        h.db.put_file(&aged(&format!("f{i}"), "alice", 60, 60)).unwrap();
    }

    let first = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(first.cold, 2);
    let second = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(second.cold, 2);
    let third = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(third.cold, 1);
}

#[tokio::test]
async fn warming_resets_access_and_is_idempotent() {
    let h = Harness::new().await;
    let mut cold = aged("f1", "alice", 60, 60);
    cold.cold_storage = true;
    cold.cold_storage_date = Some(Utc::now() - Duration::days(10));
    h.db.put_file(&cold).unwrap();

    let warmed = h
        .state
        .lifecycle
        .restore_from_cold_storage("f1", None)
        .await
        .unwrap()
        .into_inner()
        .unwrap();
    assert!(!warmed.cold_storage);
    assert!(warmed.cold_storage_date.is_none());
    assert!(warmed.last_accessed_at > cold.last_accessed_at);
    assert_eq!(h.recorder.count(EventType::FileWarmed), 1);

    let report = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(report.cold, 0);

    assert!(!h
        .state
        .lifecycle
        .mark_as_cold_storage("missing", None)
        .await
        .unwrap()
        .is_applied());
}

#[tokio::test]
async fn marking_cold_twice_keeps_the_first_date() {
    let h = Harness::new().await;
    h.db.put_file(&aged("f1", "alice", 10, 10)).unwrap();

    let first = h
        .state
        .lifecycle
        .mark_as_cold_storage("f1", Some("req-cold"))
        .await
        .unwrap();
    let Transition::Applied(first) = first else {
        panic!("first mark should apply");
    };
    let date = first.cold_storage_date;
    assert!(date.is_some());

    let second = h
        .state
        .lifecycle
        .mark_as_cold_storage("f1", None)
        .await
        .unwrap();
    let Transition::Unchanged(second) = second else {
        panic!("second mark should be a no-op");
    };
    assert_eq!(second.cold_storage_date, date);
    assert_eq!(h.db.get_file("f1").unwrap().unwrap().cold_storage_date, date);

    let events = h.recorder.of_type(EventType::FileColdStorage);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata.request_id.as_deref(), Some("req-cold"));

    assert!(matches!(
        h.state.lifecycle.mark_as_cold_storage("missing", None).await.unwrap(),
        Transition::NotFound
    ));
}

#[tokio::test]
async fn default_thresholds_apply_when_the_plan_has_none() {
    let h = Harness::new().await;
    // "pro" leaves both thresholds to the 90 / 365 day defaults.
    h.state.plans.assign("alice", "pro").unwrap();
    h.db.put_file(&aged("a91", "alice", 100, 91)).unwrap();
    h.db.put_file(&aged("b89", "alice", 100, 89)).unwrap();

    let report = h.state.lifecycle.sweep(Utc::now()).await;
    assert_eq!(report.cold, 1);
    assert_eq!(report.archived, 0);
    assert_eq!(h.db.get_file("a91").unwrap().unwrap().tier(), StorageTier::Cold);
    assert_eq!(h.db.get_file("b89").unwrap().unwrap().tier(), StorageTier::Hot);
    assert_eq!(h.recorder.count(EventType::FileColdStorage), 1);
}
