mod common;

use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;

use common::{upload_request, FakeRemote, Harness};
use storage_orchestrator::cache::CounterCache;
use storage_orchestrator::error::Error;
use storage_orchestrator::events::EventType;
use storage_orchestrator::object_store::ObjectStore;
use storage_orchestrator::quota::period_key;
use storage_orchestrator::storage::models::{StorageTier, StorageType};

fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

async fn used(h: &Harness, owner: &str) -> u64 {
    h.state.orchestrator.quota(owner).await.unwrap().used_bytes
}

// ============================================================================
// Upload
// ============================================================================

#[tokio::test]
async fn upload_records_file_and_charges_quota() {
    let h = Harness::new().await;
    let data = content(1, 500);

    let file = h.upload("alice", "notes.txt", &data).await;

    assert_eq!(file.owner_id, "alice");
    assert_eq!(file.logical_size, 500);
    assert_eq!(file.physical_size, 500);
    assert_eq!(file.mime_type, "text/plain");
    assert_eq!(file.storage_type, StorageType::Local);
    assert!(file.content_fingerprint.is_some());
    assert_eq!(h.local.get(&file.storage_key).await.unwrap(), Bytes::from(data));

    assert_eq!(used(&h, "alice").await, 500);
    let uploaded = h.recorder.of_type(EventType::FileUploaded);
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].data["fileId"], file.id.as_str());
    assert_eq!(uploaded[0].metadata.request_id.as_deref(), Some("req-test"));

    let listed = h.state.orchestrator.list_files("alice").await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn upload_rejects_invalid_input() {
    let h = Harness::new().await;
    let orchestrator = &h.state.orchestrator;

    let empty = orchestrator.upload(upload_request("alice", "a.txt", b"")).await;
    assert!(matches!(empty, Err(Error::Validation(_))));

    let bad_owner = orchestrator
        .upload(upload_request("../alice", "a.txt", b"x"))
        .await;
    assert!(matches!(bad_owner, Err(Error::Validation(_))));

    let bad_name = orchestrator
        .upload(upload_request("alice", "dir/a.txt", b"x"))
        .await;
    assert!(matches!(bad_name, Err(Error::Validation(_))));

    // Free plan allows 8 000 bytes per file in the test config.
    let too_big = orchestrator
        .upload(upload_request("alice", "big.bin", &content(0, 8_001)))
        .await;
    assert!(matches!(too_big, Err(Error::Validation(_))));

    assert!(h.db.get_files_by_owner("alice").unwrap().is_empty());
}

#[tokio::test]
async fn quota_denial_writes_nothing() {
    let h = Harness::new().await;
    h.upload("alice", "one.bin", &content(1, 6_000)).await;

    let denied = h
        .state
        .orchestrator
        .upload(upload_request("alice", "two.bin", &content(2, 6_000)))
        .await;
    match denied {
        Err(Error::QuotaExceeded {
            used,
            limit,
            requested,
        }) => {
            assert_eq!(used, 6_000);
            assert_eq!(limit, 10_000);
            assert_eq!(requested, 6_000);
        }
        other => panic!("expected quota denial, got {other:?}"),
    }

    assert_eq!(h.db.get_files_by_owner("alice").unwrap().len(), 1);
    let mut entries = tokio::fs::read_dir(h.local.base_path().join("user_alice"))
        .await
        .unwrap();
    let mut count = 0;
    while entries.next_entry().await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 1);
    assert_eq!(h.recorder.count(EventType::QuotaExceeded), 1);
}

#[tokio::test]
async fn crossing_ninety_percent_warns_once() {
    let h = Harness::new().await;
    h.upload("alice", "a.bin", &content(1, 5_000)).await;
    assert_eq!(h.recorder.count(EventType::QuotaWarning), 0);

    h.upload("alice", "b.bin", &content(2, 4_500)).await;
    assert_eq!(h.recorder.count(EventType::QuotaWarning), 1);

    h.upload("alice", "c.bin", &content(3, 100)).await;
    assert_eq!(h.recorder.count(EventType::QuotaWarning), 1);
}

#[tokio::test]
async fn upload_falls_back_to_local_when_remote_fails() {
    let remote = FakeRemote::new(StorageType::S3Compatible);
    let h = Harness::build(Some(remote.clone()), |_| {}).await;

    let stored = h.upload("alice", "a.txt", b"remote bytes").await;
    assert_eq!(stored.storage_type, StorageType::S3Compatible);
    assert!(remote.contains(&stored.storage_key));

    remote.set_failing(true);
    let fallback = h.upload("alice", "b.txt", b"local bytes").await;
    assert_eq!(fallback.storage_type, StorageType::Local);
    assert!(h.local.exists(&fallback.storage_key).await.unwrap());
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn small_duplicate_becomes_reference_before_response() {
    let h = Harness::new().await;
    let data = content(7, 600);

    let first = h.upload("alice", "a.txt", &data).await;
    let outcome = h
        .state
        .orchestrator
        .upload(upload_request("alice", "copy.txt", &data))
        .await
        .unwrap();
    h.idle().await;

    assert!(outcome.is_duplicate);
    assert!(!outcome.dedup_pending);
    let second = outcome.file;
    assert_eq!(second.physical_size, 0);
    assert_eq!(second.logical_size, 600);
    assert_eq!(second.reference_of.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.content_fingerprint, first.content_fingerprint);

    // Both copies are charged at logical size.
    assert_eq!(used(&h, "alice").await, 1_200);
}

#[tokio::test]
async fn identical_content_is_never_shared_across_owners() {
    let h = Harness::new().await;
    let data = content(9, 300);

    let a = h.upload("alice", "a.txt", &data).await;
    let outcome = h
        .state
        .orchestrator
        .upload(upload_request("bob", "b.txt", &data))
        .await
        .unwrap();

    assert!(!outcome.is_duplicate);
    assert_eq!(outcome.file.physical_size, 300);
    assert_ne!(outcome.file.storage_key, a.storage_key);
    assert!(outcome.file.storage_key.starts_with("user_bob/"));
}

#[tokio::test]
async fn large_duplicate_is_resolved_in_background() {
    let h = Harness::new().await;
    let data = content(3, 2_000);

    let first = h.upload("alice", "a.bin", &data).await;
    let outcome = h
        .state
        .orchestrator
        .upload(upload_request("alice", "b.bin", &data))
        .await
        .unwrap();
    assert!(outcome.dedup_pending);
    assert!(!outcome.is_duplicate);
    assert_eq!(outcome.file.physical_size, 2_000);
    h.idle().await;

    let second = h.db.get_file(&outcome.file.id).unwrap().unwrap();
    assert_eq!(second.reference_of.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.physical_size, 0);
    assert_eq!(h.recorder.count(EventType::FileDeduplicated), 1);
    assert!(h.local.exists(&second.storage_key).await.unwrap());

    // The retraction is provisional until the owner is reconciled.
    assert!(h.state.quota.dirty_owners().contains(&"alice".to_string()));
    assert_eq!(used(&h, "alice").await, 2_000);
    assert_eq!(h.state.orchestrator.reconcile("alice").await.unwrap(), 4_000);
    assert!(h.state.quota.dirty_owners().is_empty());
}

#[tokio::test]
async fn purging_the_holder_promotes_a_reference() {
    let h = Harness::with_remote().await;
    let data = content(5, 400);

    let holder = h.upload("alice", "a.txt", &data).await;
    let copy = h.upload("alice", "b.txt", &data).await;
    assert_eq!(copy.storage_key, holder.storage_key);

    h.state
        .orchestrator
        .permanent_delete("alice", &holder.id, None)
        .await
        .unwrap();
    h.idle().await;

    let promoted = h.db.get_file(&copy.id).unwrap().unwrap();
    assert!(promoted.reference_of.is_none());
    assert_eq!(promoted.physical_size, 400);
    assert!(h.remote.as_ref().unwrap().contains(&promoted.storage_key));

    let download = h
        .state
        .orchestrator
        .download("alice", &copy.id, None)
        .await
        .unwrap();
    let chunks: Vec<Bytes> = download.stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), data);

    // Deleting the last sharer removes the bytes.
    h.state
        .orchestrator
        .permanent_delete("alice", &copy.id, None)
        .await
        .unwrap();
    h.idle().await;
    assert!(!h.remote.as_ref().unwrap().contains(&promoted.storage_key));
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn download_streams_bytes_and_counts_bandwidth() {
    let h = Harness::new().await;
    let data = content(2, 1_000);
    let file = h.upload("alice", "a.bin", &data).await;
    let before = h.state.orchestrator.bandwidth("alice").await.unwrap().used_bytes;
    assert_eq!(before, 1_000);

    let download = h
        .state
        .orchestrator
        .download("alice", &file.id, Some("req-dl"))
        .await
        .unwrap();
    let chunks: Vec<Bytes> = download.stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), data);
    h.idle().await;

    let after = h.state.orchestrator.bandwidth("alice").await.unwrap();
    assert_eq!(after.used_bytes, 2_000);
    assert_eq!(after.period, period_key(Utc::now()));
    let touched = h.db.get_file(&file.id).unwrap().unwrap();
    assert!(touched.last_accessed_at >= file.last_accessed_at);
}

#[tokio::test]
async fn download_over_bandwidth_is_refused() {
    let h = Harness::new().await;
    let file = h.upload("alice", "a.bin", &content(2, 1_000)).await;
    let key = format!("bandwidth:alice:{}", period_key(Utc::now()));
    h.cache.set(&key, 49_500, None).await.unwrap();

    let Err(err) = h.state.orchestrator.download("alice", &file.id, None).await else {
        panic!("download should be refused");
    };
    assert!(matches!(
        err,
        Error::BandwidthExceeded {
            used: 49_500,
            limit: 50_000,
            requested: 1_000
        }
    ));
    assert_eq!(h.recorder.count(EventType::BandwidthExceeded), 1);
}

#[tokio::test]
async fn missing_bytes_surface_as_orphan() {
    let h = Harness::new().await;
    let file = h.upload("alice", "a.txt", b"soon gone").await;
    h.local.delete(&file.storage_key).await.unwrap();

    let Err(err) = h.state.orchestrator.download("alice", &file.id, None).await else {
        panic!("download should fail");
    };
    match err {
        Error::OrphanFile { file_id, locator } => {
            assert_eq!(file_id, file.id);
            assert!(locator.contains(&file.storage_key));
        }
        other => panic!("expected orphan, got {other:?}"),
    }
}

#[tokio::test]
async fn other_owners_cannot_touch_a_file() {
    let h = Harness::new().await;
    let file = h.upload("alice", "a.txt", b"private").await;
    let orchestrator = &h.state.orchestrator;

    assert!(matches!(
        orchestrator.get_file("bob", &file.id).await,
        Err(Error::Authorization(_))
    ));
    assert!(matches!(
        orchestrator.soft_delete("bob", &file.id, None).await,
        Err(Error::Authorization(_))
    ));
    assert!(matches!(
        orchestrator.rename("bob", &file.id, "mine.txt").await,
        Err(Error::Authorization(_))
    ));
    assert!(matches!(
        orchestrator.get_file("alice", "no-such-id").await,
        Err(Error::RecordNotFound(_))
    ));
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn trash_and_restore_move_quota() {
    let h = Harness::new().await;
    let a = h.upload("alice", "a.bin", &content(1, 6_000)).await;
    assert_eq!(used(&h, "alice").await, 6_000);

    let trashed = h.state.orchestrator.soft_delete("alice", &a.id, None).await.unwrap();
    assert!(trashed.is_deleted);
    h.idle().await;
    assert_eq!(used(&h, "alice").await, 0);
    assert!(h.state.orchestrator.list_files("alice").await.unwrap().is_empty());
    assert_eq!(h.recorder.count(EventType::FileDeleted), 1);

    // Trashing twice is a no-op.
    h.state.orchestrator.soft_delete("alice", &a.id, None).await.unwrap();
    h.idle().await;
    assert_eq!(h.recorder.count(EventType::FileDeleted), 1);

    h.upload("alice", "b.bin", &content(2, 6_000)).await;
    let refused = h.state.orchestrator.restore("alice", &a.id, None).await;
    assert!(matches!(refused, Err(Error::QuotaExceeded { .. })));
    assert!(h.db.get_file(&a.id).unwrap().unwrap().is_deleted);
}

#[tokio::test]
async fn restore_recharges_quota() {
    let h = Harness::new().await;
    let a = h.upload("alice", "a.bin", &content(1, 3_000)).await;
    h.state.orchestrator.soft_delete("alice", &a.id, None).await.unwrap();
    h.idle().await;

    let restored = h.state.orchestrator.restore("alice", &a.id, None).await.unwrap();
    assert!(!restored.is_deleted);
    h.idle().await;
    assert_eq!(used(&h, "alice").await, 3_000);
    assert_eq!(h.recorder.count(EventType::FileRestored), 1);
}

#[tokio::test]
async fn replacing_content_adjusts_quota_and_frees_old_bytes() {
    let h = Harness::new().await;
    let original = h.upload("alice", "doc.txt", &content(1, 1_000)).await;

    let updated = h
        .state
        .orchestrator
        .update_content(
            "alice",
            &original.id,
            Bytes::from(content(4, 3_000)),
            None,
            None,
        )
        .await
        .unwrap();
    h.idle().await;

    assert_eq!(updated.id, original.id);
    assert_eq!(updated.logical_size, 3_000);
    assert_ne!(updated.storage_key, original.storage_key);
    assert_ne!(updated.content_fingerprint, original.content_fingerprint);
    assert!(!h.local.exists(&original.storage_key).await.unwrap());
    assert_eq!(used(&h, "alice").await, 3_000);
    assert_eq!(h.recorder.count(EventType::FileUpdated), 1);
}

#[tokio::test]
async fn rename_and_tier_changes() {
    let h = Harness::new().await;
    let file = h.upload("alice", "a.txt", b"hello").await;
    let orchestrator = &h.state.orchestrator;

    let renamed = orchestrator.rename("alice", &file.id, "b.txt").await.unwrap();
    assert_eq!(renamed.name, "b.txt");
    assert!(matches!(
        orchestrator.rename("alice", &file.id, "").await,
        Err(Error::Validation(_))
    ));

    let cold = orchestrator.set_cold("alice", &file.id, true, None).await.unwrap();
    assert_eq!(cold.tier(), StorageTier::Cold);
    orchestrator.set_cold("alice", &file.id, true, None).await.unwrap();
    assert_eq!(h.recorder.count(EventType::FileColdStorage), 1);

    let warm = orchestrator.set_cold("alice", &file.id, false, None).await.unwrap();
    assert_eq!(warm.tier(), StorageTier::Hot);
    assert_eq!(h.recorder.count(EventType::FileWarmed), 1);
}
