mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::sample_file;
use storage_orchestrator::backend::StorageBackend;
use storage_orchestrator::dedup::{DedupMode, DeduplicationEngine};
use storage_orchestrator::error::Error;
use storage_orchestrator::object_store::{LocalStore, ObjectStore};
use storage_orchestrator::storage::models::FileRecord;
use storage_orchestrator::storage::{Database, MetadataStore};

struct Fixture {
    _dir: tempfile::TempDir,
    db: Database,
    local: Arc<LocalStore>,
    engine: DeduplicationEngine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let local = Arc::new(LocalStore::new(dir.path().join("files")).unwrap());
    let backend = Arc::new(StorageBackend::new(
        Arc::clone(&local),
        Vec::new(),
        Duration::from_secs(1),
        0,
    ));
    let metadata: Arc<dyn MetadataStore> = Arc::new(db.clone());
    let engine = DeduplicationEngine::new(backend, metadata, 1024);
    Fixture {
        _dir: dir,
        db,
        local,
        engine,
    }
}

async fn stored(f: &Fixture, id: &str, owner_id: &str, fp: &str, data: &'static str) -> FileRecord {
    let mut file = sample_file(id, owner_id);
    file.content_fingerprint = Some(fp.to_string());
    file.logical_size = data.len() as u64;
    file.physical_size = data.len() as u64;
    f.local.put(&file.storage_key, Bytes::from(data)).await.unwrap();
    f.db.put_file(&file).unwrap();
    file
}

#[test]
fn threshold_splits_sync_and_deferred() {
    let f = fixture();
    assert_eq!(f.engine.mode_for(1023), DedupMode::Sync);
    assert_eq!(f.engine.mode_for(1024), DedupMode::Deferred);
}

#[tokio::test]
async fn candidates_without_bytes_are_skipped() {
    let f = fixture();
    let ghost = stored(&f, "ghost", "alice", "fp", "data").await;
    f.local.delete(&ghost.storage_key).await.unwrap();

    let check = f.engine.check_duplicate("alice", "fp", |_| true).await.unwrap();
    assert!(!check.is_duplicate);

    stored(&f, "real", "alice", "fp", "data").await;
    let check = f.engine.check_duplicate("alice", "fp", |_| true).await.unwrap();
    assert_eq!(check.existing.map(|e| e.id).as_deref(), Some("real"));
}

#[tokio::test]
async fn holders_are_preferred_over_references() {
    let f = fixture();
    let holder = stored(&f, "holder", "alice", "fp", "data").await;
    let copy = stored(&f, "copy", "alice", "fp", "data").await;
    f.engine.create_reference(&copy, &holder).await.unwrap();

    let check = f
        .engine
        .check_duplicate("alice", "fp", |c| c.id != "nobody")
        .await
        .unwrap();
    assert_eq!(check.existing.unwrap().id, "holder");

    let filtered = f
        .engine
        .check_duplicate("alice", "fp", |c| c.id != "holder")
        .await
        .unwrap();
    assert_eq!(filtered.existing.unwrap().id, "copy");
}

#[tokio::test]
async fn references_never_cross_owners() {
    let f = fixture();
    let alice = stored(&f, "a", "alice", "fp", "data").await;
    let bob = stored(&f, "b", "bob", "fp", "data").await;

    assert!(matches!(
        f.engine.create_reference(&bob, &alice).await,
        Err(Error::Authorization(_))
    ));
    let check = f.engine.check_duplicate("bob", "fp", |c| c.id != "b").await.unwrap();
    assert!(!check.is_duplicate);
}

#[tokio::test]
async fn reference_of_a_reference_points_at_the_holder() {
    let f = fixture();
    let holder = stored(&f, "holder", "alice", "fp", "data").await;
    let first = stored(&f, "first", "alice", "fp", "data").await;
    let second = stored(&f, "second", "alice", "fp", "data").await;

    let first = f.engine.create_reference(&first, &holder).await.unwrap();
    let second = f.engine.create_reference(&second, &first).await.unwrap();
    assert_eq!(second.reference_of.as_deref(), Some("holder"));
    assert_eq!(second.physical_size, 0);
    assert_eq!(second.logical_size, 4);
}

#[tokio::test]
async fn release_deletes_unshared_bytes() {
    let f = fixture();
    let lone = stored(&f, "lone", "alice", "fp-lone", "data").await;
    let removed = f.db.delete_file("lone").unwrap().unwrap();

    f.engine.release(&removed).await;
    assert!(!f.local.exists(&lone.storage_key).await.unwrap());
}

#[tokio::test]
async fn release_of_holder_promotes_and_keeps_linked_copy() {
    let f = fixture();
    let holder = stored(&f, "holder", "alice", "fp", "data").await;
    let copy = stored(&f, "copy", "alice", "fp", "data").await;
    let copy = f.engine.create_reference(&copy, &holder).await.unwrap();

    let removed = f.db.delete_file("holder").unwrap().unwrap();
    f.engine.release(&removed).await;

    let heir = f.db.get_file("copy").unwrap().unwrap();
    assert!(heir.reference_of.is_none());
    assert_eq!(heir.physical_size, 4);
    assert!(!f.local.exists(&holder.storage_key).await.unwrap());
    assert_eq!(f.local.get(&copy.storage_key).await.unwrap(), Bytes::from("data"));
}

#[tokio::test]
async fn chained_purges_hand_the_bytes_down() {
    let f = fixture();
    let holder = stored(&f, "holder", "alice", "fp", "data").await;
    let first = stored(&f, "first", "alice", "fp", "data").await;
    let second = stored(&f, "second", "alice", "fp", "data").await;
    f.engine.create_reference(&first, &holder).await.unwrap();
    let second = f.engine.create_reference(&second, &holder).await.unwrap();

    let removed = f.db.delete_file("holder").unwrap().unwrap();
    f.engine.release(&removed).await;
    let repointed = f.db.get_file("second").unwrap().unwrap();
    assert_eq!(repointed.reference_of.as_deref(), Some("first"));

    let removed = f.db.delete_file("first").unwrap().unwrap();
    f.engine.release(&removed).await;
    let last = f.db.get_file("second").unwrap().unwrap();
    assert!(last.reference_of.is_none());
    assert_eq!(last.physical_size, 4);
    assert_eq!(f.local.get(&second.storage_key).await.unwrap(), Bytes::from("data"));
}

#[tokio::test]
async fn reference_to_a_missing_holder_counts_as_the_holder() {
    let f = fixture();
    let holder = stored(&f, "holder", "alice", "fp", "data").await;
    let first = stored(&f, "first", "alice", "fp", "data").await;
    let second = stored(&f, "second", "alice", "fp", "data").await;
    f.engine.create_reference(&first, &holder).await.unwrap();
    f.engine.create_reference(&second, &holder).await.unwrap();

    // The holder row went away without its references being updated.
    f.db.delete_file("holder").unwrap();

    let removed = f.db.delete_file("first").unwrap().unwrap();
    f.engine.release(&removed).await;
    let last = f.db.get_file("second").unwrap().unwrap();
    assert!(last.reference_of.is_none());
    assert_eq!(last.physical_size, 4);
}
