use bytes::Bytes;
use futures::TryStreamExt;
use storage_orchestrator::object_store::{LocalStore, ObjectStore, ObjectStoreError};

#[tokio::test]
async fn test_local_store_put_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let data = Bytes::from("hello world");
    store.put("user_alice/a.txt", data.clone()).await.unwrap();

    let retrieved = store.get("user_alice/a.txt").await.unwrap();
    assert_eq!(retrieved, data);
}

#[tokio::test]
async fn test_local_store_exists_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    assert!(!store.exists("user_alice/missing").await.unwrap());

    store.put("user_alice/present", Bytes::from("data")).await.unwrap();
    assert!(store.exists("user_alice/present").await.unwrap());

    store.delete("user_alice/present").await.unwrap();
    assert!(!store.exists("user_alice/present").await.unwrap());

    // Deleting a nonexistent key should not error
    store.delete("user_alice/present").await.unwrap();
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let result = store.get("user_alice/missing").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
    let result = store.get_stream("user_alice/missing").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_local_store_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path().join("root")).unwrap();

    for key in ["../outside", "/etc/passwd", "user_a/../../x", ""] {
        let result = store.put(key, Bytes::from("x")).await;
        assert!(
            matches!(result, Err(ObjectStoreError::InvalidKey(_))),
            "key {key:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_local_store_streams_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let data = Bytes::from(vec![7u8; 200_000]);
    store.put("user_alice/big.bin", data.clone()).await.unwrap();

    let chunks: Vec<Bytes> = store
        .get_stream("user_alice/big.bin")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let joined: Vec<u8> = chunks.into_iter().flatten().collect();
    assert_eq!(joined, data.to_vec());
}

#[tokio::test]
async fn test_local_link_shares_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    store.put("user_alice/a.txt", Bytes::from("shared")).await.unwrap();
    store.put("user_alice/b.txt", Bytes::from("independent")).await.unwrap();
    store.link("user_alice/a.txt", "user_alice/b.txt").await.unwrap();

    assert_eq!(store.get("user_alice/b.txt").await.unwrap(), Bytes::from("shared"));

    // The link survives removal of the original name.
    store.delete("user_alice/a.txt").await.unwrap();
    assert_eq!(store.get("user_alice/b.txt").await.unwrap(), Bytes::from("shared"));
}

#[tokio::test]
async fn test_local_link_missing_source() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let result = store.link("user_alice/none.txt", "user_alice/b.txt").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
    assert!(!store.exists("user_alice/b.txt").await.unwrap());
}
