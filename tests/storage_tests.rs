use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vaultsync::storage::{ChangeBus, WriteStrategy, manifest_key};
use vaultsync::{
    BroadcastChangeBus, FileKvStore, KvStore, MemoryKvStore, ReadOptions, StorageFacade,
    StoragePolicy, StorageTiers, WriteFlags,
};

fn small_thresholds() -> StoragePolicy {
    StoragePolicy {
        small_store_max_bytes: 256,
        large_store_threshold_bytes: 4096,
        chunk_size_bytes: 100,
        ..StoragePolicy::default()
    }
}

#[tokio::test]
async fn file_tiers_survive_a_new_facade() {
    let dir = tempfile::tempdir().unwrap();
    let tiers = |small: FileKvStore, large: FileKvStore| StorageTiers {
        ephemeral: Arc::new(MemoryKvStore::new("ephemeral")),
        small: Arc::new(small),
        large: Arc::new(large),
    };

    let first = StorageFacade::new(
        tiers(
            FileKvStore::open("small", dir.path().join("small")).await.unwrap(),
            FileKvStore::open("large", dir.path().join("large")).await.unwrap(),
        ),
        StoragePolicy::default(),
    );
    first
        .set("settings", json!({"theme": "dark"}), &WriteFlags::default())
        .await
        .unwrap();

    let second = StorageFacade::new(
        tiers(
            FileKvStore::open("small", dir.path().join("small")).await.unwrap(),
            FileKvStore::open("large", dir.path().join("large")).await.unwrap(),
        ),
        StoragePolicy::default(),
    );
    assert_eq!(
        second.get_value("settings").await.unwrap(),
        Some(json!({"theme": "dark"}))
    );
}

#[tokio::test]
async fn mid_sized_payload_is_chunked_and_reassembled() {
    let tiers = StorageTiers::in_memory();
    let facade = StorageFacade::new(tiers.clone(), small_thresholds());
    let body = "x".repeat(1000);

    let strategy = facade
        .set("snippets", json!([{"id": "s1", "content": body}]), &WriteFlags::default())
        .await
        .unwrap();
    assert_eq!(strategy, WriteStrategy::Distributed);
    assert!(tiers.small.get(&manifest_key("snippets")).await.unwrap().is_some());
    assert!(tiers.small.get("snippets").await.unwrap().is_none());

    facade.clear_cache();
    let read = facade
        .get("snippets", &ReadOptions::strict())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read[0]["content"].as_str().unwrap().len(), 1000);

    // Shrinking the value moves it back to the small store and drops the manifest.
    assert_eq!(
        facade
            .set("snippets", json!([]), &WriteFlags::default())
            .await
            .unwrap(),
        WriteStrategy::Small
    );
    assert!(tiers.small.get(&manifest_key("snippets")).await.unwrap().is_none());
}

#[tokio::test]
async fn writes_replicate_to_sibling_contexts() {
    let bus: Arc<dyn ChangeBus> = Arc::new(BroadcastChangeBus::default());
    let tiers = StorageTiers::in_memory();
    let writer = Arc::new(
        StorageFacade::new(tiers.clone(), StoragePolicy::default()).with_change_bus(bus.clone()),
    );
    let reader = Arc::new(
        StorageFacade::new(tiers, StoragePolicy::default()).with_change_bus(bus),
    );
    let listener = reader.spawn_replication_listener().unwrap();

    reader
        .set("folders", json!([]), &WriteFlags::default())
        .await
        .unwrap();
    assert_eq!(reader.get_value("folders").await.unwrap(), Some(json!([])));

    writer
        .set("folders", json!([{"id": "f1"}]), &WriteFlags::default())
        .await
        .unwrap();

    let mut replicated = false;
    for _ in 0..50 {
        if reader.get_value("folders").await.unwrap() == Some(json!([{"id": "f1"}])) {
            replicated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    listener.abort();
    assert!(replicated);
}
