/// Entity handle tests
///
/// Local edits, change tracking and save bookkeeping without relying on
/// network timing.
/// Run with: cargo test --test entity_tests
use memosync::{EvictionPolicy, InMemoryTransport, SyncClient, SyncConfig, SyncError, Value};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

async fn open() -> (SyncClient, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    (client, transport)
}

#[tokio::test]
async fn test_failed_generation_is_carried_into_later_edits() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({ "x": 1 }));
    let item = client.reference("Item", &id);
    item.fetch().await.unwrap();

    item.put("x", 2).unwrap();
    let first = item.start_save();
    item.put("y", 3).unwrap();
    item.handle_save_result(None, &first).unwrap();

    assert!(item.is_dirty_key("x"));
    assert!(item.is_dirty_key("y"));
    assert_eq!(item.pending_generations(), 1);
    let estimated = item.estimated_data();
    assert_eq!(estimated.get("x"), Some(&Value::Integer(2)));
    assert_eq!(estimated.get("y"), Some(&Value::Integer(3)));

    // A second outcome for the same generation changes nothing.
    item.handle_save_result(None, &first).unwrap();
    assert_eq!(item.estimated_data(), estimated);
}

#[tokio::test]
async fn test_failed_increments_accumulate() {
    let (client, transport) = open().await;
    let id = transport.seed("Counter", json!({ "n": 10 }));
    let counter = client.reference("Counter", &id);
    counter.fetch().await.unwrap();

    counter.increment("n", 1).unwrap();
    let sent = counter.start_save();
    counter.increment("n", 2).unwrap();
    counter.handle_save_result(None, &sent).unwrap();
    assert_eq!(counter.get_i64("n").unwrap(), Some(13));

    counter.save().await.unwrap();
    assert_eq!(transport.object("Counter", &id).unwrap()["n"], json!(13));
}

#[tokio::test]
async fn test_failed_save_does_not_override_queued_edit() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({ "x": 0, "n": 0 }));
    let item = client.reference("Item", &id);
    item.fetch().await.unwrap();
    client.command_cache().set_connected(false).await;

    item.put("x", 1).unwrap();
    item.put("n", 10).unwrap();
    let live = item.start_save();
    item.put("x", 2).unwrap();
    item.increment("n", 5).unwrap();
    let queued = item.save_later().await.unwrap();
    item.handle_save_result(None, &live).unwrap();

    assert_eq!(item.get_i64("x").unwrap(), Some(2));
    assert_eq!(item.get_i64("n").unwrap(), Some(15));
    assert!(!item.is_dirty_key("x"));
    assert!(item.is_dirty_key("n"));

    client.command_cache().set_connected(true).await;
    tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .unwrap()
        .unwrap();
    item.save().await.unwrap();

    let stored = transport.object("Item", &id).unwrap();
    assert_eq!(stored["x"], json!(2));
    assert_eq!(stored["n"], json!(15));
    assert_eq!(item.get_i64("x").unwrap(), Some(2));
    assert_eq!(item.get_i64("n").unwrap(), Some(15));
}

#[tokio::test]
async fn test_dirty_invariant_over_a_graph() {
    let (client, transport) = open().await;
    let leaf = client.reference("Leaf", &transport.seed("Leaf", json!({})));
    let middle = client.reference("Middle", &transport.seed("Middle", json!({})));
    let root = client.reference("Root", &transport.seed("Root", json!({})));
    root.fetch().await.unwrap();
    middle.fetch().await.unwrap();
    leaf.fetch().await.unwrap();

    root.put("middle", &middle).unwrap();
    middle.put("leaf", &leaf).unwrap();
    root.save().await.unwrap();
    assert!(!root.is_dirty());
    assert!(!middle.is_dirty());

    leaf.put("color", "red").unwrap();
    assert!(leaf.is_dirty());
    assert!(middle.is_dirty());
    assert!(root.is_dirty());
    assert!(!root.has_changes());

    leaf.revert_all();
    assert!(!root.is_dirty());

    let fresh = client.create("Leaf");
    middle.put("other", &fresh).unwrap();
    middle.save().await.unwrap();
    assert!(!root.is_dirty());
    assert!(fresh.object_id().is_some());
}

#[tokio::test]
async fn test_save_listeners_run_on_success_only() {
    let (client, transport) = open().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let item = client.create("Item");
    let listener = item.add_save_listener({
        let calls = calls.clone();
        move |saved| {
            assert!(saved.object_id().is_some());
            calls.fetch_add(1, Ordering::SeqCst);
        }
    });

    transport.set_online(false);
    assert!(item.save().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    transport.set_online(true);
    item.save().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(item.remove_save_listener(listener));
    item.put("x", 1).unwrap();
    item.save().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_list_operations() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    item.add("tags", "a").unwrap();
    item.add("tags", "b").unwrap();
    assert!(item.add_unique("tags", "c").is_err());
    item.save().await.unwrap();

    item.remove_all("tags", vec![Value::from("a")]).unwrap();
    assert_eq!(item.get_list("tags").unwrap(), Some(vec![Value::from("b")]));
    item.save().await.unwrap();

    item.add_all_unique("tags", vec![Value::from("b"), Value::from("c")]).unwrap();
    item.save().await.unwrap();
    assert_eq!(
        item.get_list("tags").unwrap(),
        Some(vec![Value::from("b"), Value::from("c")])
    );

    let stored = transport.object("Item", &item.object_id().unwrap()).unwrap();
    assert_eq!(stored["tags"], json!(["b", "c"]));
}

#[tokio::test]
async fn test_invalid_edits_fail_synchronously() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    assert!(matches!(item.put("objectId", "x"), Err(SyncError::InvalidKey(_))));
    item.put("name", "text").unwrap();
    assert!(item.increment("name", 1).is_err());
    assert_eq!(item.get_string("name").unwrap().as_deref(), Some("text"));

    item.save().await.unwrap();
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_config_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memosync.json");
    std::fs::write(
        &path,
        r#"{
            "cache_dir": "/var/lib/app/sync",
            "command_cache": { "max_retries": 0, "retry_cooldown_ms": 250, "eviction": "reject_new" },
            "batch": { "max_batch_size": 0 }
        }"#,
    )
    .unwrap();

    let config = SyncConfig::load(&path).unwrap();
    assert_eq!(config.command_cache.max_retries, 1);
    assert_eq!(config.command_cache.retry_cooldown(), Duration::from_millis(250));
    assert_eq!(config.command_cache.eviction, EvictionPolicy::RejectNew);
    assert_eq!(config.command_cache.max_storage_bytes, 10 * 1024 * 1024);
    assert_eq!(config.batch.max_batch_size, 1);
    assert_eq!(
        config.commands_dir().unwrap(),
        std::path::Path::new("/var/lib/app/sync/commands")
    );

    assert!(SyncConfig::load(dir.path().join("missing.json")).is_err());
}
