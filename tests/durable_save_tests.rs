/// Durable save tests
///
/// `save_later` / `delete_later` through the client, including restarts and
/// connectivity changes.
/// Run with: cargo test --test durable_save_tests
use memosync::{CacheEvent, InMemoryMirror, InMemoryTransport, SyncClient, SyncConfig, SyncError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_save_later_delivers_and_updates_entity() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    let note = client.create("Note");
    note.put("text", "remember the milk").unwrap();

    let delivery = note.save_later().await.unwrap();
    assert_eq!(note.get_string("text").unwrap().as_deref(), Some("remember the milk"));

    timeout(WAIT, delivery).await.unwrap().unwrap();
    let object_id = note.object_id().unwrap();
    assert!(!note.is_dirty());
    assert_eq!(
        transport.object("Note", &object_id).unwrap()["text"],
        json!("remember the milk")
    );
}

#[tokio::test]
async fn test_save_later_while_offline_waits_for_connectivity() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    client.command_cache().set_connected(false).await;

    let note = client.create("Note");
    note.put("n", 1).unwrap();
    let delivery = note.save_later().await.unwrap();
    note.put("n", 2).unwrap();
    let second = note.save_later().await.unwrap();

    sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.request_count(), 0);
    assert_eq!(client.command_cache().pending_count().await.unwrap(), 2);
    assert_eq!(note.pending_generations(), 3);

    client.connectivity().set_connected(true);
    timeout(WAIT, delivery).await.unwrap().unwrap();
    timeout(WAIT, second).await.unwrap().unwrap();

    // One object: the second queued create became an update.
    let notes = transport.objects("Note");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["n"], json!(2));
    assert_eq!(note.get_i64("n").unwrap(), Some(2));
    assert_eq!(note.pending_generations(), 1);
}

#[tokio::test]
async fn test_dropped_save_later_keeps_edits() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    let mut events = client.command_cache().subscribe();
    let note = client.create("Note");
    note.put("text", "x").unwrap();
    transport.fail_next(SyncError::server(memosync::codes::INVALID_JSON, "bad body"));

    let delivery = note.save_later().await.unwrap();
    let err = timeout(WAIT, delivery).await.unwrap().unwrap_err();
    assert_eq!(err.code(), memosync::codes::INVALID_JSON);

    assert!(note.object_id().is_none());
    assert!(note.is_dirty_key("text"));
    loop {
        if let CacheEvent::Dropped { .. } = timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            break;
        }
    }
}

#[tokio::test]
async fn test_delete_later() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    let id = transport.seed("Note", json!({ "text": "old" }));
    let note = client.reference("Note", &id);

    let delivery = note.delete_later().await.unwrap();
    assert!(note.is_deleting());
    timeout(WAIT, delivery).await.unwrap().unwrap();

    assert!(note.is_deleted());
    assert!(!note.is_deleting());
    assert!(transport.object("Note", &id).is_none());
}

#[tokio::test]
async fn test_delete_later_of_queued_create() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    client.command_cache().set_connected(false).await;

    let note = client.create("Note");
    let created = note.save_later().await.unwrap();
    let deleted = note.delete_later().await.unwrap();
    client.command_cache().set_connected(true).await;

    timeout(WAIT, created).await.unwrap().unwrap();
    timeout(WAIT, deleted).await.unwrap().unwrap();
    assert!(note.is_deleted());
    assert!(transport.objects("Note").is_empty());
}

#[tokio::test]
async fn test_queued_commands_survive_restart() {
    let dir = tempdir().unwrap();
    let transport = InMemoryTransport::new();
    let config = SyncConfig::new(dir.path());

    {
        let client = SyncClient::open(config.clone(), Arc::new(transport.clone()))
            .await
            .unwrap();
        client.command_cache().set_connected(false).await;

        let parent = client.create("Parent");
        parent.put("name", "root").unwrap();
        let _ = parent.save_later().await.unwrap();

        let child = client.create("Child");
        child.put("parent", &parent).unwrap();
        let _ = child.save_later().await.unwrap();

        assert_eq!(client.command_cache().pending_count().await.unwrap(), 2);
        assert_eq!(client.local_ids().retain_count(&parent.local_id()), 2);
        client.shutdown().await.unwrap();
    }
    assert_eq!(transport.request_count(), 0);

    let client = SyncClient::open(config, Arc::new(transport.clone()))
        .await
        .unwrap();
    let cache = client.command_cache();
    timeout(WAIT, async {
        while cache.pending_count().await.unwrap() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued commands were not delivered");

    let parents = transport.objects("Parent");
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0]["name"], json!("root"));
    let children = transport.objects("Child");
    assert_eq!(children[0]["parent"]["objectId"], parents[0]["objectId"]);
    assert!(client.local_ids().is_empty());
}

#[tokio::test]
async fn test_connectivity_monitor_drives_the_cache() {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();

    client.connectivity().set_connected(false);
    let cache = client.command_cache();
    timeout(WAIT, async {
        while cache.is_connected().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let note = client.create("Note");
    let delivery = note.save_later().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.request_count(), 0);

    client.connectivity().set_connected(true);
    timeout(WAIT, delivery).await.unwrap().unwrap();
    assert!(note.object_id().is_some());
}

#[tokio::test]
async fn test_cache_offline_after_retries_resumes_on_connected_report() {
    let transport = InMemoryTransport::new();
    let config = SyncConfig::default()
        .max_retries(2)
        .retry_cooldown(Duration::from_millis(10));
    let client = SyncClient::open(config, Arc::new(transport.clone()))
        .await
        .unwrap();
    let mut events = client.command_cache().subscribe();
    transport.set_online(false);

    let note = client.create("Note");
    note.put("text", "queued").unwrap();
    let delivery = note.save_later().await.unwrap();
    loop {
        if let CacheEvent::Disconnected = timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            break;
        }
    }
    assert!(client.connectivity().is_connected());
    assert!(!client.command_cache().is_connected().await);

    transport.set_online(true);
    client.connectivity().set_connected(true);
    timeout(WAIT, delivery).await.unwrap().unwrap();
    assert!(client.command_cache().is_connected().await);
    assert_eq!(transport.objects("Note")[0]["text"], json!("queued"));
}

#[tokio::test]
async fn test_mirror_follows_saves_and_deletes() {
    let transport = InMemoryTransport::new();
    let mirror = Arc::new(InMemoryMirror::new());
    let client = SyncClient::open_with_mirror(
        SyncConfig::default(),
        Arc::new(transport.clone()),
        mirror.clone(),
    )
    .await
    .unwrap();

    let note = client.create("Note");
    note.put("text", "offline copy").unwrap();
    note.save().await.unwrap();
    let object_id = note.object_id().unwrap();
    let copy = mirror.get("Note", &object_id).unwrap();
    assert_eq!(copy.object_id(), Some(object_id.as_str()));

    let reloaded = client.reference("Note", &object_id);
    assert!(reloaded.fetch_from_mirror().await.unwrap());
    assert_eq!(
        reloaded.get_string("text").unwrap().as_deref(),
        Some("offline copy")
    );

    note.delete().await.unwrap();
    assert!(mirror.get("Note", &object_id).is_none());
}

#[tokio::test]
async fn test_mirror_moves_local_copy_to_server_id() {
    let transport = InMemoryTransport::new();
    let mirror = Arc::new(InMemoryMirror::new());
    let client = SyncClient::open_with_mirror(
        SyncConfig::default(),
        Arc::new(transport.clone()),
        mirror.clone(),
    )
    .await
    .unwrap();
    client.command_cache().set_connected(false).await;

    let note = client.create("Note");
    note.put("text", "draft").unwrap();
    let delivery = note.save_later().await.unwrap();
    let local_id = note.local_id();
    assert!(mirror.get("Note", &local_id).is_some());

    client.command_cache().set_connected(true).await;
    timeout(WAIT, delivery).await.unwrap().unwrap();
    let object_id = note.object_id().unwrap();
    assert!(mirror.get("Note", &local_id).is_none());
    assert!(mirror.get("Note", &object_id).is_some());
    assert_eq!(mirror.len(), 1);
}
