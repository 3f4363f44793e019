/// Live save tests
///
/// Deep saves, batching, principals, files and per-entity ordering against
/// the in-memory store.
/// Run with: cargo test --test save_tests
use memosync::{InMemoryTransport, Method, SyncClient, SyncConfig, SyncError, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn open() -> (SyncClient, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let client = SyncClient::open(SyncConfig::default(), Arc::new(transport.clone()))
        .await
        .unwrap();
    (client, transport)
}

#[tokio::test]
async fn test_save_creates_object() {
    let (client, transport) = open().await;
    let score = client.create("GameScore");
    score.put("player", "Sean").unwrap();
    score.increment("points", 10).unwrap();

    score.save().await.unwrap();

    let object_id = score.object_id().unwrap();
    let stored = transport.object("GameScore", &object_id).unwrap();
    assert_eq!(stored["player"], json!("Sean"));
    assert_eq!(stored["points"], json!(10));
    assert!(!score.is_dirty());
    assert!(score.created_at().is_some());
    assert_eq!(score.get_i64("points").unwrap(), Some(10));
}

#[tokio::test]
async fn test_second_save_sends_only_new_edits() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    item.put("name", "lamp").unwrap();
    item.save().await.unwrap();

    item.increment("count", 2).unwrap();
    item.save().await.unwrap();

    let object_id = item.object_id().unwrap();
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method, Method::Put);
    assert_eq!(requests[1].path, format!("classes/Item/{}", object_id));
    assert_eq!(transport.object("Item", &object_id).unwrap()["count"], json!(2));
}

#[tokio::test]
async fn test_clean_entity_save_sends_nothing() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    item.save().await.unwrap();
    transport.clear_requests();

    item.save().await.unwrap();
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_concurrent_saves_never_overlap_on_the_wire() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({ "x": 0 }));
    let item = client.reference("Item", &id);
    transport.set_latency(Duration::from_millis(80));

    item.put("x", 1).unwrap();
    let first = tokio::spawn({
        let item = item.clone();
        async move { item.save().await }
    });
    sleep(Duration::from_millis(20)).await;

    item.put("y", 2).unwrap();
    let second = tokio::spawn({
        let item = item.clone();
        async move { item.save().await }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let path = format!("classes/Item/{}", id);
    assert_eq!(transport.max_concurrent_requests(&path), 1);
    assert_eq!(transport.request_count(), 2);
    let stored = transport.object("Item", &id).unwrap();
    assert_eq!(stored["x"], json!(1));
    assert_eq!(stored["y"], json!(2));
}

#[tokio::test]
async fn test_edits_during_save_are_kept_for_next_save() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    item.put("a", 1).unwrap();
    transport.set_latency(Duration::from_millis(50));

    let saving = tokio::spawn({
        let item = item.clone();
        async move { item.save().await }
    });
    sleep(Duration::from_millis(10)).await;
    item.put("b", 2).unwrap();
    saving.await.unwrap().unwrap();

    assert!(item.object_id().is_some());
    assert!(item.is_dirty_key("b"));
    assert!(!item.is_dirty_key("a"));
    assert_eq!(item.get_i64("b").unwrap(), Some(2));
}

#[tokio::test]
async fn test_ring_of_unsaved_entities_fails_before_any_request() {
    let (client, transport) = open().await;
    let a = client.create("Node");
    let b = client.create("Node");
    let c = client.create("Node");
    a.put("next", &b).unwrap();
    b.put("next", &c).unwrap();
    c.put("next", &a).unwrap();

    let err = a.save().await.unwrap_err();
    assert!(matches!(err, SyncError::CircularDependency(_)));
    assert_eq!(transport.request_count(), 0);
    assert!(a.object_id().is_none());
}

#[tokio::test]
async fn test_children_are_saved_before_parents() {
    let (client, transport) = open().await;
    let author = client.create("Author");
    author.put("name", "Ursula").unwrap();
    let book = client.create("Book");
    book.put("title", "The Dispossessed").unwrap();
    book.put("author", &author).unwrap();

    book.save().await.unwrap();

    let author_id = author.object_id().unwrap();
    let stored = transport.object("Book", &book.object_id().unwrap()).unwrap();
    assert_eq!(
        stored["author"],
        json!({ "__type": "Pointer", "className": "Author", "objectId": author_id })
    );
    let paths: Vec<String> = transport.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["classes/Author", "classes/Book"]);
}

#[tokio::test]
async fn test_save_all_batches_in_chunks() {
    let (client, transport) = open().await;
    let items: Vec<_> = (0..120)
        .map(|i| {
            let item = client.create("Item");
            item.put("n", i).unwrap();
            item
        })
        .collect();

    client.save_all(&items).await.unwrap();

    let sizes: Vec<usize> = transport
        .requests()
        .into_iter()
        .filter(|r| r.path == "batch")
        .map(|r| r.size)
        .collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(transport.request_count(), 3);
    assert!(items.iter().all(|item| item.object_id().is_some()));
    for (i, item) in items.iter().enumerate() {
        let stored = transport.object("Item", &item.object_id().unwrap()).unwrap();
        assert_eq!(stored["n"], json!(i));
    }
}

#[tokio::test]
async fn test_batch_failure_is_reported_per_entity() {
    let (client, _transport) = open().await;
    let saved = client.create("Item");
    saved.save().await.unwrap();
    let missing = client.reference("Item", "gone");
    missing.put("x", 1).unwrap();
    saved.put("x", 1).unwrap();

    let err = client
        .save_all(&[saved.clone(), missing.clone()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), memosync::codes::OBJECT_NOT_FOUND);
    assert!(!saved.is_dirty());
    assert!(missing.is_dirty_key("x"));
}

#[tokio::test]
async fn test_connection_failure_keeps_edits() {
    let (client, transport) = open().await;
    let item = client.create("Item");
    item.put("x", 2).unwrap();
    transport.set_online(false);

    let err = item.save().await.unwrap_err();
    assert!(err.is_connection());
    assert!(item.is_dirty_key("x"));
    assert_eq!(item.pending_generations(), 1);

    transport.set_online(true);
    item.save().await.unwrap();
    let stored = transport.object("Item", &item.object_id().unwrap()).unwrap();
    assert_eq!(stored["x"], json!(2));
}

#[tokio::test]
async fn test_principal_gets_session_token() {
    let (client, transport) = open().await;
    let user = client.create("_User");
    user.put("username", "ada").unwrap();
    user.put("password", "s3cret").unwrap();

    user.save().await.unwrap();

    assert!(user.is_principal());
    assert!(user.session_token().unwrap().starts_with("r:"));
    assert_eq!(transport.requests()[0].path, "users");
    assert!(transport.object("_User", &user.object_id().unwrap()).is_some());
}

#[tokio::test]
async fn test_records_referencing_a_new_principal_wait_for_it() {
    let (client, transport) = open().await;
    let user = client.create("_User");
    user.put("username", "grace").unwrap();
    let post = client.create("Post");
    post.put("owner", &user).unwrap();

    post.save().await.unwrap();

    let stored = transport.object("Post", &post.object_id().unwrap()).unwrap();
    assert_eq!(stored["owner"]["objectId"], json!(user.object_id().unwrap()));
}

#[tokio::test]
async fn test_files_upload_before_their_owner() {
    let (client, transport) = open().await;
    let file = client.create_file("notes.txt", b"hello".to_vec(), Some("text/plain".into()));
    let doc = client.create("Doc");
    doc.put("attachment", file.clone()).unwrap();
    assert!(doc.is_dirty());

    doc.save().await.unwrap();

    let url = file.url().unwrap();
    assert!(!file.is_dirty());
    let stored = transport.object("Doc", &doc.object_id().unwrap()).unwrap();
    assert_eq!(stored["attachment"]["__type"], json!("File"));
    assert_eq!(stored["attachment"]["url"], json!(url));
    assert!(transport.requests()[0].path.starts_with("files/"));
}

#[tokio::test]
async fn test_fetch_loads_server_data() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({ "name": "chair", "legs": 4 }));
    let item = client.reference("Item", &id);
    assert!(matches!(item.get("name"), Err(SyncError::DataUnavailable(_))));

    item.fetch().await.unwrap();
    assert_eq!(item.get_string("name").unwrap().as_deref(), Some("chair"));
    assert_eq!(item.get_i64("legs").unwrap(), Some(4));
    assert!(item.is_data_available());

    transport.clear_requests();
    item.fetch_if_needed().await.unwrap();
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_fetch_keeps_unsaved_edits_on_top() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({ "name": "chair" }));
    let item = client.reference("Item", &id);
    item.put("name", "stool").unwrap();

    item.fetch().await.unwrap();
    assert_eq!(item.get_string("name").unwrap().as_deref(), Some("stool"));
    assert!(item.is_dirty_key("name"));
}

#[tokio::test]
async fn test_fetch_all_and_missing_objects() {
    let (client, transport) = open().await;
    let a = client.reference("Item", &transport.seed("Item", json!({ "n": 1 })));
    let b = client.reference("Item", &transport.seed("Item", json!({ "n": 2 })));
    client.fetch_all(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(a.get_i64("n").unwrap(), Some(1));
    assert_eq!(b.get_i64("n").unwrap(), Some(2));

    let missing = client.reference("Item", "nope");
    let err = missing.fetch().await.unwrap_err();
    assert_eq!(err.code(), memosync::codes::OBJECT_NOT_FOUND);

    let unsaved = client.create("Item");
    let err = unsaved.fetch().await.unwrap_err();
    assert_eq!(err.code(), memosync::codes::MISSING_OBJECT_ID);
}

#[tokio::test]
async fn test_delete_and_delete_all_dedup() {
    let (client, transport) = open().await;
    let id = transport.seed("Item", json!({}));
    let item = client.reference("Item", &id);
    item.delete().await.unwrap();
    assert!(item.is_deleted());
    assert!(transport.object("Item", &id).is_none());

    let id = transport.seed("Item", json!({}));
    let first = client.reference("Item", &id);
    let second = client.reference("Item", &id);
    let never_saved = client.create("Item");
    transport.clear_requests();

    client
        .delete_all(&[first.clone(), second.clone(), never_saved.clone()])
        .await
        .unwrap();

    let deletes: Vec<_> = transport
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert!(first.is_deleted());
    assert!(!never_saved.is_deleted());
    assert!(transport.object("Item", &id).is_none());
}

#[tokio::test]
async fn test_relation_ops_reach_server() {
    let (client, transport) = open().await;
    let tag = client.reference("Tag", &transport.seed("Tag", json!({})));
    let post = client.create("Post");
    post.add_relation("tags", &tag).unwrap();

    post.save().await.unwrap();

    let relation = post.get_relation("tags").unwrap();
    assert_eq!(relation.target_class.as_deref(), Some("Tag"));
    assert!(relation.contains(&tag));
    let stored = transport.object("Post", &post.object_id().unwrap()).unwrap();
    assert_eq!(stored["tags"]["__type"], json!("Relation"));
}

#[tokio::test]
async fn test_relation_to_unsaved_entity_is_rejected_at_encode() {
    let (client, _transport) = open().await;
    let tag = client.create("Tag");
    let post = client.create("Post");
    post.add_relation("tags", &tag).unwrap();

    let err = post.save().await.unwrap_err();
    assert_eq!(err.code(), memosync::codes::INVALID_POINTER);
    assert!(post.is_dirty_key("tags"));
}

#[tokio::test]
async fn test_lists_and_maps_of_entities_are_saved() {
    let (client, transport) = open().await;
    let a = client.create("Leaf");
    let b = client.create("Leaf");
    let root = client.create("Root");
    root.put("leaves", Value::List(vec![Value::from(&a)])).unwrap();
    let mut nested = std::collections::BTreeMap::new();
    nested.insert("inner".to_string(), Value::from(&b));
    root.put("nested", nested).unwrap();

    root.save().await.unwrap();

    assert!(a.object_id().is_some());
    assert!(b.object_id().is_some());
    let stored = transport.object("Root", &root.object_id().unwrap()).unwrap();
    assert_eq!(stored["leaves"][0]["objectId"], json!(a.object_id().unwrap()));
    assert_eq!(
        stored["nested"]["inner"]["objectId"],
        json!(b.object_id().unwrap())
    );
}
