//! Container operation integration tests.

#[path = "../common/mod.rs"]
mod common;

use bytes::Bytes;
use common::map_fixture;
use std::sync::Arc;
use tio_client::protocol::status;
use tio_client::{ClientError, DataContainer, Record, Variant};
use tokio::sync::Barrier;

#[tokio::test]
async fn test_set_then_get_returns_int() {
    let (_server, _connection, container) = map_fixture("data").await;

    container.set("k1", 42).await.unwrap();
    let record = container.get("k1").await.unwrap();

    assert_eq!(record.key, Variant::from("k1"));
    assert_eq!(record.value, Variant::Int(42));
    assert!(record.metadata.is_none());
}

#[tokio::test]
async fn test_set_overwrites_and_keeps_metadata() {
    let (_server, _connection, container) = map_fixture("data").await;

    container.set("k1", "first").await.unwrap();
    container
        .set_with_metadata("k1", 2.5, "meta")
        .await
        .unwrap();

    let record = container.get("k1").await.unwrap();
    assert_eq!(record.value, Variant::Float(2.5));
    assert_eq!(record.metadata, Variant::from("meta"));
    assert_eq!(container.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_get_missing_key_is_protocol_error() {
    let (_server, _connection, container) = map_fixture("data").await;

    let err = container.get("nope").await.unwrap_err();
    assert!(err.is_protocol_error());
    assert_eq!(err.code(), Some(status::NO_SUCH_OBJECT));

    // the connection is still usable
    container.set("k", 1).await.unwrap();
}

#[tokio::test]
async fn test_strings_keep_embedded_nul_and_utf8() {
    let (_server, _connection, container) = map_fixture("data").await;
    let raw = Variant::string(Bytes::from_static(b"a\0b\0"));

    container.set("raw", raw.clone()).await.unwrap();
    container.set("text", "ação").await.unwrap();
    container.set("empty", "").await.unwrap();

    assert_eq!(container.get("raw").await.unwrap().value, raw);
    assert_eq!(
        container.get("text").await.unwrap().value.as_str(),
        Some("ação")
    );
    assert_eq!(container.get("empty").await.unwrap().value, Variant::from(""));
}

#[tokio::test]
async fn test_int_boundaries_survive_the_server() {
    let (_server, _connection, container) = map_fixture("data").await;

    for (i, value) in [i64::MIN, -1, 0, i64::from(i32::MAX) + 1, i64::MAX]
        .into_iter()
        .enumerate()
    {
        container.set(i as i64, value).await.unwrap();
        assert_eq!(
            container.get(i as i64).await.unwrap().value,
            Variant::Int(value)
        );
    }
}

#[tokio::test]
async fn test_insert_delete_count() {
    let (_server, _connection, container) = map_fixture("data").await;

    container.insert("a", 1, ()).await.unwrap();
    container.insert("b", 2, ()).await.unwrap();
    assert_eq!(container.count().await.unwrap(), 2);

    container.delete("a").await.unwrap();
    assert_eq!(container.count().await.unwrap(), 1);

    let err = container.delete("a").await.unwrap_err();
    assert!(err.is_protocol_error());
}

#[tokio::test]
async fn test_list_push_and_pop() {
    let (_server, connection, _map) = map_fixture("data").await;
    let list = connection.open("queue", "volatile_list").await.unwrap();

    list.push_back("b", ()).await.unwrap();
    list.push_back("c", ()).await.unwrap();
    list.push_front("a", "first").await.unwrap();

    let front = list.pop_front().await.unwrap();
    assert_eq!(front.value, Variant::from("a"));
    assert_eq!(front.metadata, Variant::from("first"));
    assert_eq!(list.pop_back().await.unwrap().value, Variant::from("c"));
    assert_eq!(list.pop_back().await.unwrap().value, Variant::from("b"));

    assert!(list.pop_front().await.unwrap_err().is_protocol_error());
}

#[tokio::test]
async fn test_clear_empties_container() {
    let (_server, _connection, container) = map_fixture("data").await;
    for i in 0..10 {
        container.set(i, i).await.unwrap();
    }
    container.clear().await.unwrap();
    assert_eq!(container.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_property_is_property_not_found() {
    let (_server, _connection, container) = map_fixture("data").await;

    match container.get_property("schema").await.unwrap_err() {
        ClientError::PropertyNotFound(name) => assert_eq!(name, "schema"),
        other => panic!("expected PropertyNotFound, got {:?}", other),
    }

    container.set_property("schema", "key:string").await.unwrap();
    assert_eq!(container.get_property("schema").await.unwrap(), "key:string");
}

#[tokio::test]
async fn test_seeded_property_visible() {
    let (server, connection, _container) = map_fixture("data").await;
    server.seed("meta/containers", "volatile_map", []);
    server.set_property("meta/containers", "schema", "name:type");

    let meta = connection.open("meta/containers", "").await.unwrap();
    assert_eq!(meta.get_property("schema").await.unwrap(), "name:type");
}

#[tokio::test]
async fn test_close_releases_handle() {
    let (_server, _connection, container) = map_fixture("data").await;
    let copy = container.clone();
    container.close().await.unwrap();

    let err = copy.count().await.unwrap_err();
    assert_eq!(err.code(), Some(status::NO_SUCH_OBJECT));
}

#[tokio::test]
async fn test_concurrent_requests_on_one_connection() {
    let (_server, _connection, container) = map_fixture("data").await;
    let tasks = 8;
    let per_task = 25;
    let barrier = Arc::new(Barrier::new(tasks));

    let mut handles = Vec::new();
    for t in 0..tasks {
        let container = container.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for i in 0..per_task {
                let key = format!("t{}-{}", t, i);
                container.set(key.as_str(), (t * 1000 + i) as i64).await?;
                let record = container.get(key.as_str()).await?;
                assert_eq!(record.value, Variant::Int((t * 1000 + i) as i64));
            }
            Ok::<_, ClientError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(container.count().await.unwrap(), (tasks * per_task) as u64);
}

#[tokio::test]
async fn test_container_through_trait_object() {
    let (_server, _connection, container) = map_fixture("data").await;
    let dynamic: Arc<dyn DataContainer> = Arc::new(container.clone());

    dynamic
        .set(Variant::from("k"), Variant::Int(7), Variant::None)
        .await
        .unwrap();
    assert_eq!(dynamic.get(Variant::from("k")).await.unwrap(), Record::new("k", 7));
    assert_eq!(dynamic.count().await.unwrap(), 1);
    assert_eq!(dynamic.name(), "data");
}

#[tokio::test]
async fn test_cancelled_request_answer_is_discarded() {
    let (_server, connection, container) = map_fixture("data").await;
    container.set("a", 1).await.unwrap();
    container.set("b", 2).await.unwrap();

    for _ in 0..20 {
        let _ = tokio::time::timeout(
            std::time::Duration::from_micros(1),
            container.get("a"),
        )
        .await;
        assert_eq!(container.get("b").await.unwrap().value, Variant::Int(2));
    }
    assert!(connection.is_connected());
}
