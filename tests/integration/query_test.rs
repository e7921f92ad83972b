//! Streaming query integration tests.

#[path = "../common/mod.rs"]
mod common;

use common::{connect, numbered, start_server};
use std::ops::ControlFlow;
use tio_client::{Cookie, QueryRange, Record, Variant};

#[tokio::test]
async fn test_query_visits_every_item_in_order() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(100));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let mut seen = Vec::new();
    let summary = container
        .query(QueryRange::all(), |record| seen.push(record))
        .await
        .unwrap();

    assert_eq!(seen, numbered(100));
    assert_eq!(summary.delivered, 100);
    assert!(summary.completed);
    assert!(summary.next.is_none());
}

#[tokio::test]
async fn test_query_order_is_stable() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(20));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let first = container.query_all(QueryRange::all()).await.unwrap();
    let second = container.query_all(QueryRange::all()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_query_empty_container() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection.open("empty", "volatile_map").await.unwrap();

    let mut calls = 0;
    let summary = container
        .query(QueryRange::all(), |_| calls += 1)
        .await
        .unwrap();
    assert_eq!(calls, 0);
    assert!(summary.completed);
}

#[tokio::test]
async fn test_query_range_bounds() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(10));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let middle = container
        .query_all(QueryRange::all().start_at(3).end_at(6))
        .await
        .unwrap();
    assert_eq!(middle, numbered(10)[3..6].to_vec());

    let tail = container
        .query_all(QueryRange::all().start_at(8))
        .await
        .unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
async fn test_query_expression_filters_on_server() {
    let server = start_server().await;
    server.seed(
        "meta/containers",
        "volatile_map",
        [
            Record::new("orders", "hash"),
            Record::new("users", "hash"),
            Record::new("order_lines", "list"),
        ],
    );
    let connection = connect(&server).await;
    let container = connection.open("meta/containers", "").await.unwrap();

    let keys: Vec<Variant> = container
        .query_all(QueryRange::all().matching("order"))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec![Variant::from("orders"), Variant::from("order_lines")]);
}

#[tokio::test]
async fn test_break_returns_early_and_connection_stays_usable() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(500));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let mut seen = 0;
    let summary = container
        .query_until(QueryRange::all().start_at(10), |_| {
            seen += 1;
            if seen == 5 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();

    assert_eq!(seen, 5);
    assert_eq!(summary.delivered, 5);
    assert!(!summary.completed);
    assert_eq!(summary.next, Some(Cookie(15)));

    // the rest of the stream is drained before the next request runs
    assert_eq!(container.count().await.unwrap(), 500);
    let resumed = container
        .query_all(QueryRange::all().start_at(summary.next.unwrap()).end_at(17))
        .await
        .unwrap();
    assert_eq!(resumed, numbered(500)[15..17].to_vec());
}

#[tokio::test]
async fn test_mid_stream_failure_keeps_delivered_items() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(50));
    server.drop_query_after(3);
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let mut seen = Vec::new();
    let err = container
        .query(QueryRange::all(), |record| seen.push(record))
        .await
        .unwrap_err();

    assert!(err.is_not_connected() || err.is_connection_error(), "got {:?}", err);
    assert_eq!(seen, numbered(50)[..3].to_vec());
}

#[tokio::test]
async fn test_query_on_missing_handle_fails() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection.open("items", "volatile_map").await.unwrap();
    container.clone().close().await.unwrap();

    let err = container.query_all(QueryRange::all()).await.unwrap_err();
    assert!(err.is_protocol_error());
}

#[tokio::test]
async fn test_cancelled_query_does_not_leak_into_next_request() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(2000));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    // usually fires mid-stream; either way the next answer must be its own
    let _ = tokio::time::timeout(
        std::time::Duration::from_micros(1),
        container.query_all(QueryRange::all()),
    )
    .await;

    let record = container.get("key-005").await.unwrap();
    assert_eq!(record.key, Variant::from("key-005"));
    assert_eq!(record.value, Variant::Int(5));
    assert!(connection.is_connected());
    assert_eq!(container.count().await.unwrap(), 2000);
}

#[tokio::test]
async fn test_dropped_query_task_keeps_answers_paired() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(500));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let task = {
        let container = container.clone();
        tokio::spawn(async move { container.query_all(QueryRange::all()).await })
    };
    tokio::task::yield_now().await;
    task.abort();
    let _ = task.await;

    for i in [0i64, 250, 499] {
        let key = format!("key-{:03}", i);
        assert_eq!(container.get(key.as_str()).await.unwrap().value, Variant::Int(i));
    }
}
