//! Connection lifecycle integration tests.

#[path = "../common/mod.rs"]
mod common;

use common::{connect, connect_impatient, eventually, start_server};
use std::time::Duration;
use tio_client::config::ConnectionConfig;
use tio_client::protocol::status;
use tio_client::{ClientError, Connection, ConnectionState};

#[tokio::test]
async fn test_connect_and_ping() {
    let server = start_server().await;
    let connection = connect(&server).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.port(), server.port());
    assert_eq!(
        connection.endpoint(),
        format!("{}:{}", server.host(), server.port())
    );
    connection.ping("hello").await.unwrap();
}

#[tokio::test]
async fn test_open_after_disconnect_fails_not_connected() {
    let server = start_server().await;
    server.seed("data", "volatile_map", []);
    let connection = connect(&server).await;

    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let err = connection.open("data", "").await.unwrap_err();
    assert!(err.is_not_connected(), "got {:?}", err);

    // idempotent
    connection.disconnect().await;
    assert!(connection.ping("again").await.unwrap_err().is_not_connected());
}

#[tokio::test]
async fn test_containers_fail_after_disconnect() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection.open("data", "volatile_map").await.unwrap();
    container.set("k", 1).await.unwrap();

    connection.disconnect().await;

    assert!(container.get("k").await.unwrap_err().is_not_connected());
    assert!(container.count().await.unwrap_err().is_not_connected());
}

#[tokio::test]
async fn test_close_is_best_effort() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection.open("data", "volatile_map").await.unwrap();

    connection.close();
    connection.close();

    assert!(!connection.is_connected());
    assert!(container.set("k", 1).await.unwrap_err().is_not_connected());
}

#[tokio::test]
async fn test_dropping_connection_invalidates_containers() {
    let server = start_server().await;
    let container = {
        let connection = connect(&server).await;
        connection.open("data", "volatile_map").await.unwrap()
    };
    assert!(container.count().await.unwrap_err().is_not_connected());
}

#[tokio::test]
async fn test_open_missing_container_is_open_error() {
    let server = start_server().await;
    let connection = connect(&server).await;

    match connection.open("missing", "").await.unwrap_err() {
        ClientError::Open { name, code, .. } => {
            assert_eq!(name, "missing");
            assert_eq!(code, status::NO_SUCH_OBJECT);
        }
        other => panic!("expected Open error, got {:?}", other),
    }
    // the connection survives a rejected open
    connection.ping("still here").await.unwrap();
}

#[tokio::test]
async fn test_typed_open_creates_then_plain_open_finds() {
    let server = start_server().await;
    let connection = connect(&server).await;

    let created = connection.create("orders", "volatile_list").await.unwrap();
    assert_eq!(created.kind(), "volatile_list");

    let reopened = connection.open("orders", "").await.unwrap();
    assert_eq!(reopened.kind(), "volatile_list");
    assert_eq!(reopened.name(), "orders");
}

#[tokio::test]
async fn test_create_requires_type() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let err = connection.create("orders", "").await.unwrap_err();
    assert_eq!(err.code(), Some(status::MISSING_PARAMETER));
}

#[tokio::test]
async fn test_rejected_handshake_is_connect_error() {
    let server = start_server().await;
    server.reject_handshakes(true);

    let config = ConnectionConfig {
        connect_retries: 3,
        ..ConnectionConfig::new(server.host(), server.port())
    };
    let started = std::time::Instant::now();
    let err = Connection::connect_with(&config).await.unwrap_err();

    match &err {
        ClientError::Connect { reason, .. } => assert!(reason.starts_with("handshake")),
        other => panic!("expected Connect error, got {:?}", other),
    }
    // protocol rejections are not retried
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_refused_connect_retries_then_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ConnectionConfig {
        connect_retries: 2,
        ..ConnectionConfig::new("127.0.0.1", port)
    };
    let started = std::time::Instant::now();
    let err = Connection::connect_with(&config).await.unwrap_err();

    assert!(matches!(err, ClientError::Connect { .. }));
    // two backoff sleeps of at least 100ms each
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_server_hangup_moves_to_disconnected() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection.open("data", "volatile_map").await.unwrap();

    server.disconnect_all();

    assert!(eventually(|| !connection.is_connected()).await);
    assert!(container.count().await.unwrap_err().is_not_connected());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let server = start_server().await;
    let connection = connect_impatient(&server, 200).await;
    let container = connection.open("data", "volatile_map").await.unwrap();

    server.set_silent(true);
    let err = container.count().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "got {:?}", err);

    // a late answer could no longer be matched to its request
    assert!(!connection.is_connected());
}
