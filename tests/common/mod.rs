//! Shared utilities for integration tests.
//!
//! Every test gets its own in-process server on a loopback port.

#![allow(dead_code)]

use std::time::Duration;

use tio_client::config::ConnectionConfig;
use tio_client::test_utils::MockServer;
use tio_client::{Connection, Container, Record};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_server() -> MockServer {
    tio_client::utils::bootstrap::try_init_tracing();
    MockServer::start().await.expect("mock server failed to start")
}

pub async fn connect(server: &MockServer) -> Connection {
    Connection::connect(&server.host(), server.port())
        .await
        .expect("connect to mock server")
}

/// Connection with a short request timeout.
pub async fn connect_impatient(server: &MockServer, timeout_ms: u64) -> Connection {
    let config = ConnectionConfig {
        request_timeout_ms: timeout_ms,
        ..ConnectionConfig::new(server.host(), server.port())
    };
    Connection::connect_with(&config)
        .await
        .expect("connect to mock server")
}

/// Server plus a connection with a fresh map container.
pub async fn map_fixture(name: &str) -> (MockServer, Connection, Container) {
    let server = start_server().await;
    let connection = connect(&server).await;
    let container = connection
        .open(name, "volatile_map")
        .await
        .expect("create container");
    (server, connection, container)
}

/// `count` items keyed `key-000`, `key-001`, ... with integer values.
pub fn numbered(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record::new(format!("key-{:03}", i), i as i64))
        .collect()
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
