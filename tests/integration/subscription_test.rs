//! Subscription and wait-and-pop integration tests.

#[path = "../common/mod.rs"]
mod common;

use common::{connect, eventually, map_fixture, numbered, start_server, WAIT};
use tio_client::{Cookie, Event, EventCode, Variant};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn forwarder() -> (
    impl FnMut(Event) + Send + 'static,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

#[tokio::test]
async fn test_subscriber_sees_other_clients_writes() {
    let (server, _connection, container) = map_fixture("data").await;
    let (on_event, mut events) = forwarder();
    let subscription = container.subscribe(None, on_event).await.unwrap();
    assert!(subscription.is_active());

    let writer = connect(&server).await;
    let other = writer.open("data", "volatile_map").await.unwrap();
    other.set("k2", "v2").await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.code, EventCode::Set);
    assert_eq!(event.key, Variant::from("k2"));
    assert_eq!(event.value, Variant::from("v2"));

    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_events_arrive_in_server_order() {
    let (server, _connection, container) = map_fixture("data").await;
    let (on_event, mut events) = forwarder();
    let _subscription = container.subscribe(None, on_event).await.unwrap();

    let writer = connect(&server).await;
    let other = writer.open("data", "volatile_map").await.unwrap();
    for i in 0..50 {
        other.set(format!("k{}", i), i).await.unwrap();
    }
    other.delete("k0").await.unwrap();

    for i in 0..50 {
        let event = next_event(&mut events).await;
        assert_eq!(event.key, Variant::from(format!("k{}", i)));
        assert_eq!(event.value, Variant::Int(i));
    }
    assert_eq!(next_event(&mut events).await.code, EventCode::Delete);
}

#[tokio::test]
async fn test_start_cookie_replays_existing_items() {
    let server = start_server().await;
    server.seed("items", "volatile_map", numbered(5));
    let connection = connect(&server).await;
    let container = connection.open("items", "").await.unwrap();

    let (on_event, mut events) = forwarder();
    let _subscription = container
        .subscribe(Some(Cookie(2)), on_event)
        .await
        .unwrap();

    for record in &numbered(5)[2..] {
        let event = next_event(&mut events).await;
        assert_eq!(event.code, EventCode::Set);
        assert_eq!(event.key, record.key);
    }

    container.set("live", 1).await.unwrap();
    assert_eq!(next_event(&mut events).await.key, Variant::from("live"));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_server, _connection, container) = map_fixture("data").await;
    let (on_event, mut events) = forwarder();
    let subscription = container.subscribe(None, on_event).await.unwrap();

    container.set("before", 1).await.unwrap();
    assert_eq!(next_event(&mut events).await.key, Variant::from("before"));

    subscription.unsubscribe().await.unwrap();
    container.set("after", 2).await.unwrap();

    // the callback was dropped with the delivery thread
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subscription_ends_when_server_hangs_up() {
    let (server, _connection, container) = map_fixture("data").await;
    let (on_event, _events) = forwarder();
    let subscription = container.subscribe(None, on_event).await.unwrap();

    server.disconnect_all();

    assert!(eventually(|| !subscription.is_active()).await);
    // nothing left to tell the server
    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_wait_and_pop_takes_available_item() {
    let server = start_server().await;
    server.seed(
        "queue",
        "volatile_list",
        [tio_client::Record::new(0, "job-1"), tio_client::Record::new(1, "job-2")],
    );
    let connection = connect(&server).await;
    let queue = connection.open("queue", "").await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue
        .wait_and_pop_next(move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let event = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(event.code, EventCode::WaitAndPopNext);
    assert_eq!(event.value, Variant::from("job-1"));
    assert_eq!(queue.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_wait_and_pop_waits_for_next_push() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let queue = connection.open("queue", "volatile_list").await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue
        .wait_and_pop_next(move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let producer = connect(&server).await;
    producer
        .open("queue", "")
        .await
        .unwrap()
        .push_back("job", ())
        .await
        .unwrap();

    let event = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(event.value, Variant::from("job"));
    // handed to the waiter, never stored
    assert_eq!(queue.count().await.unwrap(), 0);
}
