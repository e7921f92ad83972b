//! Test utilities and mock implementations.
//!
//! [`MockServer`] is an in-process PR1 server on a loopback port, enough of
//! the tio command set to exercise the client end to end. [`MemoryContainer`]
//! implements [`DataContainer`] over a plain vector with optional per-item
//! delays and injected failures.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::protocol::{
    command, field, read_message, status, write_message, EventCode, Message, HANDSHAKE_ANSWER,
};
use crate::query::{Cookie, QueryRange, QuerySummary, Record};
use crate::traits::{DataContainer, ItemCallback};
use crate::variant::Variant;

// ============================================================================
// MockServer
// ============================================================================

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
struct Peer {
    conn: u64,
    handle: u32,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct MockContainer {
    kind: String,
    items: Vec<Record>,
    properties: HashMap<String, String>,
    subscribers: Vec<Peer>,
    waiters: VecDeque<Peer>,
}

impl MockContainer {
    fn broadcast(&mut self, code: EventCode, record: &Record) {
        self.subscribers.retain(|peer| {
            peer.tx
                .send(event_message(peer.handle, code, record))
                .is_ok()
        });
    }

    /// Hand a new item to a pending wait-and-pop instead of storing it.
    fn offer(&mut self, record: &Record) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            let event = event_message(waiter.handle, EventCode::WaitAndPopNext, record);
            if waiter.tx.send(event).is_ok() {
                return true;
            }
        }
        false
    }

    fn position(&self, key: &Variant) -> Option<usize> {
        self.items.iter().position(|r| &r.key == key).or_else(|| {
            key.as_int()
                .and_then(|i| usize::try_from(i).ok())
                .filter(|i| *i < self.items.len())
        })
    }
}

#[derive(Default)]
struct ServerState {
    containers: Mutex<HashMap<String, MockContainer>>,
    connections: Mutex<Vec<AbortOnDrop>>,
    reject_handshake: AtomicBool,
    silent: AtomicBool,
    drop_query_after: Mutex<Option<usize>>,
    next_handle: AtomicU32,
    next_conn: AtomicU64,
    next_query: AtomicU64,
}

impl ServerState {
    fn containers(&self) -> MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn answer() -> Message {
    Message::request(command::ANSWER)
}

fn error_answer(code: i32, description: &str) -> Message {
    answer()
        .with(field::ERROR_CODE, code)
        .with(field::ERROR_DESC, description)
}

fn record_answer(record: &Record) -> Message {
    answer()
        .with(field::KEY, record.key.clone())
        .with(field::VALUE, record.value.clone())
        .with(field::METADATA, record.metadata.clone())
}

fn event_message(handle: u32, code: EventCode, record: &Record) -> Message {
    Message::request(command::EVENT)
        .with(field::HANDLE, i64::from(handle))
        .with(field::EVENT, code.code())
        .with(field::KEY, record.key.clone())
        .with(field::VALUE, record.value.clone())
        .with(field::METADATA, record.metadata.clone())
}

fn request_record(request: &Message) -> Record {
    Record {
        key: request.variant(field::KEY),
        value: request.variant(field::VALUE),
        metadata: request.variant(field::METADATA),
    }
}

/// In-process PR1 server for tests.
///
/// Query expressions are matched as key substrings.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _accept: AbortOnDrop,
}

impl MockServer {
    /// Bind a loopback port and start accepting connections.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = tokio::spawn(serve(stream, Arc::clone(&accept_state)));
                accept_state
                    .connections
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(AbortOnDrop(conn));
            }
        });

        Ok(Self {
            addr,
            state,
            _accept: AbortOnDrop(accept),
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Create (or replace) a container with the given items.
    pub fn seed(&self, name: &str, kind: &str, items: impl IntoIterator<Item = Record>) {
        self.state.containers().insert(
            name.to_string(),
            MockContainer {
                kind: kind.to_string(),
                items: items.into_iter().collect(),
                ..MockContainer::default()
            },
        );
    }

    pub fn set_property(&self, container: &str, name: &str, value: &str) {
        if let Some(c) = self.state.containers().get_mut(container) {
            c.properties.insert(name.to_string(), value.to_string());
        }
    }

    /// Current items of a container.
    pub fn items(&self, container: &str) -> Vec<Record> {
        self.state
            .containers()
            .get(container)
            .map(|c| c.items.clone())
            .unwrap_or_default()
    }

    /// Handshake answers with garbage instead of switching to PR1.
    pub fn reject_handshakes(&self, reject: bool) {
        self.state.reject_handshake.store(reject, Ordering::Release);
    }

    /// Read requests but never answer them.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::Release);
    }

    /// Close the connection after sending `n` items of the next query.
    pub fn drop_query_after(&self, n: usize) {
        *self
            .state
            .drop_query_after
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(n);
    }

    /// Close every client connection.
    pub fn disconnect_all(&self) {
        self.state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
    }
    if state.reject_handshake.load(Ordering::Acquire) {
        let _ = write_half.write_all(b"error unknown protocol\r\n").await;
        return;
    }
    if write_half
        .write_all(format!("{}\r\n", HANDSHAKE_ANSWER).as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut writer = AbortOnDrop(tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write_message(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    }));

    let mut session = PeerSession {
        conn: state.next_conn.fetch_add(1, Ordering::AcqRel),
        tx,
        handles: HashMap::new(),
        state: Arc::clone(&state),
    };

    while let Ok(request) = read_message(&mut reader).await {
        if state.silent.load(Ordering::Acquire) {
            continue;
        }
        if !session.handle(request) {
            break;
        }
    }

    session.release();
    debug!(conn = session.conn, "mock connection closed");

    // flush what was queued before the socket goes away
    drop(session);
    let _ = (&mut writer.0).await;
}

/// Server side of one client connection.
struct PeerSession {
    conn: u64,
    tx: mpsc::UnboundedSender<Message>,
    handles: HashMap<u32, String>,
    state: Arc<ServerState>,
}

impl PeerSession {
    fn send(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    fn peer(&self, handle: u32) -> Peer {
        Peer {
            conn: self.conn,
            handle,
            tx: self.tx.clone(),
        }
    }

    fn release(&self) {
        let mut containers = self.state.containers();
        for c in containers.values_mut() {
            c.subscribers.retain(|p| p.conn != self.conn);
            c.waiters.retain(|p| p.conn != self.conn);
        }
    }

    /// Returns false when the connection should be closed.
    fn handle(&mut self, request: Message) -> bool {
        let Some(code) = request.command() else {
            self.send(error_answer(status::PROTOCOL, "missing command"));
            return true;
        };

        match code {
            command::PROPGET | command::PROPSET => {
                self.with_container(&request, |_, c| {
                    let name = request.variant(field::KEY).to_string();
                    if code == command::PROPSET {
                        c.properties
                            .insert(name, request.variant(field::VALUE).to_string());
                        return vec![answer()];
                    }
                    match c.properties.get(&name) {
                        Some(value) => vec![answer().with(field::VALUE, value.as_str())],
                        None => vec![error_answer(status::NO_SUCH_OBJECT, "no such property")],
                    }
                });
                true
            }
            _ => match EventCode::try_from(code) {
                Ok(EventCode::Query) => self.query(&request),
                Ok(event) => {
                    self.command(event, &request);
                    true
                }
                Err(_) => {
                    self.send(error_answer(status::PROTOCOL, "unknown command"));
                    true
                }
            },
        }
    }

    fn with_container<F>(&self, request: &Message, f: F)
    where
        F: FnOnce(u32, &mut MockContainer) -> Vec<Message>,
    {
        let handle = request.int(field::HANDLE).unwrap_or(-1) as u32;
        let replies = match self.handles.get(&handle) {
            None => vec![error_answer(status::NO_SUCH_OBJECT, "invalid handle")],
            Some(name) => match self.state.containers().get_mut(name) {
                Some(c) => f(handle, c),
                None => vec![error_answer(status::NO_SUCH_OBJECT, "container removed")],
            },
        };
        for reply in replies {
            self.send(reply);
        }
    }

    fn open(&mut self, request: &Message, create: bool) {
        let name = request.variant(field::NAME).to_string();
        let kind = request.variant(field::TYPE).to_string();

        let reported = {
            let mut containers = self.state.containers();
            if create {
                let c = containers.entry(name.clone()).or_default();
                if c.kind.is_empty() {
                    c.kind = kind;
                }
                Some(c.kind.clone())
            } else {
                containers.get(&name).map(|c| c.kind.clone())
            }
        };

        match reported {
            Some(kind) => {
                let handle = self.state.next_handle.fetch_add(1, Ordering::AcqRel) + 1;
                self.handles.insert(handle, name);
                self.send(
                    answer()
                        .with(field::HANDLE, i64::from(handle))
                        .with(field::TYPE, kind),
                );
            }
            None => self.send(error_answer(status::NO_SUCH_OBJECT, "no such container")),
        }
    }

    fn command(&mut self, event: EventCode, request: &Message) {
        match event {
            EventCode::Ping => self.send(answer().with(field::VALUE, request.variant(field::VALUE))),
            EventCode::Open => self.open(request, false),
            EventCode::Create => self.open(request, true),
            EventCode::Close => {
                let handle = request.int(field::HANDLE).unwrap_or(-1) as u32;
                let conn = self.conn;
                self.with_container(request, |_, c| {
                    c.subscribers.retain(|p| !(p.conn == conn && p.handle == handle));
                    vec![answer()]
                });
                self.handles.remove(&handle);
            }
            EventCode::Subscribe => {
                // A start cookie replays existing items before live events.
                let start = request.int(field::KEY);
                let peer = self.peer(request.int(field::HANDLE).unwrap_or(-1) as u32);
                self.with_container(request, |handle, c| {
                    c.subscribers.push(peer);
                    let mut replies = vec![answer()];
                    if let Some(start) = start {
                        let start = usize::try_from(start).unwrap_or(0);
                        for record in c.items.iter().skip(start) {
                            replies.push(event_message(handle, EventCode::Set, record));
                        }
                    }
                    replies
                });
            }
            EventCode::Unsubscribe => {
                let conn = self.conn;
                self.with_container(request, |handle, c| {
                    c.subscribers.retain(|p| !(p.conn == conn && p.handle == handle));
                    vec![answer()]
                });
            }
            EventCode::WaitAndPopNext => {
                let handle = request.int(field::HANDLE).unwrap_or(-1) as u32;
                let peer = self.peer(handle);
                self.with_container(request, |handle, c| {
                    if c.items.is_empty() {
                        c.waiters.push_back(peer);
                        return vec![answer()];
                    }
                    let record = c.items.remove(0);
                    c.broadcast(EventCode::PopFront, &record);
                    vec![
                        answer(),
                        event_message(handle, EventCode::WaitAndPopNext, &record),
                    ]
                });
            }
            _ => self.with_container(request, |_, c| mutate(event, request, c)),
        }
    }

    /// Answer, items, terminator. Returns false if the connection was
    /// dropped mid-stream on request.
    fn query(&mut self, request: &Message) -> bool {
        let limit = self
            .state
            .drop_query_after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let query_id = self.state.next_query.fetch_add(1, Ordering::AcqRel) as i64 + 1;

        let mut keep_open = true;
        self.with_container(request, |_, c| {
            let len = c.items.len();
            let start = request
                .int(field::START_RECORD)
                .and_then(|s| usize::try_from(s).ok())
                .unwrap_or(0)
                .min(len);
            let end = match request.int(field::END) {
                Some(e) if e > 0 => (e as usize).min(len),
                _ => len,
            };
            let expression = request
                .get(field::QUERY_EXPRESSION)
                .map(|v| v.to_string());

            let mut replies = vec![answer().with(field::QUERY_ID, query_id)];
            let matching = c.items[start..end.max(start)]
                .iter()
                .filter(|r| match &expression {
                    Some(expr) => r.key.to_string().contains(expr.as_str()),
                    None => true,
                });
            for (sent, record) in matching.enumerate() {
                if limit == Some(sent) {
                    keep_open = false;
                    return replies;
                }
                replies.push(
                    Message::request(command::QUERY_ITEM)
                        .with(field::QUERY_ID, query_id)
                        .with(field::KEY, record.key.clone())
                        .with(field::VALUE, record.value.clone())
                        .with(field::METADATA, record.metadata.clone()),
                );
            }
            replies.push(Message::request(command::QUERY_ITEM).with(field::QUERY_ID, query_id));
            replies
        });
        keep_open
    }
}

fn mutate(event: EventCode, request: &Message, c: &mut MockContainer) -> Vec<Message> {
    let record = request_record(request);
    match event {
        EventCode::Set | EventCode::Insert => {
            if c.offer(&record) {
                return vec![answer()];
            }
            match c.items.iter_mut().find(|r| r.key == record.key) {
                Some(existing) => *existing = record.clone(),
                None => c.items.push(record.clone()),
            }
            c.broadcast(event, &record);
            vec![answer()]
        }
        EventCode::PushBack | EventCode::PushFront => {
            let mut record = record;
            if c.offer(&record) {
                return vec![answer()];
            }
            if event == EventCode::PushBack {
                record.key = Variant::Int(c.items.len() as i64);
                c.items.push(record.clone());
            } else {
                record.key = Variant::Int(0);
                c.items.insert(0, record.clone());
            }
            c.broadcast(event, &record);
            vec![answer()]
        }
        EventCode::Delete => match c.position(&record.key) {
            Some(i) => {
                let removed = c.items.remove(i);
                c.broadcast(event, &removed);
                vec![answer()]
            }
            None => vec![error_answer(status::NO_SUCH_OBJECT, "key not found")],
        },
        EventCode::PopBack | EventCode::PopFront => {
            let popped = if event == EventCode::PopBack {
                c.items.pop()
            } else if c.items.is_empty() {
                None
            } else {
                Some(c.items.remove(0))
            };
            match popped {
                Some(record) => {
                    c.broadcast(event, &record);
                    vec![record_answer(&record)]
                }
                None => vec![error_answer(status::NO_SUCH_OBJECT, "container is empty")],
            }
        }
        EventCode::Clear => {
            c.items.clear();
            c.broadcast(event, &Record::default());
            vec![answer()]
        }
        EventCode::Count => vec![answer().with(field::VALUE, c.items.len() as i64)],
        EventCode::Get => match c.position(&record.key) {
            Some(i) => vec![record_answer(&c.items[i])],
            None => vec![error_answer(status::NO_SUCH_OBJECT, "key not found")],
        },
        _ => vec![error_answer(status::GENERIC, "unsupported command")],
    }
}

// ============================================================================
// MemoryContainer
// ============================================================================

type DelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// In-memory [`DataContainer`].
pub struct MemoryContainer {
    name: String,
    rows: Mutex<Vec<Record>>,
    properties: Mutex<HashMap<String, String>>,
    delay: Option<DelayFn>,
    fail_after: Option<usize>,
}

impl MemoryContainer {
    pub fn new(name: &str) -> Self {
        Self::with_rows(name, std::iter::empty())
    }

    pub fn with_rows(name: &str, rows: impl IntoIterator<Item = Record>) -> Self {
        Self {
            name: name.to_string(),
            rows: Mutex::new(rows.into_iter().collect()),
            properties: Mutex::new(HashMap::new()),
            delay: None,
            fail_after: None,
        }
    }

    /// Sleep this long before every delivered item.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delays(move |_| delay)
    }

    /// Per-item delay chosen by `delay(index)`.
    pub fn with_delays<F>(mut self, delay: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    /// Fail queries with `NotConnected` after `n` items.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_property(self, name: &str, value: &str) -> Self {
        self.properties()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn push(&self, record: Record) {
        self.rows().push(record);
    }

    fn rows(&self) -> MutexGuard<'_, Vec<Record>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn properties(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.properties.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DataContainer for MemoryContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: Variant) -> Result<Record> {
        self.rows()
            .iter()
            .find(|r| r.key == key)
            .cloned()
            .ok_or_else(|| ClientError::Protocol {
                code: status::NO_SUCH_OBJECT,
                description: "key not found".to_string(),
            })
    }

    async fn set(&self, key: Variant, value: Variant, metadata: Variant) -> Result<()> {
        let record = Record {
            key,
            value,
            metadata,
        };
        let mut rows = self.rows();
        match rows.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record,
            None => rows.push(record),
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows().len() as u64)
    }

    async fn get_property(&self, name: &str) -> Result<String> {
        self.properties()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::PropertyNotFound(name.to_string()))
    }

    async fn query(&self, range: QueryRange, on_item: ItemCallback<'_>) -> Result<QuerySummary> {
        let snapshot = self.rows().clone();
        let start = range
            .start
            .map(Cookie::value)
            .and_then(|s| usize::try_from(s).ok())
            .unwrap_or(0)
            .min(snapshot.len());
        let end = match range.end.map(Cookie::value) {
            Some(e) if e > 0 => (e as usize).min(snapshot.len()),
            _ => snapshot.len(),
        };

        let mut delivered = 0u64;
        for (index, record) in snapshot[start..end.max(start)].iter().enumerate() {
            if let Some(expr) = &range.expression {
                if !record.key.to_string().contains(expr.as_str()) {
                    continue;
                }
            }
            if self.fail_after == Some(delivered as usize) {
                return Err(ClientError::NotConnected);
            }
            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(index)).await;
            }

            delivered += 1;
            if on_item(record.clone()).is_break() {
                return Ok(QuerySummary {
                    query_id: 0,
                    delivered,
                    next: Some(Cookie((start as u64 + delivered) as i64)),
                    completed: false,
                });
            }
        }

        Ok(QuerySummary {
            query_id: 0,
            delivered,
            next: None,
            completed: true,
        })
    }
}
