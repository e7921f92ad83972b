//! Transport session: one TCP stream speaking PR1.
//!
//! A reader task owns the read half and splits incoming frames in two:
//! EVENT frames are routed by container handle to subscribers and
//! wait-and-pop waiters; everything else (answers and query items) lands in
//! an inbox consumed in request order by whoever holds the channel lock.
//! Requests are serialized through that lock so answers can never be paired
//! with the wrong request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::protocol::{
    command, field, read_message, write_message, EventCode, Message, HANDSHAKE_ANSWER,
    HANDSHAKE_REQUEST,
};
use crate::subscription::Event;
use crate::variant::Variant;

/// Connection-level timeouts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
}

/// Writer half plus the inbox of non-event frames.
struct Channel {
    writer: OwnedWriteHalf,
    inbox: mpsc::UnboundedReceiver<Message>,
}

/// Event destinations registered for one container handle.
#[derive(Default)]
struct Route {
    subscriber: Option<mpsc::UnboundedSender<Event>>,
    waiters: VecDeque<oneshot::Sender<Event>>,
}

/// State shared with the reader task.
struct Shared {
    connected: AtomicBool,
    routes: Mutex<HashMap<u32, Route>>,
}

impl Shared {
    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, message: &Message) {
        let event = match Event::from_message(message) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed event");
                return;
            }
        };
        let Some(handle) = message.int(field::HANDLE) else {
            warn!(code = %event.code, "dropping event without handle");
            return;
        };
        let handle = handle as u32;

        let mut routes = self.routes();
        let Some(route) = routes.get_mut(&handle) else {
            debug!(handle, code = %event.code, "event for unrouted handle");
            return;
        };

        if matches!(
            event.code,
            EventCode::WaitAndPopNext | EventCode::WaitAndPopKey
        ) {
            if let Some(waiter) = route.waiters.pop_front() {
                let _ = waiter.send(event);
                return;
            }
        }

        match &route.subscriber {
            Some(tx) => {
                if tx.send(event).is_err() {
                    route.subscriber = None;
                }
            }
            None => debug!(handle, code = %event.code, "event without subscriber"),
        }
    }

    /// Drop every route; subscribers observe the closed channel and stop.
    fn close_routes(&self) {
        self.routes().clear();
    }
}

pub(crate) struct Session {
    endpoint: String,
    timeouts: Timeouts,
    shared: Arc<Shared>,
    channel: Arc<tokio::sync::Mutex<Option<Channel>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open the TCP stream, switch it to PR1 and start the reader task.
    pub async fn connect(host: &str, port: u16, timeouts: Timeouts) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let connect_error = |reason: String| ClientError::Connect {
            endpoint: endpoint.clone(),
            reason,
        };

        let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect((host, port)))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", timeouts.connect)))?
            .map_err(|e| connect_error(e.to_string()))?;
        stream.set_nodelay(true)?;

        let (read_half, mut writer) = stream.into_split();
        writer.write_all(HANDSHAKE_REQUEST).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let read = tokio::time::timeout(timeouts.connect, reader.read_line(&mut line))
            .await
            .map_err(|_| connect_error("handshake timed out".to_string()))??;
        if read == 0 {
            return Err(connect_error("handshake failed: connection closed".to_string()));
        }
        if !line.starts_with(HANDSHAKE_ANSWER) {
            return Err(connect_error(format!(
                "handshake rejected: {:?}",
                line.trim_end()
            )));
        }

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
        });
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            reader,
            inbox_tx,
            Arc::clone(&shared),
            endpoint.clone(),
        ));

        info!(endpoint = %endpoint, "connected");

        Ok(Self {
            endpoint,
            timeouts,
            shared,
            channel: Arc::new(tokio::sync::Mutex::new(Some(Channel { writer, inbox }))),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Send a request and return its answer without interpreting the status.
    pub async fn call(&self, request: Message) -> Result<Message> {
        let mut stream = self.send(request).await?;
        stream.first().await
    }

    /// Send a request and fail on a negative status.
    pub async fn request(&self, request: Message) -> Result<Message> {
        let answer = self.call(request).await?;
        answer.check_status()?;
        Ok(answer)
    }

    /// Send a request and keep exclusive use of the channel for the frames
    /// that follow it.
    pub async fn send(&self, request: Message) -> Result<Exchange> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let guard = Arc::clone(&self.channel).lock_owned().await;
        if guard.is_none() || !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        debug!(
            endpoint = %self.endpoint,
            command = request.command().unwrap_or_default(),
            "request"
        );
        let mut exchange = Exchange {
            guard: Some(guard),
            shared: Arc::clone(&self.shared),
            timeout: self.timeouts.request,
            pending: Pending::Unsent,
            draining: false,
        };
        exchange.write(&request).await?;
        Ok(exchange)
    }

    pub fn add_subscriber(&self, handle: u32) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.routes().entry(handle).or_default().subscriber = Some(tx);
        rx
    }

    pub fn remove_subscriber(&self, handle: u32) {
        let mut routes = self.shared.routes();
        if let Some(route) = routes.get_mut(&handle) {
            route.subscriber = None;
            if route.waiters.is_empty() {
                routes.remove(&handle);
            }
        }
    }

    pub fn add_waiter(&self, handle: u32) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .routes()
            .entry(handle)
            .or_default()
            .waiters
            .push_back(tx);
        rx
    }

    /// Withdraw the most recently added waiter after its request failed.
    pub fn cancel_waiter(&self, handle: u32) {
        if let Some(route) = self.shared.routes().get_mut(&handle) {
            route.waiters.pop_back();
        }
    }

    /// Forget every route for a handle (container closed).
    pub fn remove_routes(&self, handle: u32) {
        self.shared.routes().remove(&handle);
    }

    fn mark_disconnected(&self) {
        self.shared.connected.store(false, Ordering::Release);
    }

    fn abort_reader(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    /// Graceful teardown: waits for the channel, then shuts the socket down.
    pub async fn shutdown(&self) {
        let was_connected = self.shared.connected.swap(false, Ordering::AcqRel);
        self.abort_reader();
        self.shared.close_routes();

        let channel = self.channel.lock().await.take();
        if let Some(mut channel) = channel {
            if let Err(e) = channel.writer.shutdown().await {
                debug!(endpoint = %self.endpoint, error = %e, "shutdown failed");
            }
        }
        if was_connected {
            info!(endpoint = %self.endpoint, "disconnected");
        }
    }

    /// Best-effort teardown without waiting on in-flight requests.
    pub fn close(&self) {
        self.mark_disconnected();
        self.abort_reader();
        self.shared.close_routes();
        if let Ok(mut channel) = self.channel.try_lock() {
            channel.take();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Frames the server still owes for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// The request may be partially written.
    Unsent,
    Answer,
    QueryAnswer,
    QueryItems,
    Done,
}

/// Exclusive use of the channel for one request and its follow-up frames.
///
/// Dropping an unfinished exchange (a cancelled caller) hands the owed
/// frames to a background task that discards them, so they are never read
/// as the answer to a later request.
pub(crate) struct Exchange {
    guard: Option<OwnedMutexGuard<Option<Channel>>>,
    shared: Arc<Shared>,
    timeout: Duration,
    pending: Pending,
    draining: bool,
}

impl Exchange {
    fn channel(&mut self) -> Result<&mut Channel> {
        self.guard
            .as_mut()
            .and_then(|guard| guard.as_mut())
            .ok_or(ClientError::NotConnected)
    }

    async fn write(&mut self, request: &Message) -> Result<()> {
        let channel = self.channel()?;
        let written = write_message(&mut channel.writer, request).await;
        if let Err(e) = written {
            self.teardown();
            return Err(e);
        }
        self.pending = if request.command() == Some(EventCode::Query.code()) {
            Pending::QueryAnswer
        } else {
            Pending::Answer
        };
        Ok(())
    }

    /// Next non-event frame.
    ///
    /// A timeout or a vanished reader leaves the stream out of step with the
    /// request order, so both disconnect the session.
    pub async fn next(&mut self) -> Result<Message> {
        let timeout = self.timeout;
        let channel = self.channel()?;
        let received = tokio::time::timeout(timeout, channel.inbox.recv()).await;
        match received {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                self.shared.connected.store(false, Ordering::Release);
                self.pending = Pending::Done;
                Err(ClientError::NotConnected)
            }
            Err(_) => {
                self.teardown();
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Disconnect the session and drop the channel.
    fn teardown(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.close_routes();
        if let Some(guard) = self.guard.as_mut() {
            guard.take();
        }
        self.pending = Pending::Done;
    }

    /// Give up on a stream that can no longer be parsed. Any frames still in
    /// flight would be misread as answers, so the session is torn down.
    pub fn abandon(mut self) {
        self.teardown();
    }

    /// The answer to the request; must be an ANSWER frame.
    pub async fn first(&mut self) -> Result<Message> {
        let answer = self.next().await?;
        if answer.command() != Some(command::ANSWER) {
            self.teardown();
            return Err(ClientError::protocol(format!(
                "expected answer, got command {:?}",
                answer.command()
            )));
        }
        self.pending = match self.pending {
            Pending::QueryAnswer if answer.status() >= 0 => Pending::QueryItems,
            _ => Pending::Done,
        };
        Ok(answer)
    }

    /// Next item of a query stream, `None` once the terminating item
    /// arrived.
    pub async fn next_item(&mut self) -> Result<Option<Message>> {
        let item = self.next().await?;
        if item.command() != Some(command::QUERY_ITEM) {
            self.teardown();
            return Err(ClientError::protocol(format!(
                "query interrupted by command {:?}",
                item.command()
            )));
        }
        if item.get(field::KEY).map_or(true, Variant::is_none) {
            self.pending = Pending::Done;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Read and drop every frame still owed. Returns how many query items
    /// were skipped.
    pub async fn discard(mut self) -> Result<u64> {
        let mut skipped = 0u64;
        loop {
            match self.pending {
                Pending::Done => return Ok(skipped),
                Pending::Unsent => {
                    self.teardown();
                    return Err(ClientError::NotConnected);
                }
                Pending::Answer | Pending::QueryAnswer => {
                    self.first().await?;
                }
                Pending::QueryItems => {
                    if self.next_item().await?.is_some() {
                        skipped += 1;
                    }
                }
            }
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.pending == Pending::Done {
            return;
        }
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut rest = Exchange {
            guard: Some(guard),
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
            pending: self.pending,
            draining: true,
        };
        if self.pending == Pending::Unsent || self.draining {
            warn!(pending = ?self.pending, "exchange cancelled mid-stream, disconnecting");
            rest.teardown();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(pending = ?self.pending, "exchange cancelled, discarding its frames");
                runtime.spawn(async move {
                    if let Err(e) = rest.discard().await {
                        debug!(error = %e, "discarding cancelled exchange failed");
                    }
                });
            }
            Err(_) => rest.teardown(),
        }
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    inbox: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    endpoint: String,
) {
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(ClientError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!(endpoint = %endpoint, "server closed the connection");
                break;
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "transport failure");
                break;
            }
        };

        match message.command() {
            Some(command::EVENT) => shared.dispatch(&message),
            Some(command::ANSWER) | Some(command::QUERY_ITEM) => {
                if inbox.send(message).is_err() {
                    break;
                }
            }
            other => warn!(endpoint = %endpoint, command = ?other, "dropping unknown frame"),
        }
    }

    shared.connected.store(false, Ordering::Release);
    shared.close_routes();
}
