//! Handle to one remote container.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::protocol::{field, EventCode, Message};
use crate::query::{self, Cookie, QueryRange, QuerySummary, Record};
use crate::session::Session;
use crate::subscription::{Event, Subscription};
use crate::traits::{DataContainer, ItemCallback};
use crate::variant::Variant;

/// A container opened on a [`Connection`](crate::Connection).
///
/// Cheap to clone; clones share the remote handle. Operations fail with
/// [`ClientError::NotConnected`] once the owning connection is gone.
#[derive(Clone)]
pub struct Container {
    session: Arc<Session>,
    handle: u32,
    name: String,
    kind: String,
}

impl Container {
    pub(crate) fn new(session: Arc<Session>, handle: u32, name: String, kind: String) -> Self {
        Self {
            session,
            handle,
            name,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container type reported by the server, if any.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub(crate) fn handle(&self) -> u32 {
        self.handle
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Request addressed to this container.
    pub(crate) fn message(&self, code: EventCode) -> Message {
        Message::request(code.code()).with(field::HANDLE, i64::from(self.handle))
    }

    pub(crate) async fn command(&self, request: Message) -> Result<Message> {
        self.session.request(request).await
    }

    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn get(&self, key: impl Into<Variant>) -> Result<Record> {
        let answer = self
            .command(self.message(EventCode::Get).with(field::KEY, key))
            .await?;
        Ok(Record::from_message(&answer))
    }

    /// Upsert without metadata.
    pub async fn set(&self, key: impl Into<Variant>, value: impl Into<Variant>) -> Result<()> {
        self.set_with_metadata(key, value, Variant::None).await
    }

    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn set_with_metadata(
        &self,
        key: impl Into<Variant>,
        value: impl Into<Variant>,
        metadata: impl Into<Variant>,
    ) -> Result<()> {
        self.keyed(EventCode::Set, key.into(), value.into(), metadata.into())
            .await
    }

    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn insert(
        &self,
        key: impl Into<Variant>,
        value: impl Into<Variant>,
        metadata: impl Into<Variant>,
    ) -> Result<()> {
        self.keyed(EventCode::Insert, key.into(), value.into(), metadata.into())
            .await
    }

    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn delete(&self, key: impl Into<Variant>) -> Result<()> {
        self.command(self.message(EventCode::Delete).with(field::KEY, key))
            .await
            .map(|_| ())
    }

    pub async fn push_back(
        &self,
        value: impl Into<Variant>,
        metadata: impl Into<Variant>,
    ) -> Result<()> {
        self.keyed(EventCode::PushBack, Variant::None, value.into(), metadata.into())
            .await
    }

    pub async fn push_front(
        &self,
        value: impl Into<Variant>,
        metadata: impl Into<Variant>,
    ) -> Result<()> {
        self.keyed(EventCode::PushFront, Variant::None, value.into(), metadata.into())
            .await
    }

    pub async fn pop_back(&self) -> Result<Record> {
        let answer = self.command(self.message(EventCode::PopBack)).await?;
        Ok(Record::from_message(&answer))
    }

    pub async fn pop_front(&self) -> Result<Record> {
        let answer = self.command(self.message(EventCode::PopFront)).await?;
        Ok(Record::from_message(&answer))
    }

    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn clear(&self) -> Result<()> {
        self.command(self.message(EventCode::Clear)).await.map(|_| ())
    }

    /// Item count. Not consistent with concurrent queries or subscriptions.
    pub async fn count(&self) -> Result<u64> {
        let answer = self.command(self.message(EventCode::Count)).await?;
        match answer.get(field::VALUE) {
            Some(Variant::Int(n)) if *n >= 0 => Ok(*n as u64),
            other => Err(ClientError::protocol(format!(
                "count answer carried {:?}",
                other
            ))),
        }
    }

    /// Read a named property. A missing property is
    /// [`ClientError::PropertyNotFound`], never an empty value.
    #[tracing::instrument(skip_all, fields(container = %self.name, property = name))]
    pub async fn get_property(&self, name: &str) -> Result<String> {
        let request = Message::request(crate::protocol::command::PROPGET)
            .with(field::HANDLE, i64::from(self.handle))
            .with(field::KEY, name);
        let answer = self.session.call(request).await?;
        if answer.status() < 0 {
            debug!(reason = %answer.error_description(), "property lookup failed");
            return Err(ClientError::PropertyNotFound(name.to_string()));
        }
        Ok(answer.variant(field::VALUE).to_string())
    }

    #[tracing::instrument(skip_all, fields(container = %self.name, property = name))]
    pub async fn set_property(&self, name: &str, value: impl Into<Variant>) -> Result<()> {
        let request = Message::request(crate::protocol::command::PROPSET)
            .with(field::HANDLE, i64::from(self.handle))
            .with(field::KEY, name)
            .with(field::VALUE, value);
        self.command(request).await.map(|_| ())
    }

    /// Stream every item in `range` through `on_item`, returning after the
    /// last one. Items delivered before a failure stay delivered.
    pub async fn query<F>(&self, range: QueryRange, mut on_item: F) -> Result<QuerySummary>
    where
        F: FnMut(Record) + Send,
    {
        self.query_until(range, |record| {
            on_item(record);
            ControlFlow::Continue(())
        })
        .await
    }

    /// Like [`Container::query`], but `Break` stops delivery and returns at
    /// once. The remainder of the stream is discarded in the background.
    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn query_until<F>(&self, range: QueryRange, mut on_item: F) -> Result<QuerySummary>
    where
        F: FnMut(Record) -> ControlFlow<()> + Send,
    {
        query::run(
            &self.session,
            self.message(EventCode::Query),
            &range,
            &mut on_item,
        )
        .await
    }

    /// Collect a whole range.
    pub async fn query_all(&self, range: QueryRange) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.query(range, |record| records.push(record)).await?;
        Ok(records)
    }

    /// Start a push feed of mutation events from `from` onward.
    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn subscribe<F>(&self, from: Option<Cookie>, on_event: F) -> Result<Subscription>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let events = self.session.add_subscriber(self.handle);
        let request = self
            .message(EventCode::Subscribe)
            .with(field::KEY, from.map(Cookie::value));
        if let Err(e) = self.command(request).await {
            self.session.remove_subscriber(self.handle);
            return Err(e);
        }
        Subscription::start(self.clone(), events, on_event)
    }

    /// Ask the server to pop the next item, now or when one arrives, and
    /// hand it to `on_item` once.
    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn wait_and_pop_next<F>(&self, on_item: F) -> Result<()>
    where
        F: FnOnce(Event) + Send + 'static,
    {
        let waiter = self.session.add_waiter(self.handle);
        if let Err(e) = self.command(self.message(EventCode::WaitAndPopNext)).await {
            self.session.cancel_waiter(self.handle);
            return Err(e);
        }

        std::thread::Builder::new()
            .name(format!("tio-pop-{}", self.name))
            .spawn(move || {
                if let Ok(event) = waiter.blocking_recv() {
                    on_item(event);
                }
            })?;
        Ok(())
    }

    /// Release the remote handle.
    #[tracing::instrument(skip_all, fields(container = %self.name))]
    pub async fn close(self) -> Result<()> {
        self.session.remove_routes(self.handle);
        self.command(self.message(EventCode::Close)).await.map(|_| ())
    }

    async fn keyed(
        &self,
        code: EventCode,
        key: Variant,
        value: Variant,
        metadata: Variant,
    ) -> Result<()> {
        let request = self
            .message(code)
            .with(field::KEY, key)
            .with(field::VALUE, value)
            .with(field::METADATA, metadata);
        self.command(request).await.map(|_| ())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("endpoint", &self.session.endpoint())
            .finish()
    }
}

#[async_trait]
impl DataContainer for Container {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: Variant) -> Result<Record> {
        Container::get(self, key).await
    }

    async fn set(&self, key: Variant, value: Variant, metadata: Variant) -> Result<()> {
        self.set_with_metadata(key, value, metadata).await
    }

    async fn count(&self) -> Result<u64> {
        Container::count(self).await
    }

    async fn get_property(&self, name: &str) -> Result<String> {
        Container::get_property(self, name).await
    }

    async fn query(&self, range: QueryRange, on_item: ItemCallback<'_>) -> Result<QuerySummary> {
        query::run(&self.session, self.message(EventCode::Query), &range, on_item).await
    }
}
