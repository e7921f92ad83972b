//! Streaming bulk query.
//!
//! A QUERY request is answered with a query id, then one QUERY_ITEM frame per
//! record in the remote order, then a QUERY_ITEM without a key marking
//! exhaustion. The caller's callback runs inline for every item before the
//! query returns.

use std::fmt;
use std::ops::ControlFlow;

use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::protocol::{field, Message};
use crate::session::{Exchange, Session};
use crate::variant::Variant;

/// Position within a container's enumeration. Zero means "start" (or "end"
/// when used as the upper bound).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(pub i64);

impl Cookie {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Cookie {
    fn from(value: i64) -> Self {
        Cookie(value)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounds of a query: `[start, end)`, both optional, plus an optional
/// server-side key expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRange {
    pub start: Option<Cookie>,
    pub end: Option<Cookie>,
    pub expression: Option<String>,
}

impl QueryRange {
    /// Whole container.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn start_at(mut self, start: impl Into<Cookie>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn end_at(mut self, end: impl Into<Cookie>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn matching(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Append START_RECORD, END and QUERY_EXPRESSION to a request.
    pub(crate) fn apply(&self, request: Message) -> Message {
        let request = request
            .with(field::START_RECORD, self.start.map(Cookie::value).unwrap_or(0))
            .with(field::END, self.end.map(Cookie::value).unwrap_or(0));
        match &self.expression {
            Some(expression) => request.with(field::QUERY_EXPRESSION, expression.as_str()),
            None => request,
        }
    }
}

/// A key/value/metadata triple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub key: Variant,
    pub value: Variant,
    pub metadata: Variant,
}

impl Record {
    pub fn new(key: impl Into<Variant>, value: impl Into<Variant>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: Variant::None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Variant>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub(crate) fn from_message(message: &Message) -> Self {
        Self {
            key: message.variant(field::KEY),
            value: message.variant(field::VALUE),
            metadata: message.variant(field::METADATA),
        }
    }
}

/// Outcome of a completed or stopped query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySummary {
    pub query_id: i64,
    /// Items handed to the callback.
    pub delivered: u64,
    /// Where to resume when the callback stopped early.
    pub next: Option<Cookie>,
    /// The server signalled exhaustion before the callback stopped.
    pub completed: bool,
}

/// Run one query over `session`, feeding `on_item` until exhaustion or
/// `Break`.
pub(crate) async fn run(
    session: &Session,
    request: Message,
    range: &QueryRange,
    on_item: &mut (dyn FnMut(Record) -> ControlFlow<()> + Send),
) -> Result<QuerySummary> {
    let mut exchange = session.send(range.apply(request)).await?;
    let answer = exchange.first().await?;
    answer.check_status()?;

    let Some(query_id) = answer.int(field::QUERY_ID) else {
        exchange.abandon();
        return Err(ClientError::protocol("query answer without query id"));
    };

    let mut delivered = 0u64;
    while let Some(item) = exchange.next_item().await? {
        delivered += 1;
        if on_item(Record::from_message(&item)).is_break() {
            tokio::spawn(drain(exchange, query_id));
            let start = range.start.map(Cookie::value).unwrap_or(0);
            return Ok(QuerySummary {
                query_id,
                delivered,
                next: Some(Cookie(start + delivered as i64)),
                completed: false,
            });
        }
    }

    debug!(query_id, delivered, "query exhausted");
    Ok(QuerySummary {
        query_id,
        delivered,
        next: None,
        completed: true,
    })
}

/// Consume the rest of a stopped query so the channel is free for the next
/// request.
async fn drain(exchange: Exchange, query_id: i64) {
    match exchange.discard().await {
        Ok(skipped) => debug!(query_id, skipped, "query drained"),
        Err(e) => warn!(query_id, error = %e, "query drain ended"),
    }
}
