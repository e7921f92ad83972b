//! HTTP/JSON binding of the container operations.
//!
//! Every operation is one GET of `?command=<op>&container=<name>&...`.
//! Variant arguments travel as text; non-string values add a
//! `<field>_type=int|double` parameter. Answers are JSON objects whose
//! `result` is `"ok"` or `"error"` (with `description`).
//!
//! The binding caps a query at [`WEB_QUERY_LIMIT`] items and marks such
//! answers `query_type: "maybe_truncated"`; [`WebContainer`] pages through
//! the rest.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::WebConfig;
use crate::error::{ClientError, Result};
use crate::protocol::status;
use crate::query::{Cookie, QueryRange, QuerySummary, Record};
use crate::traits::{DataContainer, ItemCallback};
use crate::variant::Variant;

/// Most items one `query` answer carries.
pub const WEB_QUERY_LIMIT: usize = 10_000;

const MAYBE_TRUNCATED: &str = "maybe_truncated";

/// Raw JSON answer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebResponse {
    pub result: String,
    pub description: Option<String>,
    pub key: Option<Value>,
    pub value: Option<Value>,
    pub metadata: Option<Value>,
    pub count: Option<u64>,
    pub query_type: Option<String>,
    pub result_set: Option<Value>,
}

impl WebResponse {
    /// Fail with `Protocol` unless `result` is `"ok"`.
    pub fn check(self) -> Result<Self> {
        if self.result == "ok" {
            return Ok(self);
        }
        Err(ClientError::Protocol {
            code: status::GENERIC,
            description: self
                .description
                .unwrap_or_else(|| format!("result '{}'", self.result)),
        })
    }

    pub fn record(&self) -> Result<Record> {
        Ok(Record {
            key: json_field(&self.key)?,
            value: json_field(&self.value)?,
            metadata: json_field(&self.metadata)?,
        })
    }

    /// True when the binding capped the answer and more items may follow.
    pub fn maybe_truncated(&self) -> bool {
        self.query_type.as_deref() == Some(MAYBE_TRUNCATED)
    }

    /// Items of a `result_set`. Lists arrive as an array of records; maps as
    /// an object of records indexed by key, iterated in key order.
    pub fn result_set(&self) -> Result<Vec<Record>> {
        match &self.result_set {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item_record(item, None))
                .collect(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, item)| item_record(item, Some(key.as_str())))
                .collect(),
            Some(other) => Err(ClientError::protocol(format!(
                "unexpected result_set {}",
                other
            ))),
        }
    }
}

/// One `{key, value, metadata}` entry. Map entries fall back to their index
/// key when the object omits `key`.
fn item_record(item: &Value, index_key: Option<&str>) -> Result<Record> {
    let Value::Object(fields) = item else {
        return Err(ClientError::protocol(format!(
            "unexpected result_set item {}",
            item
        )));
    };
    let key = match (fields.get("key"), index_key) {
        (Some(key), _) => Variant::from_json(key)?,
        (None, Some(key)) => Variant::from(key),
        (None, None) => Variant::None,
    };
    Ok(Record {
        key,
        value: json_field(&fields.get("value").cloned())?,
        metadata: json_field(&fields.get("metadata").cloned())?,
    })
}

fn json_field(value: &Option<Value>) -> Result<Variant> {
    match value {
        Some(v) => Variant::from_json(v),
        None => Ok(Variant::None),
    }
}

/// Append `name` (and `name_type` for numbers) unless the variant is None.
fn push_variant(params: &mut Vec<(String, String)>, name: &str, value: &Variant) {
    let type_name = match value {
        Variant::None => return,
        Variant::Int(_) => Some("int"),
        Variant::Float(_) => Some("double"),
        Variant::String(_) => None,
    };
    params.push((name.to_string(), value.to_string()));
    if let Some(type_name) = type_name {
        params.push((format!("{}_type", name), type_name.to_string()));
    }
}

/// Query parameters for a data command.
pub fn data_params(command: &str, container: &str, record: &Record) -> Vec<(String, String)> {
    let mut params = vec![
        ("command".to_string(), command.to_string()),
        ("container".to_string(), container.to_string()),
    ];
    push_variant(&mut params, "key", &record.key);
    push_variant(&mut params, "value", &record.value);
    push_variant(&mut params, "metadata", &record.metadata);
    params
}

/// Parameters of one `query` page. `end` is exclusive; without it the
/// binding returns up to [`WEB_QUERY_LIMIT`] items.
pub fn query_params(container: &str, start: i64, end: Option<i64>) -> Vec<(String, String)> {
    let mut params = data_params("query", container, &Record::default());
    params.push(("start".to_string(), start.to_string()));
    if let Some(end) = end {
        params.push(("end".to_string(), end.to_string()));
    }
    params
}

/// Start of the page after one that began at `start` and held `received`
/// items, or `None` once the range is exhausted.
fn next_page(start: i64, end: Option<i64>, truncated: bool, received: usize) -> Option<i64> {
    if !truncated || start < 0 || received < WEB_QUERY_LIMIT {
        return None;
    }
    let next = start + received as i64;
    match end {
        Some(end) if next >= end => None,
        _ => Some(next),
    }
}

/// Client for one HTTP/JSON endpoint.
#[derive(Debug, Clone)]
pub struct WebClient {
    http: reqwest::Client,
    url: String,
}

impl WebClient {
    pub fn new(config: &WebConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        Ok(Self {
            http: builder.build()?,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one command and check its `result`.
    pub async fn call(&self, params: &[(String, String)]) -> Result<WebResponse> {
        debug!(url = %self.url, ?params, "web request");
        let response = self
            .http
            .get(&self.url)
            .query(params)
            .send()
            .await?
            .error_for_status()?
            .json::<WebResponse>()
            .await?;
        response.check()
    }

    /// Open an existing container.
    pub async fn open(&self, name: &str) -> Result<WebContainer> {
        self.open_or_create(name, None).await
    }

    /// Create a container if absent.
    pub async fn create(&self, name: &str, kind: &str) -> Result<WebContainer> {
        self.open_or_create(name, Some(kind)).await
    }

    async fn open_or_create(&self, name: &str, kind: Option<&str>) -> Result<WebContainer> {
        let mut params = vec![
            (
                "command".to_string(),
                if kind.is_some() { "create" } else { "open" }.to_string(),
            ),
            ("container".to_string(), name.to_string()),
        ];
        if let Some(kind) = kind {
            params.push(("type".to_string(), kind.to_string()));
        }

        self.call(&params).await.map_err(|e| match e {
            ClientError::Protocol { code, description } => ClientError::Open {
                name: name.to_string(),
                code,
                description,
            },
            other => other,
        })?;

        Ok(WebContainer {
            client: self.clone(),
            name: name.to_string(),
        })
    }
}

/// A container reached through [`WebClient`].
#[derive(Debug, Clone)]
pub struct WebContainer {
    client: WebClient,
    name: String,
}

impl WebContainer {
    async fn data(&self, command: &str, record: Record) -> Result<WebResponse> {
        self.client
            .call(&data_params(command, &self.name, &record))
            .await
    }

    pub async fn insert(
        &self,
        key: impl Into<Variant>,
        value: impl Into<Variant>,
        metadata: impl Into<Variant>,
    ) -> Result<()> {
        let record = Record::new(key, value).with_metadata(metadata);
        self.data("insert", record).await.map(|_| ())
    }

    pub async fn delete(&self, key: impl Into<Variant>) -> Result<()> {
        self.data("delete", Record::new(key, Variant::None))
            .await
            .map(|_| ())
    }

    pub async fn push_back(&self, value: impl Into<Variant>, metadata: impl Into<Variant>) -> Result<()> {
        let record = Record::new(Variant::None, value).with_metadata(metadata);
        self.data("push_back", record).await.map(|_| ())
    }

    pub async fn push_front(&self, value: impl Into<Variant>, metadata: impl Into<Variant>) -> Result<()> {
        let record = Record::new(Variant::None, value).with_metadata(metadata);
        self.data("push_front", record).await.map(|_| ())
    }

    pub async fn pop_back(&self) -> Result<Record> {
        self.data("pop_back", Record::default()).await?.record()
    }

    pub async fn pop_front(&self) -> Result<Record> {
        self.data("pop_front", Record::default()).await?.record()
    }
}

#[async_trait]
impl DataContainer for WebContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: Variant) -> Result<Record> {
        self.data("get", Record::new(key, Variant::None))
            .await?
            .record()
    }

    async fn set(&self, key: Variant, value: Variant, metadata: Variant) -> Result<()> {
        self.data("set", Record { key, value, metadata })
            .await
            .map(|_| ())
    }

    async fn count(&self) -> Result<u64> {
        let params = data_params("get_count", &self.name, &Record::default());
        self.client
            .call(&params)
            .await?
            .count
            .ok_or_else(|| ClientError::protocol("get_count answer without count"))
    }

    /// The binding has no property commands, so every name is unknown.
    async fn get_property(&self, name: &str) -> Result<String> {
        Err(ClientError::PropertyNotFound(name.to_string()))
    }

    /// The range goes to the binding as `start`/`end`, one capped page at a
    /// time; the key expression is applied locally.
    async fn query(&self, range: QueryRange, on_item: ItemCallback<'_>) -> Result<QuerySummary> {
        let end = range.end.map(Cookie::value).filter(|e| *e > 0);
        let mut start = range.start.map(Cookie::value).unwrap_or(0);
        let mut delivered = 0u64;

        loop {
            let response = self
                .client
                .call(&query_params(&self.name, start, end))
                .await?;
            let records = response.result_set()?;
            let received = records.len();

            for (position, record) in (start..).zip(records) {
                if let Some(expr) = &range.expression {
                    if !record.key.to_string().contains(expr.as_str()) {
                        continue;
                    }
                }
                delivered += 1;
                if let ControlFlow::Break(()) = on_item(record) {
                    return Ok(QuerySummary {
                        query_id: 0,
                        delivered,
                        next: Some(Cookie(position + 1)),
                        completed: false,
                    });
                }
            }

            match next_page(start, end, response.maybe_truncated(), received) {
                Some(next) => {
                    debug!(container = %self.name, start = next, "next query page");
                    start = next;
                }
                None => break,
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
