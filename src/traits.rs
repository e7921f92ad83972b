//! Transport-agnostic container trait.
//!
//! The PR1 [`Container`](crate::Container), the HTTP/JSON
//! [`WebContainer`](crate::web::WebContainer) and the in-memory test double
//! all implement the same surface, so consumers such as background listings
//! work over any of them.

use std::ops::ControlFlow;

use async_trait::async_trait;

use crate::error::Result;
use crate::query::{QueryRange, QuerySummary, Record};
use crate::variant::Variant;

/// Callback handed to [`DataContainer::query`]. Return `Break` to stop.
pub type ItemCallback<'a> = &'a mut (dyn FnMut(Record) -> ControlFlow<()> + Send);

/// Trait for key/value container operations.
///
/// Implement this trait to create mock containers for testing or
/// alternative transport implementations.
#[async_trait]
pub trait DataContainer: Send + Sync {
    /// Remote container name.
    fn name(&self) -> &str;

    /// Point lookup.
    async fn get(&self, key: Variant) -> Result<Record>;

    /// Upsert with metadata.
    async fn set(&self, key: Variant, value: Variant, metadata: Variant) -> Result<()>;

    /// Current item count (a snapshot estimate).
    async fn count(&self) -> Result<u64>;

    /// Named container-level property. Absence is an error.
    async fn get_property(&self, name: &str) -> Result<String>;

    /// Stream every item in `range` through `on_item`.
    async fn query(&self, range: QueryRange, on_item: ItemCallback<'_>) -> Result<QuerySummary>;
}
