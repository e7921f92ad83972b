//! tio-client - typed variant data protocol client
//!
//! An async client for the tio key/value container service. It opens named
//! remote containers over the PR1 binary protocol, reads and writes
//! key/value/metadata triples, enumerates containers through streaming
//! queries and follows live mutation feeds. A background [`ingest::Listing`]
//! materializes a large container into a locally filterable view.
//!
//! ```no_run
//! # async fn demo() -> tio_client::Result<()> {
//! use tio_client::{Connection, QueryRange, Variant};
//!
//! let connection = Connection::connect("localhost", 2605).await?;
//! let orders = connection.open("orders", "volatile_map").await?;
//! orders.set("k1", 42).await?;
//! assert_eq!(orders.get("k1").await?.value, Variant::Int(42));
//!
//! orders
//!     .query(QueryRange::all(), |record| println!("{} = {}", record.key, record.value))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod container;
pub mod error;
pub mod ingest;
pub mod protocol;
pub mod query;
mod session;
pub mod subscription;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod traits;
pub mod utils;
pub mod variant;
pub mod web;

pub use connection::{init, Connection, ConnectionState};
pub use container::Container;
pub use error::{ClientError, Result};
pub use ingest::{Listing, MaterializedView, Row, ViewStatus, ViewUpdate};
pub use protocol::EventCode;
pub use query::{Cookie, QueryRange, QuerySummary, Record};
pub use subscription::{Event, Subscription};
pub use traits::DataContainer;
pub use variant::Variant;
