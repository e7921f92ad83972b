//! Background ingestion of a container into a local, filterable snapshot.
//!
//! A [`Listing`] runs one query worker that appends every arriving row to a
//! shared buffer. A [`MaterializedView`] owned by the consumer drains the
//! rows added since its last refresh and maintains an optional filtered
//! projection. The buffer lock is only held to append one row or to copy
//! the new tail.

mod view;

pub use view::{spawn_refresh_loop, MaterializedView, Published, ViewStatus, ViewUpdate};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::query::{QueryRange, Record};
use crate::traits::DataContainer;

/// One listed item, rendered as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub value: String,
}

impl Row {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl From<Record> for Row {
    fn from(record: Record) -> Self {
        Self {
            key: record.key.to_string(),
            value: record.value.to_string(),
        }
    }
}

/// State shared between the worker and the views.
#[derive(Default)]
pub(crate) struct Shared {
    rows: Mutex<Vec<Row>>,
    /// Bumped (under the rows lock) every time the buffer is reset.
    generation: AtomicU64,
    stopping: AtomicBool,
    total_remote: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn rows(&self) -> MutexGuard<'_, Vec<Row>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy rows from `offset` onward, together with the buffer generation.
    /// When the buffer was reset since `seen`, the offset no longer applies
    /// and the whole buffer is copied.
    pub(crate) fn tail(&self, seen: u64, offset: usize) -> (u64, Vec<Row>) {
        let rows = self.rows();
        let generation = self.generation.load(Ordering::Acquire);
        let offset = if generation == seen { offset } else { 0 };
        let tail = rows.get(offset..).map(<[Row]>::to_vec).unwrap_or_default();
        (generation, tail)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn total_remote(&self) -> u64 {
        self.total_remote.load(Ordering::Acquire)
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

/// Background listing of one container.
///
/// At most one worker runs at a time; starting while one is running is a
/// no-op.
#[derive(Default)]
pub struct Listing {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start draining `container` into the buffer. Returns false (and does
    /// nothing) when a worker is already running.
    pub fn start(&self, container: Arc<dyn DataContainer>) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            debug!(container = %container.name(), "listing already running");
            return false;
        }

        {
            let mut rows = self.shared.rows();
            rows.clear();
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.stopping.store(false, Ordering::Release);
        self.shared.total_remote.store(0, Ordering::Release);
        self.shared.set_error(None);

        *worker = Some(tokio::spawn(ingest(Arc::clone(&self.shared), container)));
        true
    }

    /// Ask the worker to stop at the next delivered item.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Wait for the current worker, if any, to exit.
    pub async fn finished(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "listing worker panicked");
            }
        }
    }

    /// Failure that ended the last worker. A requested stop is not a failure.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rows buffered so far.
    pub fn len(&self) -> usize {
        self.shared.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh consumer view over this listing.
    pub fn view(&self) -> MaterializedView {
        MaterializedView::new(Arc::clone(&self.shared))
    }
}

async fn ingest(shared: Arc<Shared>, container: Arc<dyn DataContainer>) {
    let name = container.name().to_string();

    match container.count().await {
        Ok(total) => shared.total_remote.store(total, Ordering::Release),
        Err(e) => {
            warn!(container = %name, error = %e, "listing count failed");
            shared.set_error(Some(e.to_string()));
            return;
        }
    }

    let worker_shared = Arc::clone(&shared);
    let mut on_item = move |record: Record| {
        if worker_shared.stopping.load(Ordering::Acquire) {
            return ControlFlow::Break(());
        }
        worker_shared.rows().push(Row::from(record));
        ControlFlow::Continue(())
    };

    match container.query(QueryRange::all(), &mut on_item).await {
        Ok(summary) if summary.completed => {
            info!(container = %name, rows = summary.delivered, "listing complete");
        }
        Ok(summary) => {
            info!(container = %name, rows = summary.delivered, "listing stopped");
        }
        Err(_) if shared.stopping.load(Ordering::Acquire) => {
            debug!(container = %name, "listing stopped");
        }
        Err(e) => {
            warn!(container = %name, error = %e, "listing ended");
            shared.set_error(Some(e.to_string()));
        }
    }
}
