use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{Row, Shared};

/// What a refresh changed, in terms of the visible rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    /// New rows to append after the ones already shown.
    Appended(Vec<Row>),
    /// The filter changed; these rows replace everything shown.
    Replaced(Vec<Row>),
    /// The listing restarted; these rows replace everything shown.
    Reset(Vec<Row>),
}

impl ViewUpdate {
    pub fn rows(&self) -> &[Row] {
        match self {
            ViewUpdate::Appended(rows) | ViewUpdate::Replaced(rows) | ViewUpdate::Reset(rows) => {
                rows
            }
        }
    }

    /// True for an append of nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self, ViewUpdate::Appended(rows) if rows.is_empty())
    }
}

/// Row counts for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStatus {
    pub shown: usize,
    pub total: u64,
    pub filtered: bool,
}

impl fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.shown, self.total)?;
        if self.filtered {
            f.write_str(" (filtered)")?;
        }
        Ok(())
    }
}

/// A refresh result paired with the status after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub update: ViewUpdate,
    pub status: ViewStatus,
}

/// Consumer-side snapshot of a [`Listing`](super::Listing).
///
/// `published` is always a prefix of the listing buffer: every buffered row
/// is published exactly once per generation.
pub struct MaterializedView {
    source: Arc<Shared>,
    generation: u64,
    published: Vec<Row>,
    filter: Option<String>,
    applied: Option<String>,
    filtered: Vec<Row>,
}

impl MaterializedView {
    pub(crate) fn new(source: Arc<Shared>) -> Self {
        Self {
            generation: source.generation(),
            source,
            published: Vec::new(),
            filter: None,
            applied: None,
            filtered: Vec::new(),
        }
    }

    /// Set the key substring filter. Empty text removes the filter. Takes
    /// effect on the next [`refresh`](Self::refresh).
    pub fn set_filter(&mut self, text: &str) {
        self.filter = (!text.is_empty()).then(|| text.to_string());
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Pull rows appended since the last refresh and bring the filtered
    /// projection up to date.
    pub fn refresh(&mut self) -> ViewUpdate {
        let (generation, delta) = self.source.tail(self.generation, self.published.len());

        if generation != self.generation {
            debug!(generation, rows = delta.len(), "listing restarted");
            self.generation = generation;
            self.published = delta;
            self.applied = self.filter.clone();
            self.recompute();
            return ViewUpdate::Reset(self.rows().to_vec());
        }

        self.published.extend(delta.iter().cloned());

        if self.applied != self.filter {
            self.applied = self.filter.clone();
            self.recompute();
            return ViewUpdate::Replaced(self.rows().to_vec());
        }

        match &self.applied {
            Some(needle) => {
                let matching: Vec<Row> = delta
                    .into_iter()
                    .filter(|row| row.key.contains(needle.as_str()))
                    .collect();
                self.filtered.extend(matching.iter().cloned());
                ViewUpdate::Appended(matching)
            }
            None => ViewUpdate::Appended(delta),
        }
    }

    /// Full rescan of the published rows against the applied filter.
    fn recompute(&mut self) {
        self.filtered = match &self.applied {
            Some(needle) => self
                .published
                .iter()
                .filter(|row| row.key.contains(needle.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
    }

    /// Rows currently visible: the filtered projection when a filter is
    /// applied, everything published otherwise.
    pub fn rows(&self) -> &[Row] {
        if self.applied.is_some() {
            &self.filtered
        } else {
            &self.published
        }
    }

    /// Every row published so far, ignoring the filter.
    pub fn published(&self) -> &[Row] {
        &self.published
    }

    pub fn status(&self) -> ViewStatus {
        ViewStatus {
            shown: self.rows().len(),
            total: self.source.total_remote().max(self.published.len() as u64),
            filtered: self.applied.is_some(),
        }
    }
}

/// Drive `view` on a fixed cadence and whenever the filter text changes,
/// sending every non-empty update. The loop ends when `updates` is closed
/// and hands the view back.
pub fn spawn_refresh_loop(
    mut view: MaterializedView,
    period: Duration,
    mut filter: watch::Receiver<String>,
    updates: mpsc::Sender<Published>,
) -> JoinHandle<MaterializedView> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        view.set_filter(&filter.borrow_and_update());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = filter.changed(), if watching => {
                    match changed {
                        Ok(()) => view.set_filter(&filter.borrow_and_update()),
                        Err(_) => watching = false,
                    }
                }
                _ = updates.closed() => break,
            }

            let update = view.refresh();
            if update.is_noop() {
                continue;
            }
            let published = Published {
                status: view.status(),
                update,
            };
            if updates.send(published).await.is_err() {
                break;
            }
        }
        view
    })
}
