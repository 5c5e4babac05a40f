//! Periodically refreshed aggregate scoped to a filter.
//!
//! The poller fetches on mount, then once per interval. A scope change
//! fetches immediately and restarts the interval. Fetches run as their own
//! tasks so a slow request never delays the next tick; the view's request
//! sequence decides which answer lands.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::error::SyncError;
use crate::core::sequence::RequestSequence;
use crate::core::types::SummarySnapshot;
use crate::core::view::{describe, Applied};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

pub trait SummarySource: Send + Sync + 'static {
    type Filter: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    fn fetch_summary(
        &self,
        filter: &Self::Filter,
    ) -> impl Future<Output = Result<SummarySnapshot, SyncError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryState<F> {
    pub filter: F,
    pub snapshot: Option<SummarySnapshot>,
    pub loading: bool,
    pub error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTicket<F> {
    pub seq: u64,
    pub filter: F,
}

struct Inner<F> {
    state: SummaryState<F>,
    seq: RequestSequence,
    torn_down: bool,
}

pub struct SummaryView<S: SummarySource> {
    source: S,
    inner: Mutex<Inner<S::Filter>>,
    generation: watch::Sender<u64>,
}

impl<S: SummarySource> SummaryView<S> {
    pub fn new(source: S, filter: S::Filter) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            source,
            inner: Mutex::new(Inner {
                state: SummaryState {
                    filter,
                    snapshot: None,
                    loading: false,
                    error: None,
                    fetched_at: None,
                },
                seq: RequestSequence::default(),
                torn_down: false,
            }),
            generation,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn state(&self) -> SummaryState<S::Filter> {
        self.lock().state.clone()
    }

    pub fn snapshot(&self) -> Option<SummarySnapshot> {
        self.lock().state.snapshot.clone()
    }

    pub fn filter(&self) -> S::Filter {
        self.lock().state.filter.clone()
    }

    /// Bumped every time the state visibly changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub async fn refresh(&self) -> Result<Applied, SyncError> {
        let ticket = self.begin_fetch();
        self.run(ticket).await
    }

    pub async fn set_filter(&self, filter: S::Filter) -> Result<Applied, SyncError> {
        let ticket = self.begin_set_filter(filter);
        self.run(ticket).await
    }

    pub fn begin_fetch(&self) -> SummaryTicket<S::Filter> {
        let mut inner = self.lock();
        issue(&mut *inner)
    }

    pub fn begin_set_filter(&self, filter: S::Filter) -> SummaryTicket<S::Filter> {
        let mut inner = self.lock();
        inner.state.filter = filter;
        issue(&mut *inner)
    }

    pub fn apply(
        &self,
        ticket: &SummaryTicket<S::Filter>,
        result: Result<SummarySnapshot, SyncError>,
    ) -> Result<Applied, SyncError> {
        let mut inner = self.lock();
        if inner.torn_down || !inner.seq.is_current(ticket.seq) {
            debug!("summary: dropping stale response #{}", ticket.seq);
            return Ok(Applied::Discarded);
        }
        let state = &mut inner.state;
        state.loading = false;
        let outcome = match result {
            Ok(snapshot) => {
                info!(
                    "summary: total={} high+critical={} categories={}",
                    snapshot.total,
                    snapshot.high_and_critical(),
                    snapshot.category_count()
                );
                state.snapshot = Some(snapshot);
                state.error = None;
                state.fetched_at = Some(Utc::now());
                Ok(Applied::Committed)
            }
            Err(err) => {
                warn!("summary: fetch failed: {}", err);
                state.error = Some(describe("summary", &err));
                Err(err)
            }
        };
        drop(inner);
        self.generation.send_modify(|g| *g += 1);
        outcome
    }

    /// Stop accepting results; anything still in flight is ignored on arrival.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        inner.torn_down = true;
        inner.seq.invalidate();
        inner.state.loading = false;
    }

    async fn run(&self, ticket: SummaryTicket<S::Filter>) -> Result<Applied, SyncError> {
        let result = self.source.fetch_summary(&ticket.filter).await;
        self.apply(&ticket, result)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S::Filter>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn issue<F: Clone>(inner: &mut Inner<F>) -> SummaryTicket<F> {
    inner.state.loading = true;
    SummaryTicket {
        seq: inner.seq.issue(),
        filter: inner.state.filter.clone(),
    }
}

/// Running poll loop; stopping it tears the view down.
pub struct PollHandle<S: SummarySource> {
    view: Arc<SummaryView<S>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<S: SummarySource> PollHandle<S> {
    pub fn view(&self) -> &Arc<SummaryView<S>> {
        &self.view
    }

    pub async fn stop(mut self) {
        self.halt();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn halt(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            self.view.teardown();
        }
    }
}

impl<S: SummarySource> Drop for PollHandle<S> {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Poll `view` every `period`, following filter changes published on `scope`.
pub fn spawn_polling<S: SummarySource>(
    view: Arc<SummaryView<S>>,
    scope: watch::Receiver<S::Filter>,
    period: Duration,
) -> PollHandle<S> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(poll_loop(view.clone(), scope, period, shutdown_rx));
    PollHandle {
        view,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn poll_loop<S: SummarySource>(
    view: Arc<SummaryView<S>>,
    mut scope: watch::Receiver<S::Filter>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    {
        let initial = scope.borrow_and_update().clone();
        view.lock().state.filter = initial;
    }
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut scope_open = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = scope.changed(), if scope_open => {
                if changed.is_err() {
                    scope_open = false;
                    continue;
                }
                let filter = scope.borrow_and_update().clone();
                if filter == view.filter() {
                    continue;
                }
                debug!("summary: scope changed to {:?}", filter);
                let ticket = view.begin_set_filter(filter);
                spawn_fetch(view.clone(), ticket);
                ticker.reset();
            }
            _ = ticker.tick() => {
                let ticket = view.begin_fetch();
                spawn_fetch(view.clone(), ticket);
            }
        }
    }
    debug!("summary: polling stopped");
}

fn spawn_fetch<S: SummarySource>(view: Arc<SummaryView<S>>, ticket: SummaryTicket<S::Filter>) {
    tokio::spawn(async move {
        let result = view.source.fetch_summary(&ticket.filter).await;
        // failures are recorded on the view; nothing else to do with them here
        let _ = view.apply(&ticket, result);
    });
}
