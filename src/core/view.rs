//! Filtered, paginated client-side views over a server collection.
//!
//! Every fetch takes a number from the view's [`RequestSequence`]. A result is
//! committed only if its number is still the latest issued one; anything else
//! is dropped on arrival, success or failure alike. Commits replace items,
//! total and offset together under one lock.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::editor::{EditLedger, EditState, Patch};
use crate::core::error::SyncError;
use crate::core::sequence::RequestSequence;
use crate::core::types::{Page, Record};

/// Largest page the server will serve.
pub const MAX_LIMIT: u64 = 500;

/// Where a view gets its pages from.
pub trait PageSource: Send + Sync + 'static {
    type Filter: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    type Item: Record;

    fn fetch_page(
        &self,
        filter: &Self::Filter,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = Result<Page<Self::Item>, SyncError>> + Send;
}

/// Everything a consumer needs to render a view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState<F, T> {
    pub filter: F,
    pub offset: u64,
    pub limit: u64,
    pub items: Vec<T>,
    pub total: u64,
    pub loading: bool,
    pub error: Option<String>,
    /// Set after the first successful load.
    pub loaded: bool,
}

/// A fetch the view has issued and will accept back only while it is current.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTicket<F> {
    pub seq: u64,
    pub filter: F,
    pub offset: u64,
    pub limit: u64,
}

impl<F: Clone> FetchTicket<F> {
    /// The corrective request announced by [`Applied::Drifted`].
    pub fn drifted_to(&self, seq: u64, offset: u64) -> Self {
        Self {
            seq,
            filter: self.filter.clone(),
            offset,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The page replaced the view state.
    Committed,
    /// A newer request was issued after this one; the result was dropped.
    Discarded,
    /// The collection shrank under the requested offset; nothing was
    /// committed. A corrective request `seq` for `offset` was issued in the
    /// same step, see [`FetchTicket::drifted_to`].
    Drifted { offset: u64, seq: u64 },
}

struct Inner<F, T: Record> {
    state: ViewState<F, T>,
    seq: RequestSequence,
    edits: EditLedger<T>,
}

pub struct CollectionView<S: PageSource> {
    name: &'static str,
    source: S,
    inner: Mutex<Inner<S::Filter, S::Item>>,
    filter_tx: watch::Sender<S::Filter>,
}

pub type ViewSnapshot<S> = ViewState<<S as PageSource>::Filter, <S as PageSource>::Item>;

impl<S: PageSource> CollectionView<S> {
    pub fn new(
        name: &'static str,
        source: S,
        filter: S::Filter,
        limit: u64,
    ) -> Result<Self, SyncError> {
        validate_limit(limit)?;
        let (filter_tx, _) = watch::channel(filter.clone());
        Ok(Self {
            name,
            source,
            inner: Mutex::new(Inner {
                state: ViewState {
                    filter,
                    offset: 0,
                    limit,
                    items: Vec::new(),
                    total: 0,
                    loading: false,
                    error: None,
                    loaded: false,
                },
                seq: RequestSequence::default(),
                edits: EditLedger::default(),
            }),
            filter_tx,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn snapshot(&self) -> ViewSnapshot<S> {
        self.lock().state.clone()
    }

    /// Follows every filter change made through [`set_filter`](Self::set_filter).
    pub fn subscribe_filter(&self) -> watch::Receiver<S::Filter> {
        self.filter_tx.subscribe()
    }

    pub async fn set_filter(&self, filter: S::Filter) -> Result<Applied, SyncError> {
        let ticket = self.begin_set_filter(filter);
        self.run(ticket).await
    }

    pub async fn goto_page(&self, offset: u64) -> Result<Applied, SyncError> {
        let ticket = self.begin_goto_page(offset);
        self.run(ticket).await
    }

    pub async fn refresh(&self) -> Result<Applied, SyncError> {
        let ticket = self.begin_refresh();
        self.run(ticket).await
    }

    /// Replace the filter and reset to the first page.
    pub fn begin_set_filter(&self, filter: S::Filter) -> FetchTicket<S::Filter> {
        let ticket = {
            let mut inner = self.lock();
            inner.state.filter = filter.clone();
            inner.state.offset = 0;
            issue(&mut *inner, 0)
        };
        self.filter_tx.send_replace(filter);
        ticket
    }

    /// Clamp `offset` to `[0, total - 1]` (0 for an empty collection).
    /// Page alignment is up to the caller.
    pub fn begin_goto_page(&self, offset: u64) -> FetchTicket<S::Filter> {
        let mut inner = self.lock();
        let clamped = offset.min(inner.state.total.saturating_sub(1));
        issue(&mut *inner, clamped)
    }

    pub fn begin_refresh(&self) -> FetchTicket<S::Filter> {
        let mut inner = self.lock();
        let offset = inner.state.offset;
        issue(&mut *inner, offset)
    }

    /// Apply a fetch result if `ticket` is still the latest request.
    pub fn apply(
        &self,
        ticket: &FetchTicket<S::Filter>,
        result: Result<Page<S::Item>, SyncError>,
    ) -> Result<Applied, SyncError> {
        let mut inner = self.lock();
        if !inner.seq.is_current(ticket.seq) {
            debug!(
                "{}: dropping stale response #{} (latest #{})",
                self.name,
                ticket.seq,
                inner.seq.latest()
            );
            return Ok(Applied::Discarded);
        }

        let page = match result.and_then(|page| {
            page.validate(ticket.offset, ticket.limit)?;
            Ok(page)
        }) {
            Ok(page) => page,
            Err(err) => {
                warn!("{}: fetch failed: {}", self.name, err);
                inner.state.loading = false;
                inner.state.error = Some(describe(self.name, &err));
                inner.edits.settle_reconciling(ticket.seq);
                return Err(err);
            }
        };

        if page.limit != ticket.limit {
            warn!(
                "{}: server answered limit {} for requested {}",
                self.name, page.limit, ticket.limit
            );
        }

        if page.items.is_empty() && ticket.offset > 0 && ticket.offset >= page.total {
            let offset = last_page_offset(page.total, ticket.limit);
            info!(
                "{}: offset {} drifted past total {}, moving to {}",
                self.name, ticket.offset, page.total, offset
            );
            // issued before the lock drops so no other request can slip in between
            let seq = issue(&mut *inner, offset).seq;
            return Ok(Applied::Drifted { offset, seq });
        }

        let Page { mut items, total, .. } = page;
        inner.edits.overlay(&mut items, ticket.seq);
        let state = &mut inner.state;
        state.items = items;
        state.total = total;
        state.offset = ticket.offset;
        state.loading = false;
        state.error = None;
        state.loaded = true;
        info!(
            "{}: {} items at offset {} of {}",
            self.name,
            state.items.len(),
            state.offset,
            state.total
        );
        Ok(Applied::Committed)
    }

    async fn run(&self, ticket: FetchTicket<S::Filter>) -> Result<Applied, SyncError> {
        let result = self
            .source
            .fetch_page(&ticket.filter, ticket.offset, ticket.limit)
            .await;
        match self.apply(&ticket, result)? {
            Applied::Drifted { offset, seq } => {
                // one corrective fetch; a second drift is left to the next refresh
                let retry = ticket.drifted_to(seq, offset);
                let result = self
                    .source
                    .fetch_page(&retry.filter, retry.offset, retry.limit)
                    .await;
                match self.apply(&retry, result)? {
                    Applied::Drifted { seq, .. } => {
                        let mut inner = self.lock();
                        if inner.seq.is_current(seq) {
                            inner.state.loading = false;
                        }
                        Ok(Applied::Discarded)
                    }
                    other => Ok(other),
                }
            }
            other => Ok(other),
        }
    }

    /// Merge `patch` into the local copy of `id` and mark the record pending.
    pub fn begin_edit<P>(
        &self,
        id: &<S::Item as Record>::Id,
        patch: P,
    ) -> Result<(), SyncError>
    where
        P: Patch<S::Item> + 'static,
    {
        let mut inner = self.lock();
        let Inner { state, edits, .. } = &mut *inner;
        edits.begin(&mut state.items, id, Arc::new(move |rec: &mut S::Item| patch.apply_to(rec)))
    }

    /// Reconcile the write result for `id`: replace on success, roll back on failure.
    pub fn finish_edit(
        &self,
        id: &<S::Item as Record>::Id,
        result: Result<S::Item, SyncError>,
    ) -> Result<S::Item, SyncError> {
        let mut inner = self.lock();
        let Inner { state, edits, seq } = &mut *inner;
        let in_flight = state.loading.then(|| seq.latest());
        if let Err(err) = &result {
            state.error = Some(describe(self.name, err));
        }
        edits.finish(&mut state.items, id, result, in_flight)
    }

    /// Roll back a pending edit whose write will never be reconciled.
    pub fn abandon_edit(&self, id: &<S::Item as Record>::Id) {
        let mut inner = self.lock();
        let Inner { state, edits, .. } = &mut *inner;
        if matches!(edits.state_of(id), EditState::Pending { .. }) {
            let _ = edits.finish(&mut state.items, id, Err(SyncError::Cancelled), None);
        }
    }

    pub fn edit_state(&self, id: &<S::Item as Record>::Id) -> EditState<S::Item> {
        self.lock().edits.state_of(id)
    }

    /// Local copy of a record currently on the page.
    pub fn item(&self, id: &<S::Item as Record>::Id) -> Option<S::Item> {
        self.lock()
            .state
            .items
            .iter()
            .find(|item| &item.record_id() == id)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S::Filter, S::Item>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn issue<F: Clone, T: Record>(inner: &mut Inner<F, T>, offset: u64) -> FetchTicket<F> {
    let seq = inner.seq.issue();
    inner.state.loading = true;
    FetchTicket {
        seq,
        filter: inner.state.filter.clone(),
        offset,
        limit: inner.state.limit,
    }
}

pub fn validate_limit(limit: u64) -> Result<(), SyncError> {
    if limit == 0 || limit > MAX_LIMIT {
        return Err(SyncError::Validation(format!(
            "page limit must be between 1 and {}, got {}",
            MAX_LIMIT, limit
        )));
    }
    Ok(())
}

/// First offset of the last page of a collection of `total` items.
pub fn last_page_offset(total: u64, limit: u64) -> u64 {
    if total == 0 || limit == 0 {
        return 0;
    }
    ((total - 1) / limit) * limit
}

pub(crate) fn describe(name: &str, err: &SyncError) -> String {
    match err {
        SyncError::Http {
            status,
            status_text,
        } => format!("Failed to load {}: {} {}", name, status, status_text),
        other => format!("Failed to load {}: {}", name, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: u32,
        tag: String,
    }

    impl Record for Row {
        type Id = u32;

        fn record_id(&self) -> u32 {
            self.id
        }
    }

    /// Serves `total` rows tagged with the filter string.
    struct FakeSource {
        total: u64,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(total: u64) -> Self {
            Self {
                total,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PageSource for FakeSource {
        type Filter = String;
        type Item = Row;

        async fn fetch_page(
            &self,
            filter: &String,
            offset: u64,
            limit: u64,
        ) -> Result<Page<Row>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(rows(filter, self.total, offset, limit))
        }
    }

    fn rows(tag: &str, total: u64, offset: u64, limit: u64) -> Page<Row> {
        let end = (offset + limit).min(total);
        let items = (offset..end)
            .map(|i| Row {
                id: i as u32,
                tag: tag.to_string(),
            })
            .collect();
        Page {
            items,
            total,
            offset,
            limit,
        }
    }

    fn view(total: u64) -> CollectionView<FakeSource> {
        CollectionView::new("rows", FakeSource::new(total), String::new(), 10).unwrap()
    }

    #[test]
    fn later_filter_wins_when_earlier_resolves_last() {
        let v = view(0);
        let first = v.begin_set_filter("a".into());
        let second = v.begin_set_filter("b".into());

        let applied = v.apply(&second, Ok(rows("b", 3, 0, 10))).unwrap();
        assert_eq!(applied, Applied::Committed);
        let applied = v.apply(&first, Ok(rows("a", 40, 0, 10))).unwrap();
        assert_eq!(applied, Applied::Discarded);

        let snap = v.snapshot();
        assert_eq!(snap.filter, "b");
        assert_eq!(snap.total, 3);
        assert!(snap.items.iter().all(|r| r.tag == "b"));
        assert!(!snap.loading);
    }

    #[test]
    fn stale_failure_is_silent() {
        let v = view(0);
        let first = v.begin_refresh();
        let second = v.begin_refresh();
        let stale = v.apply(
            &first,
            Err(SyncError::Http {
                status: 500,
                status_text: "Internal Server Error".into(),
            }),
        );
        assert_eq!(stale.unwrap(), Applied::Discarded);
        assert!(v.snapshot().error.is_none());
        assert!(v.snapshot().loading);
        v.apply(&second, Ok(rows("", 2, 0, 10))).unwrap();
        assert!(!v.snapshot().loading);
    }

    #[test]
    fn failure_keeps_last_good_page() {
        let v = view(0);
        let t = v.begin_refresh();
        v.apply(&t, Ok(rows("x", 15, 0, 10))).unwrap();

        let t = v.begin_goto_page(10);
        let err = v
            .apply(
                &t,
                Err(SyncError::Http {
                    status: 503,
                    status_text: "Service Unavailable".into(),
                }),
            )
            .unwrap_err();
        assert_eq!(err.status(), Some(503));

        let snap = v.snapshot();
        assert_eq!(snap.items.len(), 10);
        assert_eq!(snap.total, 15);
        assert_eq!(snap.offset, 0);
        assert_eq!(
            snap.error.as_deref(),
            Some("Failed to load rows: 503 Service Unavailable")
        );
    }

    #[test]
    fn first_load_failure_leaves_items_empty() {
        let v = view(0);
        let t = v.begin_refresh();
        assert!(v.apply(&t, Err(SyncError::Timeout)).is_err());
        let snap = v.snapshot();
        assert!(snap.items.is_empty());
        assert!(!snap.loaded);
        assert!(snap.error.is_some());
    }

    #[test]
    fn invalid_page_is_rejected_without_commit() {
        let v = view(0);
        let t = v.begin_refresh();
        let bad = Page {
            items: vec![Row {
                id: 1,
                tag: "x".into(),
            }],
            total: 0,
            offset: 0,
            limit: 10,
        };
        assert!(matches!(
            v.apply(&t, Ok(bad)),
            Err(SyncError::InvalidPage(_))
        ));
        assert!(v.snapshot().items.is_empty());
    }

    #[tokio::test]
    async fn goto_page_on_empty_collection_clamps_to_zero() {
        let v = view(0);
        for target in [0, 1, 25, u64::MAX] {
            assert_eq!(v.goto_page(target).await.unwrap(), Applied::Committed);
            let snap = v.snapshot();
            assert_eq!(snap.offset, 0);
            assert!(snap.items.is_empty());
            assert!(snap.error.is_none());
        }
    }

    #[tokio::test]
    async fn goto_page_clamps_to_last_item() {
        let v = view(42);
        v.refresh().await.unwrap();
        v.goto_page(1_000).await.unwrap();
        let snap = v.snapshot();
        assert_eq!(snap.offset, 41);
        assert_eq!(snap.items.len(), 1);
        assert!(snap.offset + snap.items.len() as u64 <= snap.total);
    }

    #[tokio::test]
    async fn refresh_keeps_offset_and_limit() {
        let v = view(42);
        v.refresh().await.unwrap();
        v.goto_page(20).await.unwrap();
        v.refresh().await.unwrap();
        let snap = v.snapshot();
        assert_eq!(snap.offset, 20);
        assert_eq!(snap.limit, 10);
    }

    #[tokio::test]
    async fn set_filter_resets_offset_and_publishes() {
        let v = view(42);
        let mut rx = v.subscribe_filter();
        v.refresh().await.unwrap();
        v.goto_page(30).await.unwrap();
        v.set_filter("severity".into()).await.unwrap();
        assert_eq!(v.snapshot().offset, 0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), "severity");
    }

    #[test]
    fn drifted_offset_points_to_last_page() {
        let v = view(0);
        let t = v.begin_refresh();
        v.apply(&t, Ok(rows("", 95, 0, 10))).unwrap();
        let t = v.begin_goto_page(90);
        v.apply(&t, Ok(rows("", 95, 90, 10))).unwrap();

        let t = v.begin_refresh();
        let applied = v.apply(&t, Ok(rows("", 23, 90, 10))).unwrap();
        assert_eq!(
            applied,
            Applied::Drifted {
                offset: 20,
                seq: t.seq + 1
            }
        );
        assert_eq!(v.snapshot().offset, 90);
        assert!(v.snapshot().loading);

        let retry = t.drifted_to(t.seq + 1, 20);
        assert_eq!(v.apply(&retry, Ok(rows("", 23, 20, 10))).unwrap(), Applied::Committed);
        assert_eq!(v.snapshot().offset, 20);
        assert_eq!(v.snapshot().items.len(), 3);
    }

    #[test]
    fn filter_change_after_drift_supersedes_the_corrective_fetch() {
        let v = view(0);
        let t = v.begin_refresh();
        v.apply(&t, Ok(rows("", 95, 0, 10))).unwrap();
        let t = v.begin_goto_page(90);
        v.apply(&t, Ok(rows("", 95, 90, 10))).unwrap();

        let t = v.begin_refresh();
        let Applied::Drifted { offset, seq } = v.apply(&t, Ok(rows("", 23, 90, 10))).unwrap() else {
            panic!("expected drift");
        };
        let retry = t.drifted_to(seq, offset);

        // user picks a new filter while the corrective fetch is in flight
        let filtered = v.begin_set_filter("b".into());
        assert!(filtered.seq > retry.seq);
        assert_eq!(filtered.offset, 0);

        assert_eq!(v.apply(&retry, Ok(rows("", 23, 20, 10))).unwrap(), Applied::Discarded);
        assert_eq!(v.apply(&filtered, Ok(rows("b", 4, 0, 10))).unwrap(), Applied::Committed);
        let snap = v.snapshot();
        assert_eq!(snap.filter, "b");
        assert_eq!(snap.offset, 0);
        assert_eq!(snap.total, 4);
        assert!(!snap.loading);
    }

    #[tokio::test]
    async fn shrunk_collection_is_refetched_at_last_page() {
        let v = CollectionView::new("rows", FakeSource::new(23), String::new(), 10).unwrap();
        {
            let t = v.begin_refresh();
            v.apply(&t, Ok(rows("", 95, 0, 10))).unwrap();
            let t = v.begin_goto_page(90);
            v.apply(&t, Ok(rows("", 95, 90, 10))).unwrap();
        }
        v.refresh().await.unwrap();
        let snap = v.snapshot();
        assert_eq!(snap.offset, 20);
        assert_eq!(snap.total, 23);
        assert_eq!(snap.items.len(), 3);
        assert!(!snap.loading);
        assert_eq!(v.source().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn limit_bounds() {
        assert!(CollectionView::new("rows", FakeSource::new(0), String::new(), 0).is_err());
        assert!(CollectionView::new("rows", FakeSource::new(0), String::new(), 501).is_err());
        assert_eq!(last_page_offset(0, 25), 0);
        assert_eq!(last_page_offset(25, 25), 0);
        assert_eq!(last_page_offset(26, 25), 25);
    }
}
