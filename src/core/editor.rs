//! Optimistic single-record edits on top of a [`CollectionView`].
//!
//! Per record id the ledger walks `Clean -> Pending -> (Reconciling ->) Clean`.
//! `Pending` holds the pre-edit copy for rollback and the provisional copy
//! shown meanwhile. `Reconciling` pins the authoritative record over a page
//! that was requested before the write completed, so an older snapshot cannot
//! undo a confirmed edit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::error::SyncError;
use crate::core::types::{Alert, AlertRule, AlertRuleCreate, AlertUpdate, Record};
use crate::core::view::{CollectionView, PageSource};

/// A partial update that can be merged into a local copy.
pub trait Patch<T>: Send + Sync {
    fn apply_to(&self, record: &mut T);

    /// Client-side checks; a failure blocks the write.
    fn validate(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

impl Patch<Alert> for AlertUpdate {
    fn apply_to(&self, alert: &mut Alert) {
        if let Some(status) = &self.status {
            alert.status = status.clone();
        }
        if let Some(assigned_to) = &self.assigned_to {
            alert.assigned_to = Some(assigned_to.clone());
        }
        if let Some(notes) = &self.notes {
            alert.notes = Some(notes.clone());
        }
        // resolved_at is server-derived; the write result carries it
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.is_empty() {
            return Err(SyncError::Validation("alert update has no fields".into()));
        }
        if matches!(&self.status, Some(s) if s.as_str().is_empty()) {
            return Err(SyncError::Validation("alert status must not be empty".into()));
        }
        Ok(())
    }
}

impl Patch<AlertRule> for AlertRuleCreate {
    fn apply_to(&self, rule: &mut AlertRule) {
        rule.name = self.name.clone();
        // absent means unchanged, as on the server
        for (slot, value) in [
            (&mut rule.description, &self.description),
            (&mut rule.severity_filter, &self.severity_filter),
            (&mut rule.category_filter, &self.category_filter),
            (&mut rule.source_filter, &self.source_filter),
        ] {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        rule.is_active = self.is_active;
    }

    fn validate(&self) -> Result<(), SyncError> {
        AlertRuleCreate::validate(self)
    }
}

/// Sends a patch for one record and returns the server's copy.
pub trait RecordWriter<T: Record>: Send + Sync {
    type Patch: Patch<T> + Clone + 'static;

    fn write(
        &self,
        id: &T::Id,
        patch: &Self::Patch,
    ) -> impl Future<Output = Result<T, SyncError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditState<T> {
    Clean,
    Pending {
        original: Option<T>,
        provisional: Option<T>,
    },
    Reconciling {
        authoritative: T,
        until_seq: u64,
    },
}

type Reapply<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

struct Entry<T> {
    state: EditState<T>,
    reapply: Option<Reapply<T>>,
}

pub struct EditLedger<T: Record> {
    entries: HashMap<T::Id, Entry<T>>,
}

impl<T: Record> Default for EditLedger<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Record> EditLedger<T> {
    pub fn state_of(&self, id: &T::Id) -> EditState<T> {
        self.entries
            .get(id)
            .map(|e| e.state.clone())
            .unwrap_or(EditState::Clean)
    }

    pub fn begin(&mut self, items: &mut [T], id: &T::Id, reapply: Reapply<T>) -> Result<(), SyncError> {
        if let Some(Entry {
            state: EditState::Pending { .. },
            ..
        }) = self.entries.get(id)
        {
            return Err(SyncError::EditInFlight(id.to_string()));
        }

        let (original, provisional) = match find(items, id) {
            Some(item) => {
                let original = item.clone();
                reapply(&mut *item);
                (Some(original), Some(item.clone()))
            }
            None => (None, None),
        };
        self.entries.insert(
            id.clone(),
            Entry {
                state: EditState::Pending {
                    original,
                    provisional,
                },
                reapply: Some(reapply),
            },
        );
        Ok(())
    }

    /// `in_flight` is the latest fetch sequence still awaiting its page, if any.
    pub fn finish(
        &mut self,
        items: &mut [T],
        id: &T::Id,
        result: Result<T, SyncError>,
        in_flight: Option<u64>,
    ) -> Result<T, SyncError> {
        let original = match self.entries.remove(id) {
            Some(Entry {
                state: EditState::Pending { original, .. },
                ..
            }) => original,
            _ => None,
        };

        match result {
            Ok(record) => {
                if let Some(slot) = find(items, id) {
                    *slot = record.clone();
                }
                if let Some(until_seq) = in_flight {
                    self.entries.insert(
                        id.clone(),
                        Entry {
                            state: EditState::Reconciling {
                                authoritative: record.clone(),
                                until_seq,
                            },
                            reapply: None,
                        },
                    );
                }
                info!("edit on {} confirmed", id);
                Ok(record)
            }
            Err(err) => {
                if let (Some(slot), Some(original)) = (find(items, id), original) {
                    *slot = original;
                }
                warn!("edit on {} rolled back: {}", id, err);
                Err(err)
            }
        }
    }

    /// Re-apply bookkeeping to a freshly fetched page with sequence `seq`.
    pub fn overlay(&mut self, items: &mut [T], seq: u64) {
        self.entries.retain(|id, entry| match &mut entry.state {
            EditState::Pending {
                original,
                provisional,
            } => {
                if let Some(item) = find(items, id) {
                    *original = Some(item.clone());
                    if let Some(reapply) = &entry.reapply {
                        reapply(&mut *item);
                    }
                    *provisional = Some(item.clone());
                }
                true
            }
            EditState::Reconciling {
                authoritative,
                until_seq,
            } => {
                if seq <= *until_seq {
                    if let Some(item) = find(items, id) {
                        *item = authoritative.clone();
                    }
                }
                false
            }
            EditState::Clean => false,
        });
    }

    /// Drop reconciliation marks waiting on a fetch that failed.
    pub fn settle_reconciling(&mut self, seq: u64) {
        self.entries.retain(|_, entry| {
            !matches!(entry.state, EditState::Reconciling { until_seq, .. } if until_seq <= seq)
        });
    }
}

fn find<'a, T: Record>(items: &'a mut [T], id: &T::Id) -> Option<&'a mut T> {
    items.iter_mut().find(|item| &item.record_id() == id)
}

/// Applies edits to a view immediately and converges with the server result.
pub struct OptimisticEditor<S: PageSource, W> {
    view: Arc<CollectionView<S>>,
    writer: W,
}

impl<S, W> OptimisticEditor<S, W>
where
    S: PageSource,
    W: RecordWriter<S::Item>,
{
    pub fn new(view: Arc<CollectionView<S>>, writer: W) -> Self {
        Self { view, writer }
    }

    pub fn view(&self) -> &Arc<CollectionView<S>> {
        &self.view
    }

    pub async fn edit(
        &self,
        id: <S::Item as Record>::Id,
        patch: W::Patch,
    ) -> Result<S::Item, SyncError> {
        patch.validate()?;
        self.view.begin_edit(&id, patch.clone())?;
        let guard = PendingEdit {
            view: &self.view,
            id: Some(id.clone()),
        };
        let result = self.writer.write(&id, &patch).await;
        guard.disarm();
        self.view.finish_edit(&id, result)
    }
}

/// Rolls the provisional copy back if the edit future is dropped mid-write.
struct PendingEdit<'a, S: PageSource> {
    view: &'a CollectionView<S>,
    id: Option<<S::Item as Record>::Id>,
}

impl<S: PageSource> PendingEdit<'_, S> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl<S: PageSource> Drop for PendingEdit<'_, S> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.view.abandon_edit(&id);
        }
    }
}
