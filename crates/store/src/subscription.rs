use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::StoreError;
use crate::ids::ConversationId;

type ChangeCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Live handle for one change subscription.
///
/// Unsubscribing is idempotent, and once `unsubscribe` returns no further
/// callback fires for this handle: delivery and detachment serialize on the
/// same subscriber table lock, and the (id, epoch) pair guards against a
/// recycled slot. Dropping the handle unsubscribes as well.
pub struct Subscription {
    table: Weak<dyn Detach>,
    id: u64,
    epoch: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            table.detach(self.id, self.epoch);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64, epoch: u64);
}

struct SubscriberEntry<T: ?Sized> {
    epoch: u64,
    scope: Option<ConversationId>,
    on_change: ChangeCallback<T>,
    on_error: ErrorCallback,
}

struct TableInner<T: ?Sized> {
    next_id: u64,
    next_epoch: u64,
    entries: HashMap<u64, SubscriberEntry<T>>,
}

/// Subscriber table shared by a store backing.
///
/// Callbacks are invoked while the table lock is held; store code must never
/// call back into the same store from inside a callback.
pub(crate) struct SubscriberTable<T: ?Sized> {
    inner: Mutex<TableInner<T>>,
}

impl<T: ?Sized + 'static> SubscriberTable<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                next_id: 1,
                next_epoch: 1,
                entries: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TableInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(
        self: &Arc<Self>,
        scope: Option<ConversationId>,
        on_change: ChangeCallback<T>,
        on_error: ErrorCallback,
    ) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_id;
        let epoch = inner.next_epoch;
        inner.next_id += 1;
        inner.next_epoch += 1;
        inner.entries.insert(
            id,
            SubscriberEntry {
                epoch,
                scope,
                on_change,
                on_error,
            },
        );

        let table: Arc<dyn Detach> = self.clone();
        let table: Weak<dyn Detach> = Arc::downgrade(&table);
        Subscription { table, id, epoch }
    }

    /// Pushes a fresh snapshot to every subscriber of `scope`.
    pub(crate) fn publish(&self, scope: Option<ConversationId>, payload: &T) {
        let inner = self.lock();
        for entry in inner.entries.values() {
            if entry.scope == scope {
                (entry.on_change)(payload);
            }
        }
    }

    /// Reports a stream failure to every subscriber of `scope` and detaches
    /// them; a failed subscription is dead until the caller re-subscribes.
    pub(crate) fn fail(&self, scope: Option<ConversationId>, error: &StoreError) {
        let mut inner = self.lock();
        let failed: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.scope == scope)
            .map(|(id, _)| *id)
            .collect();

        for id in failed {
            if let Some(entry) = inner.entries.remove(&id) {
                (entry.on_error)(error);
            }
        }
    }
}

impl<T: ?Sized + 'static> Detach for SubscriberTable<T> {
    fn detach(&self, id: u64, epoch: u64) {
        let mut inner = self.lock();
        let matches = inner
            .entries
            .get(&id)
            .is_some_and(|entry| entry.epoch == epoch);
        if matches {
            inner.entries.remove(&id);
        }
    }
}
