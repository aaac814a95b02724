use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use snafu::ResultExt;
use tokio::sync::mpsc;

use studyhub_store::{
    ConversationId, ConversationStore, MessageRecord, MessageStore, RegistryEntry,
    SessionRegistry, StoreError, Subscription,
};

use crate::chat::message::Conversation;
use crate::chat::reconcile::merge_views;
use crate::error::{ChatResult, StoreSnafu};
use crate::events::{ChatEvent, NoticeScope};

/// Per-conversation view state the reconciler works on: the merged message
/// list, the submission epoch counter, and the live change subscription.
pub(crate) struct ConversationView {
    pub conversation: Conversation,
    pub next_epoch: u64,
    pub subscription: Option<Subscription>,
}

impl ConversationView {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            next_epoch: 1,
            subscription: None,
        }
    }
}

/// Session-scoped shared state, passed explicitly to the reconciler and the
/// lifecycle coordinator so parallel tests can hold independent instances.
///
/// Single-writer, multi-reader: only those two components mutate the view
/// map and the active pointer; observers read snapshots and drain the event
/// channel.
pub struct SessionContext {
    store: Arc<dyn ConversationStore>,
    views: Mutex<HashMap<ConversationId, ConversationView>>,
    active: Mutex<Option<ConversationId>>,
    registry_cache: ArcSwap<Vec<RegistryEntry>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    registry_subscription: Mutex<Option<Subscription>>,
}

impl SessionContext {
    /// Builds a context over `store` and returns the event stream observers
    /// drain. The registry change subscription is attached immediately.
    pub fn new(
        store: Arc<dyn ConversationStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let context = Arc::new(Self {
            store,
            views: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            registry_cache: ArcSwap::from_pointee(Vec::new()),
            events,
            registry_subscription: Mutex::new(None),
        });
        context.attach_registry_subscription();

        (context, events_rx)
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        *lock_ignoring_poison(&self.active)
    }

    pub(crate) fn set_active(&self, conversation_id: ConversationId) {
        *lock_ignoring_poison(&self.active) = Some(conversation_id);
    }

    pub(crate) fn clear_active(&self) {
        *lock_ignoring_poison(&self.active) = None;
    }

    /// Latest known registry listing, already sorted.
    pub fn registry_snapshot(&self) -> Arc<Vec<RegistryEntry>> {
        self.registry_cache.load_full()
    }

    pub(crate) fn publish_registry(&self, entries: Vec<RegistryEntry>) {
        self.registry_cache.store(Arc::new(entries));
    }

    /// Cloned view of one conversation, or `None` if it has no open view.
    pub fn conversation_snapshot(&self, conversation_id: ConversationId) -> Option<Conversation> {
        lock_ignoring_poison(&self.views)
            .get(&conversation_id)
            .map(|view| view.conversation.clone())
    }

    pub(crate) fn lock_views(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationView>> {
        lock_ignoring_poison(&self.views)
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    /// Hydrates a conversation view from the store and attaches its change
    /// subscription, replacing any previous one. Existing local state is
    /// merged, not discarded, so optimistic messages survive a reopen.
    pub(crate) async fn open_view(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        title: String,
    ) -> ChatResult<()> {
        // Subscribe before the snapshot load: a change landing in between is
        // then covered by the load, and one landing after it is delivered.
        let subscription = self.attach_view_subscription(conversation_id);
        {
            let mut views = self.lock_views();
            let view = views
                .entry(conversation_id)
                .or_insert_with(|| ConversationView::new(Conversation::new(conversation_id, title)));
            view.subscription = Some(subscription);
        }

        let remote = self
            .store
            .load_all(conversation_id)
            .await
            .context(StoreSnafu {
                stage: "open-view-load",
            })?;

        {
            let mut views = self.lock_views();
            if let Some(view) = views.get_mut(&conversation_id) {
                view.conversation.messages = merge_views(&view.conversation.messages, &remote);
            }
        }

        self.emit(ChatEvent::ConversationChanged { conversation_id });
        Ok(())
    }

    /// Stops change delivery for a view while keeping its state, so an
    /// in-flight submission keeps a place to land its result.
    pub(crate) fn close_view_subscription(&self, conversation_id: ConversationId) {
        let mut views = self.lock_views();
        if let Some(view) = views.get_mut(&conversation_id) {
            view.subscription = None;
        }
    }

    /// Discards a view entirely; used when its conversation is deleted.
    pub(crate) fn drop_view(&self, conversation_id: ConversationId) {
        self.lock_views().remove(&conversation_id);
    }

    fn attach_registry_subscription(self: &Arc<Self>) {
        let on_change = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);

        let subscription = self.store.subscribe_registry(
            Arc::new(move |entries: &[RegistryEntry]| {
                let Some(context) = on_change.upgrade() else {
                    return;
                };
                context.registry_cache.store(Arc::new(entries.to_vec()));
                context.emit(ChatEvent::RegistryChanged);
            }),
            Arc::new(move |error: &StoreError| {
                let Some(context) = on_error.upgrade() else {
                    return;
                };
                tracing::warn!(error = %error, "registry change stream failed");
                context.emit(ChatEvent::StoreNotice {
                    conversation_id: None,
                    scope: NoticeScope::Connection,
                    details: error.to_string(),
                });
            }),
        );

        *lock_ignoring_poison(&self.registry_subscription) = Some(subscription);
    }

    fn attach_view_subscription(self: &Arc<Self>, conversation_id: ConversationId) -> Subscription {
        let on_change = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);

        // Change callbacks are interrupts: they merge and announce, and never
        // touch submission state or call back into the store.
        self.store.subscribe(
            conversation_id,
            Arc::new(move |records: &[MessageRecord]| {
                let Some(context) = on_change.upgrade() else {
                    return;
                };
                {
                    let mut views = context.lock_views();
                    if let Some(view) = views.get_mut(&conversation_id) {
                        view.conversation.messages =
                            merge_views(&view.conversation.messages, records);
                    }
                }
                context.emit(ChatEvent::ConversationChanged { conversation_id });
            }),
            Arc::new(move |error: &StoreError| {
                let Some(context) = on_error.upgrade() else {
                    return;
                };
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "conversation change stream failed"
                );
                context.emit(ChatEvent::StoreNotice {
                    conversation_id: Some(conversation_id),
                    scope: NoticeScope::Connection,
                    details: error.to_string(),
                });
            }),
        )
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
