use std::sync::Arc;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod subscription;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use subscription::Subscription;
pub use types::{
    DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole, NewMessage, RegistryEntry,
    compare_recent_first, current_unix_millis, sort_registry_entries,
};

pub use futures::future::BoxFuture;

/// Change callback: receives the full, ordered snapshot after every mutation.
pub type OnMessagesChange = Arc<dyn Fn(&[MessageRecord]) + Send + Sync>;
pub type OnRegistryChange = Arc<dyn Fn(&[RegistryEntry]) + Send + Sync>;
/// Stream-failure callback; once called, that subscription is dead and the
/// caller must re-subscribe explicitly.
pub type OnStoreError = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Append-only message log, one ordered collection per conversation.
pub trait MessageStore: Send + Sync {
    /// Persists a message and assigns its `created_at` (strictly monotonic
    /// within the conversation). Appending an id that is already present
    /// replaces that record's content in place and keeps its original
    /// timestamp, which is how a finalized placeholder lands under its
    /// stable id.
    fn append<'a>(
        &'a self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> BoxFuture<'a, StoreResult<MessageRecord>>;

    fn load_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<Vec<MessageRecord>>>;

    /// Removes every message and then the conversation container. Partial
    /// failures surface as errors for the caller to retry, never silently.
    fn delete_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Pushes the full current ordered list after every change. Callers
    /// hydrate with [`MessageStore::load_all`] first; see [`Subscription`]
    /// for the unsubscribe guarantees.
    fn subscribe(
        &self,
        conversation_id: ConversationId,
        on_change: OnMessagesChange,
        on_error: OnStoreError,
    ) -> Subscription;
}

/// Conversation index for list views; owns the set of conversation
/// identities without holding any message payloads.
pub trait SessionRegistry: Send + Sync {
    /// Entries sorted most-recently-updated first, ties by id ascending.
    fn list<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<RegistryEntry>>>;

    fn upsert_summary<'a>(
        &'a self,
        conversation_id: ConversationId,
        title: String,
        updated_at_unix_millis: u64,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// No-op if the entry is absent.
    fn remove<'a>(&'a self, conversation_id: ConversationId) -> BoxFuture<'a, StoreResult<()>>;

    fn subscribe_registry(
        &self,
        on_change: OnRegistryChange,
        on_error: OnStoreError,
    ) -> Subscription;
}

pub trait ConversationStore: MessageStore + SessionRegistry {}

impl<T> ConversationStore for T where T: MessageStore + SessionRegistry {}
