use std::sync::Arc;

use snafu::ResultExt;

use studyhub_store::{
    ConversationId, DEFAULT_CONVERSATION_TITLE, MessageStore, NewMessage, RegistryEntry,
    SessionRegistry, current_unix_millis,
};

use crate::error::{ChatResult, NotFoundSnafu, StoreSnafu};
use crate::events::ChatEvent;
use crate::session::SessionContext;

use super::message::SEEDED_GREETING;

/// Attempts before a partially-removed log is surfaced as an error.
const DELETE_RETRY_ATTEMPTS: u32 = 3;

/// Creates, activates, and deletes conversations, and owns every write to
/// the active-conversation pointer.
pub struct LifecycleCoordinator {
    context: Arc<SessionContext>,
}

impl LifecycleCoordinator {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }

    /// Guarantees an active conversation: returns the current one, adopts
    /// the most recent registry entry, or seeds a fresh conversation when
    /// none exist. Idempotent.
    pub async fn ensure_active(&self) -> ChatResult<ConversationId> {
        if let Some(active) = self.context.active_conversation() {
            return Ok(active);
        }

        let entries = self.refresh_registry().await?;
        if let Some(entry) = entries.first() {
            let conversation_id = entry.id;
            self.context
                .open_view(conversation_id, entry.title.clone())
                .await?;
            self.activate(conversation_id);
            return Ok(conversation_id);
        }

        self.create_seeded().await
    }

    /// Always creates a fresh seeded conversation and makes it active; the
    /// previous conversation stays untouched.
    pub async fn new_conversation(&self) -> ChatResult<ConversationId> {
        self.create_seeded().await
    }

    /// Moves the active pointer to `conversation_id`. No-op when already
    /// active; fails with `NotFound` unless the id is a registry member, so
    /// a view can never be requested before its entry exists.
    pub async fn switch_to(&self, conversation_id: ConversationId) -> ChatResult<()> {
        if self.context.active_conversation() == Some(conversation_id) {
            return Ok(());
        }

        let entries = self.refresh_registry().await?;
        let entry = entries
            .iter()
            .find(|entry| entry.id == conversation_id)
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "switch-membership",
                    conversation_id,
                }
                .build()
            })?;

        // Unsubscribe the outgoing view promptly. Its state stays, and an
        // in-flight submission for it keeps running in the background.
        if let Some(previous) = self.context.active_conversation() {
            self.context.close_view_subscription(previous);
        }

        self.context
            .open_view(conversation_id, entry.title.clone())
            .await?;
        self.activate(conversation_id);
        Ok(())
    }

    /// Deletes the conversation's full log and registry entry. When the
    /// active conversation dies, the most-recently-updated survivor takes
    /// over; with no survivors a fresh conversation is seeded, so an active
    /// pointer never dangles.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let store = self.context.store();

        let mut attempt = 1;
        loop {
            match store.delete_all(conversation_id).await {
                Ok(()) => break,
                Err(error) if attempt < DELETE_RETRY_ATTEMPTS => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        attempt,
                        error = %error,
                        "log delete incomplete; retrying"
                    );
                    attempt += 1;
                }
                Err(error) => {
                    return Err(error).context(StoreSnafu {
                        stage: "delete-log",
                    });
                }
            }
        }

        store.remove(conversation_id).await.context(StoreSnafu {
            stage: "delete-registry-entry",
        })?;
        self.context.drop_view(conversation_id);

        let entries = self.refresh_registry().await?;
        if self.context.active_conversation() == Some(conversation_id) {
            self.context.clear_active();
            match entries.first() {
                Some(entry) => {
                    let replacement = entry.id;
                    self.context.open_view(replacement, entry.title.clone()).await?;
                    self.activate(replacement);
                }
                None => {
                    self.create_seeded().await?;
                }
            }
        }

        Ok(())
    }

    async fn create_seeded(&self) -> ChatResult<ConversationId> {
        let conversation_id = ConversationId::generate();
        let store = self.context.store();

        store
            .upsert_summary(
                conversation_id,
                DEFAULT_CONVERSATION_TITLE.to_string(),
                current_unix_millis(),
            )
            .await
            .context(StoreSnafu {
                stage: "seed-summary",
            })?;
        store
            .append(conversation_id, NewMessage::assistant(SEEDED_GREETING))
            .await
            .context(StoreSnafu {
                stage: "seed-greeting",
            })?;

        self.refresh_registry().await?;

        if let Some(previous) = self.context.active_conversation() {
            self.context.close_view_subscription(previous);
        }
        self.context
            .open_view(conversation_id, DEFAULT_CONVERSATION_TITLE.to_string())
            .await?;
        self.activate(conversation_id);

        Ok(conversation_id)
    }

    fn activate(&self, conversation_id: ConversationId) {
        self.context.set_active(conversation_id);
        self.context
            .emit(ChatEvent::ActiveChanged { conversation_id });
    }

    async fn refresh_registry(&self) -> ChatResult<Vec<RegistryEntry>> {
        let entries = self
            .context
            .store()
            .list()
            .await
            .context(StoreSnafu {
                stage: "list-registry",
            })?;
        self.context.publish_registry(entries.clone());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use studyhub_store::{ConversationStore, MemoryStore, MessageRole};

    use crate::chat::message::Role;
    use crate::error::ChatError;
    use crate::events::ChatEvent;
    use crate::session::SessionContext;

    use super::*;

    fn hub() -> (
        Arc<SessionContext>,
        LifecycleCoordinator,
        tokio::sync::mpsc::UnboundedReceiver<ChatEvent>,
    ) {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let (context, events) = SessionContext::new(store);
        let lifecycle = LifecycleCoordinator::new(context.clone());
        (context, lifecycle, events)
    }

    #[tokio::test]
    async fn ensure_active_seeds_exactly_one_greeted_conversation() {
        let (context, lifecycle, _events) = hub();

        let active = lifecycle.ensure_active().await.expect("ensure active");

        assert_eq!(context.active_conversation(), Some(active));
        let entries = context.store().list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, active);
        assert_eq!(entries[0].title, DEFAULT_CONVERSATION_TITLE);

        let conversation = context.conversation_snapshot(active).expect("snapshot");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].role, Role::Assistant);
        assert_eq!(conversation.messages[0].content, SEEDED_GREETING);
    }

    #[tokio::test]
    async fn ensure_active_is_idempotent() {
        let (context, lifecycle, _events) = hub();

        let first = lifecycle.ensure_active().await.expect("ensure active");
        let second = lifecycle.ensure_active().await.expect("ensure again");

        assert_eq!(first, second);
        assert_eq!(context.store().list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn ensure_active_adopts_the_most_recent_existing_conversation() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let older = ConversationId::generate();
        let newer = ConversationId::generate();
        store
            .upsert_summary(older, "older".to_string(), 100)
            .await
            .expect("upsert");
        store
            .upsert_summary(newer, "newer".to_string(), 200)
            .await
            .expect("upsert");

        let (context, _events) = SessionContext::new(store);
        let lifecycle = LifecycleCoordinator::new(context.clone());

        let active = lifecycle.ensure_active().await.expect("ensure active");
        assert_eq!(active, newer);
        // Adoption must not have seeded a third conversation.
        assert_eq!(context.store().list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn new_conversation_keeps_the_previous_one() {
        let (context, lifecycle, _events) = hub();

        let first = lifecycle.ensure_active().await.expect("ensure active");
        let second = lifecycle.new_conversation().await.expect("new conversation");

        assert_ne!(first, second);
        assert_eq!(context.active_conversation(), Some(second));
        assert_eq!(context.store().list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn switch_to_unknown_id_fails_with_not_found() {
        let (_context, lifecycle, _events) = hub();
        lifecycle.ensure_active().await.expect("ensure active");

        let error = lifecycle
            .switch_to(ConversationId::generate())
            .await
            .expect_err("unknown id rejected");
        assert!(matches!(error, ChatError::NotFound { .. }));
    }

    #[tokio::test]
    async fn switch_to_the_active_conversation_is_a_no_op() {
        let (context, lifecycle, _events) = hub();
        let active = lifecycle.ensure_active().await.expect("ensure active");

        lifecycle.switch_to(active).await.expect("switch");
        assert_eq!(context.active_conversation(), Some(active));
    }

    #[tokio::test]
    async fn deleting_the_active_conversation_promotes_the_most_recent_survivor() {
        let (context, lifecycle, _events) = hub();

        let first = lifecycle.ensure_active().await.expect("first");
        let second = lifecycle.new_conversation().await.expect("second");
        let third = lifecycle.new_conversation().await.expect("third");
        assert_eq!(context.active_conversation(), Some(third));

        // Pin recency explicitly; seeding in one burst can land several
        // conversations in the same millisecond.
        context
            .store()
            .upsert_summary(
                second,
                DEFAULT_CONVERSATION_TITLE.to_string(),
                current_unix_millis() + 60_000,
            )
            .await
            .expect("bump recency");

        lifecycle.delete_conversation(third).await.expect("delete");

        assert_eq!(context.active_conversation(), Some(second));
        let entries = context.store().list().await.expect("list");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.id != third));
        assert!(entries.iter().any(|entry| entry.id == first));

        let log = context.store().load_all(third).await.expect("load");
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_non_active_conversation_keeps_the_active_id() {
        let (context, lifecycle, _events) = hub();

        let first = lifecycle.ensure_active().await.expect("first");
        let second = lifecycle.new_conversation().await.expect("second");

        lifecycle.delete_conversation(first).await.expect("delete");

        assert_eq!(context.active_conversation(), Some(second));
        let entries = context.store().list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, second);
    }

    #[tokio::test]
    async fn deleting_the_last_conversation_seeds_a_replacement() {
        let (context, lifecycle, _events) = hub();

        let only = lifecycle.ensure_active().await.expect("ensure active");
        lifecycle.delete_conversation(only).await.expect("delete");

        let replacement = context
            .active_conversation()
            .expect("replacement is active");
        assert_ne!(replacement, only);

        let entries = context.store().list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, replacement);

        let log = context.store().load_all(replacement).await.expect("load");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, MessageRole::Assistant);
        assert_eq!(log[0].content, SEEDED_GREETING);
    }
}
