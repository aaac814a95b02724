use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{StoreError, StoreResult, UnavailableSnafu};
use super::ids::{ConversationId, MessageId};
use super::subscription::{SubscriberTable, Subscription};
use super::types::{
    MessageRecord, MessageRole, NewMessage, RegistryEntry, current_unix_millis,
    sort_registry_entries,
};
use super::{
    BoxFuture, MessageStore, OnMessagesChange, OnRegistryChange, OnStoreError, SessionRegistry,
};

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Durable backing with store-assigned ordering: one sqlite database holding
/// the registry and every conversation log, change notifications published
/// process-side after each committed mutation.
pub struct SqliteStore {
    pool: SqlitePool,
    message_subscribers: Arc<SubscriberTable<[MessageRecord]>>,
    registry_subscribers: Arc<SubscriberTable<[RegistryEntry]>>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    created_at: i64,
}

impl MessageRow {
    fn into_record(self) -> StoreResult<MessageRecord> {
        let role = MessageRole::parse(&self.role).ok_or_else(|| {
            UnavailableSnafu {
                stage: "decode-message-role",
                details: format!("unknown role '{}'", self.role),
            }
            .build()
        })?;

        Ok(MessageRecord {
            id: MessageId::parse(&self.id)?,
            conversation_id: ConversationId::parse(&self.conversation_id)?,
            role,
            content: self.content,
            created_at_unix_millis: Some(self.created_at.max(0) as u64),
        })
    }
}

#[derive(Debug, FromRow)]
struct RegistryRow {
    id: String,
    title: String,
    updated_at: i64,
}

impl RegistryRow {
    fn into_entry(self) -> StoreResult<RegistryEntry> {
        Ok(RegistryEntry {
            id: ConversationId::parse(&self.id)?,
            title: self.title,
            updated_at_unix_millis: self.updated_at.max(0) as u64,
        })
    }
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StoreResult<Self> {
        ensure_database_directory(database_location).await?;
        Self::from_url(normalize_database_url(database_location)).await
    }

    /// Throwaway database for tests and QA scenarios.
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::from_url("sqlite::memory:".to_string()).await
    }

    async fn from_url(database_url: String) -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .map_err(query_error("sqlite-open-parse-url"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(SQLITE_BUSY_TIMEOUT);

        // One connection serializes writers, so append's read-then-insert
        // transactions never interleave.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(query_error("sqlite-open-connect"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| {
                UnavailableSnafu {
                    stage: "sqlite-open-migrate",
                    details: source.to_string(),
                }
                .build()
            })?;

        Ok(Self {
            pool,
            message_subscribers: SubscriberTable::new(),
            registry_subscribers: SubscriberTable::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn message_snapshot(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<MessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, conversation_id, role, content, created_at \
             FROM messages WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("load-messages"))?;

        rows.into_iter().map(MessageRow::into_record).collect()
    }

    async fn registry_snapshot(&self) -> StoreResult<Vec<RegistryEntry>> {
        let rows: Vec<RegistryRow> =
            sqlx::query_as("SELECT id, title, updated_at FROM conversations")
                .fetch_all(&self.pool)
                .await
                .map_err(query_error("load-registry"))?;

        let mut entries = rows
            .into_iter()
            .map(RegistryRow::into_entry)
            .collect::<StoreResult<Vec<_>>>()?;
        sort_registry_entries(&mut entries);
        Ok(entries)
    }

    async fn notify_messages(&self, conversation_id: ConversationId) -> StoreResult<()> {
        let snapshot = self.message_snapshot(conversation_id).await?;
        self.message_subscribers
            .publish(Some(conversation_id), snapshot.as_slice());
        Ok(())
    }

    async fn notify_registry(&self) -> StoreResult<()> {
        let snapshot = self.registry_snapshot().await?;
        self.registry_subscribers.publish(None, snapshot.as_slice());
        Ok(())
    }
}

impl MessageStore for SqliteStore {
    fn append<'a>(
        &'a self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> BoxFuture<'a, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(query_error("append-begin"))?;

            let existing: Option<i64> =
                sqlx::query_scalar("SELECT created_at FROM messages WHERE id = ?")
                    .bind(message.id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_error("append-select-existing"))?;

            let created_at = match existing {
                Some(created_at) => {
                    // Finalizing an already-appended id keeps its timestamp.
                    sqlx::query("UPDATE messages SET role = ?, content = ? WHERE id = ?")
                        .bind(message.role.as_str())
                        .bind(&message.content)
                        .bind(message.id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(query_error("append-replace"))?;
                    created_at.max(0) as u64
                }
                None => {
                    let last: Option<i64> = sqlx::query_scalar(
                        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?",
                    )
                    .bind(conversation_id.to_string())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(query_error("append-select-last"))?;

                    let created_at =
                        current_unix_millis().max(last.unwrap_or(0).max(0) as u64 + 1);
                    sqlx::query(
                        "INSERT INTO messages (id, conversation_id, role, content, created_at) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(message.id.to_string())
                    .bind(conversation_id.to_string())
                    .bind(message.role.as_str())
                    .bind(&message.content)
                    .bind(created_at as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error("append-insert"))?;
                    created_at
                }
            };

            tx.commit().await.map_err(query_error("append-commit"))?;

            let record = MessageRecord {
                id: message.id,
                conversation_id,
                role: message.role,
                content: message.content,
                created_at_unix_millis: Some(created_at),
            };

            self.notify_messages(conversation_id).await?;
            Ok(record)
        })
    }

    fn load_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<Vec<MessageRecord>>> {
        Box::pin(self.message_snapshot(conversation_id))
    }

    fn delete_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(query_error("delete-all-messages"))?;

            self.message_subscribers
                .publish(Some(conversation_id), &[]);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        conversation_id: ConversationId,
        on_change: OnMessagesChange,
        on_error: OnStoreError,
    ) -> Subscription {
        self.message_subscribers
            .attach(Some(conversation_id), on_change, on_error)
    }
}

impl SessionRegistry for SqliteStore {
    fn list<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<RegistryEntry>>> {
        Box::pin(self.registry_snapshot())
    }

    fn upsert_summary<'a>(
        &'a self,
        conversation_id: ConversationId,
        title: String,
        updated_at_unix_millis: u64,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, title, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, \
                 updated_at = excluded.updated_at",
            )
            .bind(conversation_id.to_string())
            .bind(&title)
            .bind(updated_at_unix_millis as i64)
            .execute(&self.pool)
            .await
            .map_err(query_error("upsert-summary"))?;

            self.notify_registry().await
        })
    }

    fn remove<'a>(&'a self, conversation_id: ConversationId) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let outcome = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(query_error("remove-summary"))?;

            if outcome.rows_affected() > 0 {
                self.notify_registry().await?;
            }
            Ok(())
        })
    }

    fn subscribe_registry(
        &self,
        on_change: OnRegistryChange,
        on_error: OnStoreError,
    ) -> Subscription {
        self.registry_subscribers.attach(None, on_change, on_error)
    }
}

fn query_error(stage: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| {
        UnavailableSnafu {
            stage,
            details: source.to_string(),
        }
        .build()
    }
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        database_location.to_string()
    } else {
        format!("sqlite://{database_location}")
    }
}

async fn ensure_database_directory(database_location: &str) -> StoreResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(database_location).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::from_io("sqlite-create-directory", &source))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn append_assigns_strictly_increasing_timestamps() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let conversation = ConversationId::generate();

        let first = store
            .append(conversation, NewMessage::user("one"))
            .await
            .expect("append");
        let second = store
            .append(conversation, NewMessage::assistant("two"))
            .await
            .expect("append");

        assert!(second.created_at_unix_millis > first.created_at_unix_millis);

        let log = store.load_all(conversation).await.expect("load");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].content, "one");
        assert_eq!(log[1].content, "two");
    }

    #[tokio::test]
    async fn append_with_existing_id_replaces_in_place() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let conversation = ConversationId::generate();

        let placeholder = store
            .append(conversation, NewMessage::assistant("…"))
            .await
            .expect("append");
        let finalized = store
            .append(
                conversation,
                NewMessage::new(placeholder.id, MessageRole::Assistant, "done"),
            )
            .await
            .expect("replace");

        assert_eq!(finalized.id, placeholder.id);
        assert_eq!(
            finalized.created_at_unix_millis,
            placeholder.created_at_unix_millis
        );

        let log = store.load_all(conversation).await.expect("load");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, "done");
    }

    #[tokio::test]
    async fn delete_all_empties_the_log_and_notifies() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let conversation = ConversationId::generate();
        store
            .append(conversation, NewMessage::user("hello"))
            .await
            .expect("append");

        let empties = Arc::new(AtomicUsize::new(0));
        let empties_for_change = empties.clone();
        let _subscription = store.subscribe(
            conversation,
            Arc::new(move |snapshot| {
                if snapshot.is_empty() {
                    empties_for_change.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Arc::new(|_| {}),
        );

        store.delete_all(conversation).await.expect("delete");

        assert_eq!(empties.load(Ordering::SeqCst), 1);
        let log = store.load_all(conversation).await.expect("load");
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn registry_upsert_overwrites_and_orders() {
        let store = SqliteStore::open_in_memory().await.expect("open");
        let first = ConversationId::generate();
        let second = ConversationId::generate();

        store
            .upsert_summary(first, "New Conversation".to_string(), 100)
            .await
            .expect("upsert");
        store
            .upsert_summary(second, "algebra".to_string(), 50)
            .await
            .expect("upsert");
        store
            .upsert_summary(first, "geometry".to_string(), 200)
            .await
            .expect("overwrite");

        let entries = store.list().await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first);
        assert_eq!(entries[0].title, "geometry");
        assert_eq!(entries[1].id, second);

        store.remove(first).await.expect("remove");
        store.remove(first).await.expect("remove is idempotent");
        assert_eq!(store.list().await.expect("list").len(), 1);
    }
}
