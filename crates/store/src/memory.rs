use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult, UnavailableSnafu};
use super::ids::ConversationId;
use super::subscription::{SubscriberTable, Subscription};
use super::types::{
    MessageRecord, NewMessage, RegistryEntry, current_unix_millis, sort_registry_entries,
};
use super::{BoxFuture, MessageStore, OnMessagesChange, OnRegistryChange, OnStoreError,
    SessionRegistry};

/// Serialized shape of the local history blob: the full set of conversations
/// and their logs, rewritten wholesale after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedHistory {
    conversations: Vec<PersistedConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConversation {
    entry: RegistryEntry,
    messages: Vec<MessageRecord>,
}

#[derive(Default)]
struct MemoryState {
    logs: HashMap<ConversationId, Vec<MessageRecord>>,
    registry: HashMap<ConversationId, RegistryEntry>,
    last_created_at: HashMap<ConversationId, u64>,
}

impl MemoryState {
    fn registry_snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.registry.values().cloned().collect();
        sort_registry_entries(&mut entries);
        entries
    }

    fn to_persisted(&self) -> PersistedHistory {
        let conversations = self
            .registry_snapshot()
            .into_iter()
            .map(|entry| PersistedConversation {
                messages: self.logs.get(&entry.id).cloned().unwrap_or_default(),
                entry,
            })
            .collect();
        PersistedHistory { conversations }
    }

    fn restore(persisted: PersistedHistory) -> Self {
        let mut state = Self::default();
        for conversation in persisted.conversations {
            let id = conversation.entry.id;
            let last = conversation
                .messages
                .iter()
                .filter_map(|message| message.created_at_unix_millis)
                .max()
                .unwrap_or(0);
            state.last_created_at.insert(id, last);
            state.logs.insert(id, conversation.messages);
            state.registry.insert(id, conversation.entry);
        }
        state
    }
}

/// Local-only backing: in-memory logs and registry, optionally mirrored to a
/// single JSON blob on disk. An absent or corrupt blob means starting with
/// zero conversations; the lifecycle layer seeds one.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    message_subscribers: Arc<SubscriberTable<[MessageRecord]>>,
    registry_subscribers: Arc<SubscriberTable<[RegistryEntry]>>,
    blob_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Purely in-memory store with no persistence.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            message_subscribers: SubscriberTable::new(),
            registry_subscribers: SubscriberTable::new(),
            blob_path: None,
        }
    }

    /// Opens a store mirrored to the blob at `blob_path`, loading whatever
    /// history the file holds.
    pub async fn open(blob_path: PathBuf) -> Self {
        let state = match load_history_blob(&blob_path).await {
            Some(persisted) => MemoryState::restore(persisted),
            None => MemoryState::default(),
        };

        Self {
            state: Mutex::new(state),
            message_subscribers: SubscriberTable::new(),
            registry_subscribers: SubscriberTable::new(),
            blob_path: Some(blob_path),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, persisted: PersistedHistory) -> StoreResult<()> {
        let Some(blob_path) = self.blob_path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = blob_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::from_io("blob-create-directory", &source))?;
        }

        let payload = serde_json::to_string(&persisted).map_err(|source| {
            UnavailableSnafu {
                stage: "blob-serialize",
                details: source.to_string(),
            }
            .build()
        })?;

        // Temp-file + rename keeps a crash from leaving a half-written blob.
        let temp_path = blob_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|source| StoreError::from_io("blob-write-temp", &source))?;
        tokio::fs::rename(&temp_path, blob_path)
            .await
            .map_err(|source| StoreError::from_io("blob-replace", &source))?;

        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn append<'a>(
        &'a self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> BoxFuture<'a, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let (record, snapshot, persisted) = {
                let mut state = self.lock_state();
                let existing_position = state
                    .logs
                    .get(&conversation_id)
                    .and_then(|log| log.iter().position(|known| known.id == message.id));

                let record = match existing_position {
                    Some(position) => {
                        // Same id means the caller is finalizing a record it
                        // already appended; keep its confirmed timestamp.
                        let log = state.logs.entry(conversation_id).or_default();
                        let existing = &mut log[position];
                        existing.role = message.role;
                        existing.content = message.content;
                        existing.clone()
                    }
                    None => {
                        let last = state
                            .last_created_at
                            .get(&conversation_id)
                            .copied()
                            .unwrap_or(0);
                        let created_at = current_unix_millis().max(last + 1);
                        state.last_created_at.insert(conversation_id, created_at);

                        let record = MessageRecord {
                            id: message.id,
                            conversation_id,
                            role: message.role,
                            content: message.content,
                            created_at_unix_millis: Some(created_at),
                        };
                        state
                            .logs
                            .entry(conversation_id)
                            .or_default()
                            .push(record.clone());
                        record
                    }
                };

                let snapshot = state
                    .logs
                    .get(&conversation_id)
                    .cloned()
                    .unwrap_or_default();
                (record, snapshot, state.to_persisted())
            };

            self.message_subscribers
                .publish(Some(conversation_id), snapshot.as_slice());
            self.persist(persisted).await?;
            Ok(record)
        })
    }

    fn load_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.lock_state();
            Ok(state
                .logs
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn delete_all<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let persisted = {
                let mut state = self.lock_state();
                state.logs.remove(&conversation_id);
                state.last_created_at.remove(&conversation_id);
                state.to_persisted()
            };

            self.message_subscribers
                .publish(Some(conversation_id), &[]);
            self.persist(persisted).await
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

impl SessionRegistry for MemoryStore {
    fn list<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<RegistryEntry>>> {
        Box::pin(async move { Ok(self.lock_state().registry_snapshot()) })
    }

    fn upsert_summary<'a>(
        &'a self,
        conversation_id: ConversationId,
        title: String,
        updated_at_unix_millis: u64,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let (snapshot, persisted) = {
                let mut state = self.lock_state();
                state.registry.insert(
                    conversation_id,
                    RegistryEntry::new(conversation_id, title, updated_at_unix_millis),
                );
                (state.registry_snapshot(), state.to_persisted())
            };

            self.registry_subscribers.publish(None, snapshot.as_slice());
            self.persist(persisted).await
        })
    }

    fn remove<'a>(&'a self, conversation_id: ConversationId) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let (changed, snapshot, persisted) = {
                let mut state = self.lock_state();
                let changed = state.registry.remove(&conversation_id).is_some();
                (changed, state.registry_snapshot(), state.to_persisted())
            };

            if changed {
                self.registry_subscribers.publish(None, snapshot.as_slice());
                self.persist(persisted).await?;
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

async fn load_history_blob(blob_path: &Path) -> Option<PersistedHistory> {
    let raw = match tokio::fs::read_to_string(blob_path).await {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return None,
        Err(source) => {
            tracing::warn!(
                path = %blob_path.display(),
                error = %source,
                "history blob unreadable; starting with zero conversations"
            );
            return None;
        }
    };

    match serde_json::from_str::<PersistedHistory>(&raw) {
        Ok(persisted) => Some(persisted),
        Err(source) => {
            tracing::warn!(
                path = %blob_path.display(),
                error = %source,
                "history blob corrupt; starting with zero conversations"
            );
            None
        }
    }
}
