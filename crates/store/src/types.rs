use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title a conversation carries until its first user turn names it.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Store-level speaker role, decoupled from view-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One confirmed (or confirming) entry of a conversation log.
///
/// `created_at_unix_millis` is `None` only while the write is still in
/// flight; once the store confirms it, the value is assigned by the store and
/// is strictly increasing within the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_millis: Option<u64>,
}

/// Append input. The id is minted by the caller so a message keeps one
/// identity from optimistic insert through store confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn new(id: MessageId, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageId::generate(), MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageId::generate(), MessageRole::Assistant, content)
    }
}

/// Lightweight projection of a conversation for list views, kept so the chat
/// list renders without loading full message logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: ConversationId,
    pub title: String,
    pub updated_at_unix_millis: u64,
}

impl RegistryEntry {
    pub fn new(
        id: ConversationId,
        title: impl Into<String>,
        updated_at_unix_millis: u64,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            updated_at_unix_millis,
        }
    }
}

/// Most-recently-active first; equal timestamps fall back to id ascending so
/// every backing produces the same listing.
pub fn compare_recent_first(left: &RegistryEntry, right: &RegistryEntry) -> Ordering {
    right
        .updated_at_unix_millis
        .cmp(&left.updated_at_unix_millis)
        .then_with(|| left.id.cmp(&right.id))
}

pub fn sort_registry_entries(entries: &mut [RegistryEntry]) {
    entries.sort_by(compare_recent_first);
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(nibble: u8, updated_at: u64) -> RegistryEntry {
        let raw = Uuid::from_u128(nibble as u128);
        RegistryEntry::new(ConversationId::from(raw), "untitled", updated_at)
    }

    #[test]
    fn registry_sorts_most_recent_first() {
        let mut entries = vec![entry(1, 10), entry(2, 30), entry(3, 20)];
        sort_registry_entries(&mut entries);
        let order: Vec<u64> = entries
            .iter()
            .map(|entry| entry.updated_at_unix_millis)
            .collect();
        assert_eq!(order, vec![30, 20, 10]);
    }

    #[test]
    fn registry_ties_break_by_id_ascending() {
        let mut entries = vec![entry(9, 50), entry(2, 50), entry(5, 50)];
        sort_registry_entries(&mut entries);
        let ids: Vec<ConversationId> = entries.iter().map(|entry| entry.id).collect();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(ids, expected);
    }
}
