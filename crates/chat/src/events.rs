use studyhub_store::ConversationId;

use crate::chat::message::SubmissionTicket;

/// Blast radius of a store notice: a broken change stream versus one failed
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeScope {
    Connection,
    Operation,
}

/// How a submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionOutcome {
    Succeeded,
    Failed,
}

/// Everything the core reports to its observers.
///
/// Nothing here is fatal: each event describes one conversation, one
/// submission, or one store edge degrading, never the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A conversation's merged view changed and should be re-read.
    ConversationChanged { conversation_id: ConversationId },
    /// The conversation listing changed (order, titles, membership).
    RegistryChanged,
    /// The active-conversation pointer moved.
    ActiveChanged { conversation_id: ConversationId },
    /// An in-flight submission reached its terminal state.
    SubmissionResolved {
        ticket: SubmissionTicket,
        outcome: SubmissionOutcome,
    },
    /// Non-fatal store degradation, surfaced instead of thrown.
    StoreNotice {
        conversation_id: Option<ConversationId>,
        scope: NoticeScope,
        details: String,
    },
}
