pub mod lifecycle;
pub mod message;
pub mod reconcile;
pub mod reconciler;

pub use lifecycle::LifecycleCoordinator;
pub use message::{
    ANSWER_FAILURE_MESSAGE, ANSWER_PENDING_PLACEHOLDER, Conversation, Message, MessageStatus,
    Role, SEEDED_GREETING, SubmissionRejection, SubmissionState, SubmissionTicket,
    SubmissionTransition, TITLE_MAX_CHARS, derive_title,
};
pub use reconcile::merge_views;
pub use reconciler::ConversationReconciler;
