pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod session;

pub use chat::{
    ANSWER_FAILURE_MESSAGE, ANSWER_PENDING_PLACEHOLDER, Conversation, ConversationReconciler,
    LifecycleCoordinator, Message, MessageStatus, Role, SEEDED_GREETING, SubmissionState,
    SubmissionTicket, merge_views,
};
pub use config::{AnswerSettings, HubConfig, StoreBackend};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, NoticeScope, SubmissionOutcome};
pub use session::SessionContext;
