use studyhub_store::{ConversationId, MessageId, MessageRecord, MessageRole};

/// Sentinel shown in place of the assistant reply while it is being produced.
pub const ANSWER_PENDING_PLACEHOLDER: &str = "…";
/// Deterministic wording recorded when the answer service fails.
pub const ANSWER_FAILURE_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";
/// First message of every fresh conversation.
pub const SEEDED_GREETING: &str = "Hello! I'm StudyBot. How can I help you today?";
/// Bound applied when deriving a title from the first user message.
pub const TITLE_MAX_CHARS: usize = 30;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub(crate) fn from_store(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }

    pub(crate) fn to_store(self) -> MessageRole {
        match self {
            Self::User => MessageRole::User,
            Self::Assistant => MessageRole::Assistant,
        }
    }
}

/// Placeholder lifecycle of one message.
///
/// `Pending` marks the assistant slot that is still awaiting its real
/// content. Store confirmation is tracked separately, by the presence of
/// `created_at_unix_millis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Done,
}

/// View-level message: what a conversation pane renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_unix_millis: Option<u64>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at_unix_millis: None,
            status,
        }
    }

    /// User message made visible before the store confirms it.
    pub fn user_optimistic(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content, MessageStatus::Done)
    }

    /// Assistant slot inserted at submit time; the id survives replacement.
    pub fn assistant_placeholder(id: MessageId) -> Self {
        Self::new(
            id,
            Role::Assistant,
            ANSWER_PENDING_PLACEHOLDER,
            MessageStatus::Pending,
        )
    }

    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            id: record.id,
            role: Role::from_store(record.role),
            content: record.content.clone(),
            created_at_unix_millis: record.created_at_unix_millis,
            status: MessageStatus::Done,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

/// Guard for one submission attempt.
///
/// The epoch changes on every submit, so a completion that lost a race is
/// rejected instead of clobbering a newer submission's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionTicket {
    pub conversation_id: ConversationId,
    pub epoch: u64,
}

impl SubmissionTicket {
    pub const fn new(conversation_id: ConversationId, epoch: u64) -> Self {
        Self {
            conversation_id,
            epoch,
        }
    }
}

/// Submission lifecycle boundary for one conversation.
///
/// `Succeeded`/`Failed` are resting states: they record the last outcome and
/// accept the next submission exactly as `Idle` does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubmissionState {
    #[default]
    Idle,
    Submitting(SubmissionTicket),
    Succeeded(SubmissionTicket),
    Failed {
        ticket: SubmissionTicket,
        message: String,
    },
}

/// State transition input for the submission lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionTransition {
    Start(SubmissionTicket),
    Succeed(SubmissionTicket),
    Fail {
        ticket: SubmissionTicket,
        message: String,
    },
    ResetToIdle,
}

/// Rejection reason for illegal submission transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionRejection {
    AlreadySubmitting {
        active: SubmissionTicket,
        attempted: SubmissionTicket,
    },
    NoActiveSubmission,
    TicketMismatch {
        active: SubmissionTicket,
        attempted: SubmissionTicket,
    },
}

pub type SubmissionResult = Result<SubmissionState, SubmissionRejection>;

impl SubmissionState {
    /// Returns the in-flight ticket if and only if a submission is running.
    pub fn active_ticket(&self) -> Option<SubmissionTicket> {
        match self {
            Self::Submitting(ticket) => Some(*ticket),
            Self::Idle | Self::Succeeded(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_submitting(&self) -> bool {
        matches!(self, Self::Submitting(_))
    }

    /// Applies one transition deterministically.
    ///
    /// Any resting state may start a new submission. Terminal transitions
    /// (`Succeed`/`Fail`) must carry the currently active ticket exactly.
    pub fn apply(&self, transition: SubmissionTransition) -> SubmissionResult {
        match transition {
            SubmissionTransition::Start(ticket) => self.apply_start(ticket),
            SubmissionTransition::Succeed(ticket) => self.apply_succeed(ticket),
            SubmissionTransition::Fail { ticket, message } => self.apply_fail(ticket, message),
            SubmissionTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, ticket: SubmissionTicket) -> SubmissionResult {
        match self {
            Self::Submitting(active) => Err(SubmissionRejection::AlreadySubmitting {
                active: *active,
                attempted: ticket,
            }),
            Self::Idle | Self::Succeeded(_) | Self::Failed { .. } => {
                Ok(Self::Submitting(ticket))
            }
        }
    }

    fn apply_succeed(&self, ticket: SubmissionTicket) -> SubmissionResult {
        match self {
            Self::Submitting(active) if *active == ticket => Ok(Self::Succeeded(ticket)),
            Self::Submitting(active) => Err(SubmissionRejection::TicketMismatch {
                active: *active,
                attempted: ticket,
            }),
            Self::Idle | Self::Succeeded(_) | Self::Failed { .. } => {
                Err(SubmissionRejection::NoActiveSubmission)
            }
        }
    }

    fn apply_fail(&self, ticket: SubmissionTicket, message: String) -> SubmissionResult {
        match self {
            Self::Submitting(active) if *active == ticket => {
                Ok(Self::Failed { ticket, message })
            }
            Self::Submitting(active) => Err(SubmissionRejection::TicketMismatch {
                active: *active,
                attempted: ticket,
            }),
            Self::Idle | Self::Succeeded(_) | Self::Failed { .. } => {
                Err(SubmissionRejection::NoActiveSubmission)
            }
        }
    }
}

/// Conversation aggregate root for chat state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
    pub submission: SubmissionState,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            submission: SubmissionState::Idle,
        }
    }

    /// Applies a submission transition, committing the new state on success.
    pub fn apply_submission_transition(
        &mut self,
        transition: SubmissionTransition,
    ) -> SubmissionResult {
        let next_state = self.submission.apply(transition)?;
        self.submission = next_state.clone();
        Ok(next_state)
    }

    pub fn message_index(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    /// First user turn, the source of a derived title.
    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.role == Role::User)
    }
}

/// Title derived from the first user message, bounded and boundary-safe.
pub fn derive_title(first_user_content: &str) -> String {
    first_user_content.chars().take(TITLE_MAX_CHARS).collect()
}
