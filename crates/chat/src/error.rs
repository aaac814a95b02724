use snafu::Snafu;
use studyhub_store::{ConversationId, StoreError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    NotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("cannot submit an empty question"))]
    EmptyQuestion { stage: &'static str },
    #[snafu(display("a submission is already in flight for conversation '{conversation_id}'"))]
    SubmissionInFlight {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("store operation failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
