use std::time::Duration;

use snafu::Snafu;

mod rig_adapter;

pub use futures::future::BoxFuture;
pub use rig_adapter::{RigAnswerClient, STUDY_ASSISTANT_PREAMBLE};

pub const DEFAULT_ANSWER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANSWER_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on history turns sent upstream; oldest turns drop first.
pub const DEFAULT_HISTORY_LIMIT: usize = 40;

pub type AnswerResult<T> = Result<T, AnswerError>;

/// Speaker role of one prior turn, as the remote responder sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior turn of the conversation, oldest first in a history sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRequest {
    pub question: String,
    pub history: Vec<HistoryTurn>,
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    /// History bounded to what the remote service accepts: the most recent
    /// `limit` turns, oldest truncated first.
    pub fn capped_history(&self, limit: usize) -> &[HistoryTurn] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AnswerError {
    #[snafu(display("answer service timed out after {waited_ms}ms on `{stage}`"))]
    Timeout { stage: &'static str, waited_ms: u64 },
    #[snafu(display("answer service failed on `{stage}`: {details}"))]
    Upstream {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("answer request rejected on `{stage}`: {details}"))]
    Invalid {
        stage: &'static str,
        details: String,
    },
}

/// Connection settings for the remote responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub history_limit: usize,
}

impl AnswerConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: DEFAULT_ANSWER_ENDPOINT.to_string(),
            model: DEFAULT_ANSWER_MODEL.to_string(),
            timeout: DEFAULT_ANSWER_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into().trim().to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }
}

/// Remote responder boundary: a question plus prior turns in, reply text out.
///
/// One call maps to one upstream request; no retries here. Single-flight per
/// conversation is the reconciler's rule, not this client's.
pub trait AnswerService: Send + Sync {
    fn ask<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, AnswerResult<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_history_keeps_the_most_recent_turns() {
        let request = AnswerRequest::new("next?").with_history(vec![
            HistoryTurn::user("one"),
            HistoryTurn::assistant("two"),
            HistoryTurn::user("three"),
        ]);

        let capped = request.capped_history(2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].content, "two");
        assert_eq!(capped[1].content, "three");
    }

    #[test]
    fn capped_history_with_room_to_spare_keeps_everything() {
        let request =
            AnswerRequest::new("next?").with_history(vec![HistoryTurn::user("only")]);
        assert_eq!(request.capped_history(10).len(), 1);
    }
}
