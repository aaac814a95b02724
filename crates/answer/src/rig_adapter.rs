use rig::completion::{AssistantContent, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::ensure;

use super::{
    AnswerConfig, AnswerRequest, AnswerResult, AnswerService, BoxFuture, HistoryTurn,
    InvalidSnafu, TimeoutSnafu, TurnRole, UpstreamSnafu,
};

/// Fixed responder persona; the reconciler never inspects or alters it.
pub const STUDY_ASSISTANT_PREAMBLE: &str = "You are StudyBot, a friendly and helpful study \
assistant. A student has asked you a question. Provide a concise and helpful answer to the \
student's question.";

/// OpenAI-compatible answer client built on rig.
#[derive(Debug)]
pub struct RigAnswerClient {
    config: AnswerConfig,
}

impl RigAnswerClient {
    pub fn new(config: AnswerConfig) -> AnswerResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            InvalidSnafu {
                stage: "rig-answer-new",
                details: "missing api key",
            }
        );

        Ok(Self { config })
    }

    fn build_client(&self) -> AnswerResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(self.config.api_key.as_str());
        if !self.config.endpoint.is_empty() {
            builder = builder.base_url(self.config.endpoint.as_str());
        }
        builder.build().map_err(|source| {
            UpstreamSnafu {
                stage: "build-client",
                details: source.to_string(),
            }
            .build()
        })
    }

    fn to_rig_message(turn: &HistoryTurn) -> RigMessage {
        match turn.role {
            TurnRole::User => RigMessage::user(turn.content.clone()),
            TurnRole::Assistant => RigMessage::assistant(turn.content.clone()),
        }
    }

    async fn request_completion(&self, request: &AnswerRequest) -> AnswerResult<String> {
        let client = self.build_client()?;
        let model = client.completion_model(self.config.model.as_str());

        let history = request
            .capped_history(self.config.history_limit)
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();
        let dropped_turns = request.history.len().saturating_sub(history.len());
        if dropped_turns > 0 {
            tracing::debug!(
                dropped_turns,
                history_limit = self.config.history_limit,
                "history over the configured bound; oldest turns truncated"
            );
        }

        let response = model
            .completion_request(RigMessage::user(request.question.clone()))
            .messages(history)
            .preamble(STUDY_ASSISTANT_PREAMBLE.to_string())
            .send()
            .await
            .map_err(|source| {
                UpstreamSnafu {
                    stage: "send-completion",
                    details: source.to_string(),
                }
                .build()
            })?;

        let reply = response
            .choice
            .into_iter()
            .find_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .unwrap_or_default();

        let reply = reply.trim().to_string();
        ensure!(
            !reply.is_empty(),
            UpstreamSnafu {
                stage: "read-completion",
                details: "remote returned empty output",
            }
        );

        Ok(reply)
    }
}

impl AnswerService for RigAnswerClient {
    fn ask<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, AnswerResult<String>> {
        Box::pin(async move {
            ensure!(
                !request.question.trim().is_empty(),
                InvalidSnafu {
                    stage: "ask-validate",
                    details: "question is empty after trimming",
                }
            );

            let waited_ms = self.config.timeout.as_millis() as u64;
            match tokio::time::timeout(self.config.timeout, self.request_completion(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        model = %self.config.model,
                        waited_ms,
                        "answer request exceeded its deadline"
                    );
                    TimeoutSnafu {
                        stage: "ask-await",
                        waited_ms,
                    }
                    .fail()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_an_api_key() {
        let error = RigAnswerClient::new(AnswerConfig::new("  ")).expect_err("must reject");
        assert!(matches!(error, crate::AnswerError::Invalid { .. }));
    }

    #[tokio::test]
    async fn blank_question_is_rejected_before_any_network_io() {
        let client = RigAnswerClient::new(AnswerConfig::new("test-key")).expect("client");
        let error = client
            .ask(AnswerRequest::new("   "))
            .await
            .expect_err("must reject");
        assert!(matches!(error, crate::AnswerError::Invalid { .. }));
    }
}
