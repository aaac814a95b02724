use std::sync::Arc;

use snafu::ensure;

use studyhub_answer::{AnswerRequest, AnswerService, HistoryTurn, TurnRole};
use studyhub_store::{
    ConversationId, DEFAULT_CONVERSATION_TITLE, MessageId, MessageStore, NewMessage,
    SessionRegistry, current_unix_millis,
};

use crate::error::{
    ChatResult, EmptyQuestionSnafu, NotFoundSnafu, SubmissionInFlightSnafu,
};
use crate::events::{ChatEvent, NoticeScope, SubmissionOutcome};
use crate::session::SessionContext;

use super::message::{
    ANSWER_FAILURE_MESSAGE, Message, MessageStatus, Role, SubmissionRejection, SubmissionTicket,
    SubmissionTransition, derive_title,
};

/// Drives submissions for every open conversation: optimistic inserts,
/// placeholder replacement, persistence, and the registry summary.
///
/// Submissions are single-flight per conversation; different conversations
/// proceed in parallel.
pub struct ConversationReconciler {
    context: Arc<SessionContext>,
    answer: Arc<dyn AnswerService>,
}

impl ConversationReconciler {
    pub fn new(context: Arc<SessionContext>, answer: Arc<dyn AnswerService>) -> Self {
        Self { context, answer }
    }

    /// Accepts one user question for `conversation_id`.
    ///
    /// On acceptance the optimistic user message and the assistant
    /// placeholder are already visible, and the returned ticket identifies
    /// the in-flight submission; resolution lands in the background and is
    /// announced as [`ChatEvent::SubmissionResolved`]. Rejected submissions
    /// leave the conversation untouched.
    pub fn submit(
        &self,
        conversation_id: ConversationId,
        question: &str,
    ) -> ChatResult<SubmissionTicket> {
        let trimmed = question.trim();
        ensure!(
            !trimmed.is_empty(),
            EmptyQuestionSnafu {
                stage: "submit-validate",
            }
        );
        let question = trimmed.to_string();

        let user_id = MessageId::generate();
        let placeholder_id = MessageId::generate();

        let (ticket, history) = {
            let mut views = self.context.lock_views();
            let view = views.get_mut(&conversation_id).ok_or_else(|| {
                NotFoundSnafu {
                    stage: "submit-lookup",
                    conversation_id,
                }
                .build()
            })?;

            let ticket = SubmissionTicket::new(conversation_id, view.next_epoch);
            if let Err(rejection) = view
                .conversation
                .apply_submission_transition(SubmissionTransition::Start(ticket))
            {
                debug_assert!(matches!(
                    rejection,
                    SubmissionRejection::AlreadySubmitting { .. }
                ));
                return SubmissionInFlightSnafu {
                    stage: "submit-single-flight",
                    conversation_id,
                }
                .fail();
            }
            view.next_epoch += 1;

            // History reflects the conversation before this turn; an
            // unresolved placeholder from a previous epoch cannot exist here
            // because resolution always precedes the next accepted submit.
            let history: Vec<HistoryTurn> = view
                .conversation
                .messages
                .iter()
                .filter(|message| !message.is_placeholder())
                .map(|message| {
                    HistoryTurn::new(turn_role(message.role), message.content.clone())
                })
                .collect();

            view.conversation
                .messages
                .push(Message::user_optimistic(user_id, question.clone()));
            view.conversation
                .messages
                .push(Message::assistant_placeholder(placeholder_id));

            (ticket, history)
        };

        self.context.emit(ChatEvent::ConversationChanged { conversation_id });

        let run_context = self.context.clone();
        let answer = self.answer.clone();
        tokio::spawn(async move {
            run_submission(
                run_context,
                answer,
                ticket,
                user_id,
                placeholder_id,
                question,
                history,
            )
            .await;
        });

        Ok(ticket)
    }
}

fn turn_role(role: Role) -> TurnRole {
    match role {
        Role::User => TurnRole::User,
        Role::Assistant => TurnRole::Assistant,
    }
}

/// Persists the user entry, awaits the answer, replaces the placeholder in
/// place (same id, same position), persists the final entry, and bumps the
/// registry summary. Runs detached: switching the active conversation never
/// cancels it.
async fn run_submission(
    context: Arc<SessionContext>,
    answer: Arc<dyn AnswerService>,
    ticket: SubmissionTicket,
    user_id: MessageId,
    placeholder_id: MessageId,
    question: String,
    history: Vec<HistoryTurn>,
) {
    let conversation_id = ticket.conversation_id;

    // The user entry lands first so the log keeps its turn order. A failure
    // here degrades to a notice; the placeholder still awaits the answer.
    persist_message(
        &context,
        conversation_id,
        user_id,
        Role::User,
        question.clone(),
    )
    .await;

    let reply = answer
        .ask(AnswerRequest::new(question).with_history(history))
        .await;

    let (content, transition, outcome) = match reply {
        Ok(text) => (
            text,
            SubmissionTransition::Succeed(ticket),
            SubmissionOutcome::Succeeded,
        ),
        Err(error) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "answer service failed; recording the fixed failure message"
            );
            (
                ANSWER_FAILURE_MESSAGE.to_string(),
                SubmissionTransition::Fail {
                    ticket,
                    message: error.to_string(),
                },
                SubmissionOutcome::Failed,
            )
        }
    };

    let accepted = {
        let mut views = context.lock_views();
        let Some(view) = views.get_mut(&conversation_id) else {
            // The conversation was deleted mid-flight; nothing to land on.
            return;
        };

        match view.conversation.apply_submission_transition(transition) {
            Ok(_) => {
                if let Some(index) = view.conversation.message_index(placeholder_id) {
                    let message = &mut view.conversation.messages[index];
                    message.content = content.clone();
                    message.status = MessageStatus::Done;
                }
                true
            }
            Err(rejection) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    ?rejection,
                    "stale submission completion ignored"
                );
                false
            }
        }
    };
    if !accepted {
        return;
    }

    context.emit(ChatEvent::ConversationChanged { conversation_id });

    persist_message(
        &context,
        conversation_id,
        placeholder_id,
        Role::Assistant,
        content,
    )
    .await;
    update_summary(&context, conversation_id).await;

    context.emit(ChatEvent::SubmissionResolved { ticket, outcome });
}

/// Persists one view message and reflects the store-confirmed timestamp
/// back into the view. Failures degrade to an operation-scope notice.
async fn persist_message(
    context: &Arc<SessionContext>,
    conversation_id: ConversationId,
    message_id: MessageId,
    role: Role,
    content: String,
) {
    let store = context.store();
    let appended = store
        .append(
            conversation_id,
            NewMessage::new(message_id, role.to_store(), content),
        )
        .await;

    match appended {
        Ok(record) => {
            let confirmed = {
                let mut views = context.lock_views();
                views
                    .get_mut(&conversation_id)
                    .and_then(|view| {
                        let index = view.conversation.message_index(message_id)?;
                        let message = &mut view.conversation.messages[index];
                        if message.created_at_unix_millis == record.created_at_unix_millis {
                            None
                        } else {
                            message.created_at_unix_millis = record.created_at_unix_millis;
                            Some(())
                        }
                    })
                    .is_some()
            };
            if confirmed {
                context.emit(ChatEvent::ConversationChanged { conversation_id });
            }
        }
        Err(error) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                error = %error,
                "failed to persist message"
            );
            context.emit(ChatEvent::StoreNotice {
                conversation_id: Some(conversation_id),
                scope: NoticeScope::Operation,
                details: error.to_string(),
            });
        }
    }
}

/// Refreshes the registry summary after a resolved submission. The title is
/// derived once, from the first user message of a still-untitled
/// conversation, and never overwritten afterwards.
async fn update_summary(context: &Arc<SessionContext>, conversation_id: ConversationId) {
    let registry = context.registry_snapshot();
    let current_title = registry
        .iter()
        .find(|entry| entry.id == conversation_id)
        .map(|entry| entry.title.clone());

    let title = {
        let mut views = context.lock_views();
        let Some(view) = views.get_mut(&conversation_id) else {
            return;
        };

        let current_title =
            current_title.unwrap_or_else(|| view.conversation.title.clone());
        let title = if current_title == DEFAULT_CONVERSATION_TITLE {
            view.conversation
                .first_user_message()
                .map(|message| derive_title(&message.content))
                .filter(|derived| !derived.is_empty())
                .unwrap_or(current_title)
        } else {
            current_title
        };
        view.conversation.title = title.clone();
        title
    };

    let updated_at = current_unix_millis();
    if let Err(error) = context
        .store()
        .upsert_summary(conversation_id, title, updated_at)
        .await
    {
        tracing::warn!(
            conversation_id = %conversation_id,
            error = %error,
            "failed to update registry summary"
        );
        context.emit(ChatEvent::StoreNotice {
            conversation_id: Some(conversation_id),
            scope: NoticeScope::Operation,
            details: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use studyhub_answer::{AnswerError, AnswerResult, BoxFuture as AnswerFuture};
    use studyhub_store::{ConversationStore, MemoryStore};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::oneshot;

    use crate::chat::lifecycle::LifecycleCoordinator;
    use crate::chat::message::ANSWER_PENDING_PLACEHOLDER;
    use crate::error::ChatError;

    use super::*;

    struct ScriptedAnswers {
        replies: Mutex<VecDeque<AnswerResult<String>>>,
        requests: Mutex<Vec<AnswerRequest>>,
    }

    impl ScriptedAnswers {
        fn new(replies: Vec<AnswerResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn seen_requests(&self) -> Vec<AnswerRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl AnswerService for ScriptedAnswers {
        fn ask<'a>(&'a self, request: AnswerRequest) -> AnswerFuture<'a, AnswerResult<String>> {
            Box::pin(async move {
                self.requests.lock().expect("requests lock").push(request);
                self.replies
                    .lock()
                    .expect("replies lock")
                    .pop_front()
                    .unwrap_or_else(|| {
                        Err(AnswerError::Upstream {
                            stage: "scripted-exhausted",
                            details: "no scripted reply left".to_string(),
                        })
                    })
            })
        }
    }

    /// Holds its reply until the test releases the gate, so intermediate
    /// placeholder state can be observed deterministically.
    struct GatedAnswers {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        reply: String,
    }

    impl GatedAnswers {
        fn new(reply: &str) -> (Arc<Self>, oneshot::Sender<()>) {
            let (release, gate) = oneshot::channel();
            (
                Arc::new(Self {
                    gate: Mutex::new(Some(gate)),
                    reply: reply.to_string(),
                }),
                release,
            )
        }
    }

    impl AnswerService for GatedAnswers {
        fn ask<'a>(&'a self, _request: AnswerRequest) -> AnswerFuture<'a, AnswerResult<String>> {
            Box::pin(async move {
                let gate = self.gate.lock().expect("gate lock").take();
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(self.reply.clone())
            })
        }
    }

    fn hub(answer: Arc<dyn AnswerService>) -> (
        Arc<SessionContext>,
        ConversationReconciler,
        UnboundedReceiver<ChatEvent>,
    ) {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let (context, events) = SessionContext::new(store);
        let reconciler = ConversationReconciler::new(context.clone(), answer);
        (context, reconciler, events)
    }

    async fn open_empty_conversation(context: &Arc<SessionContext>) -> ConversationId {
        let conversation_id = ConversationId::generate();
        context
            .store()
            .upsert_summary(
                conversation_id,
                DEFAULT_CONVERSATION_TITLE.to_string(),
                current_unix_millis(),
            )
            .await
            .expect("seed registry entry");
        context
            .open_view(conversation_id, DEFAULT_CONVERSATION_TITLE.to_string())
            .await
            .expect("open view");
        conversation_id
    }

    async fn wait_for_resolution(events: &mut UnboundedReceiver<ChatEvent>) -> SubmissionOutcome {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ChatEvent::SubmissionResolved { outcome, .. } = event {
                    return outcome;
                }
            }
            panic!("event channel closed before the submission resolved");
        })
        .await
        .expect("submission resolves in time")
    }

    #[tokio::test]
    async fn each_completed_submission_adds_exactly_two_messages() {
        let answers = ScriptedAnswers::new(vec![
            Ok("4".to_string()),
            Err(AnswerError::Timeout {
                stage: "scripted",
                waited_ms: 1,
            }),
        ]);
        let (context, reconciler, mut events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        reconciler
            .submit(conversation_id, "What is 2+2?")
            .expect("first submit");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Succeeded
        );

        reconciler
            .submit(conversation_id, "And 3+3?")
            .expect("second submit");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Failed
        );

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(conversation.messages.len(), 4);
    }

    #[tokio::test]
    async fn second_submit_while_in_flight_is_rejected_without_new_messages() {
        let (answers, release) = GatedAnswers::new("4");
        let (context, reconciler, mut events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        reconciler
            .submit(conversation_id, "What is 2+2?")
            .expect("first submit");

        let rejection = reconciler
            .submit(conversation_id, "Impatient follow-up")
            .expect_err("second submit rejected");
        assert!(matches!(rejection, ChatError::SubmissionInFlight { .. }));

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(conversation.messages.len(), 2);

        release.send(()).expect("release gate");
        wait_for_resolution(&mut events).await;

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(conversation.messages.len(), 2);
    }

    #[tokio::test]
    async fn placeholder_resolution_keeps_id_and_position() {
        let (answers, release) = GatedAnswers::new("4");
        let (context, reconciler, mut events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        reconciler
            .submit(conversation_id, "What is 2+2?")
            .expect("submit");

        let before = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(before.messages.len(), 2);
        assert_eq!(before.messages[1].role, Role::Assistant);
        assert_eq!(before.messages[1].content, ANSWER_PENDING_PLACEHOLDER);
        assert!(before.messages[1].is_placeholder());
        let placeholder_id = before.messages[1].id;

        release.send(()).expect("release gate");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Succeeded
        );

        let after = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(after.messages.len(), 2);
        assert_eq!(after.messages[1].id, placeholder_id);
        assert_eq!(after.messages[1].content, "4");
        assert!(!after.messages[1].is_placeholder());
    }

    #[tokio::test]
    async fn failure_records_fixed_message_and_accepts_a_resubmit() {
        let answers = ScriptedAnswers::new(vec![
            Err(AnswerError::Timeout {
                stage: "scripted",
                waited_ms: 1,
            }),
            Ok("42".to_string()),
        ]);
        let (context, reconciler, mut events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        reconciler
            .submit(conversation_id, "Meaning of life?")
            .expect("submit");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Failed
        );

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(conversation.messages[1].content, ANSWER_FAILURE_MESSAGE);

        // Failure returned the machine to rest; the next submit is accepted.
        reconciler
            .submit(conversation_id, "Try again?")
            .expect("resubmit accepted");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Succeeded
        );

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert_eq!(conversation.messages.len(), 4);
        assert_eq!(conversation.messages[3].content, "42");
    }

    #[tokio::test]
    async fn blank_question_is_rejected_before_any_mutation() {
        let answers = ScriptedAnswers::new(vec![]);
        let (context, reconciler, _events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        let rejection = reconciler
            .submit(conversation_id, "   ")
            .expect_err("blank question rejected");
        assert!(matches!(rejection, ChatError::EmptyQuestion { .. }));

        let conversation = context
            .conversation_snapshot(conversation_id)
            .expect("snapshot");
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let answers = ScriptedAnswers::new(vec![]);
        let (_context, reconciler, _events) = hub(answers);

        let rejection = reconciler
            .submit(ConversationId::generate(), "Hello?")
            .expect_err("unknown conversation rejected");
        assert!(matches!(rejection, ChatError::NotFound { .. }));
    }

    #[tokio::test]
    async fn title_derives_once_from_the_first_user_message() {
        let answers =
            ScriptedAnswers::new(vec![Ok("sure".to_string()), Ok("again".to_string())]);
        let (context, reconciler, mut events) = hub(answers);
        let conversation_id = open_empty_conversation(&context).await;

        let first_question = "Explain photosynthesis in simple terms please";
        reconciler
            .submit(conversation_id, first_question)
            .expect("submit");
        wait_for_resolution(&mut events).await;

        let derived = derive_title(first_question);
        let entries = context.store().list().await.expect("list");
        assert_eq!(entries[0].title, derived);

        reconciler
            .submit(conversation_id, "A completely different question")
            .expect("submit");
        wait_for_resolution(&mut events).await;

        let entries = context.store().list().await.expect("list");
        assert_eq!(entries[0].title, derived);
    }

    #[tokio::test]
    async fn history_carries_prior_turns_but_never_the_placeholder() {
        let answers =
            ScriptedAnswers::new(vec![Ok("first".to_string()), Ok("second".to_string())]);
        let (context, reconciler, mut events) = hub(answers.clone());
        let conversation_id = open_empty_conversation(&context).await;

        reconciler
            .submit(conversation_id, "Question one")
            .expect("submit");
        wait_for_resolution(&mut events).await;
        reconciler
            .submit(conversation_id, "Question two")
            .expect("submit");
        wait_for_resolution(&mut events).await;

        let requests = answers.seen_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].question, "Question two");

        let history: Vec<(&TurnRole, &str)> = requests[1]
            .history
            .iter()
            .map(|turn| (&turn.role, turn.content.as_str()))
            .collect();
        assert_eq!(
            history,
            vec![
                (&TurnRole::User, "Question one"),
                (&TurnRole::Assistant, "first"),
            ]
        );
    }

    #[tokio::test]
    async fn submissions_to_different_conversations_run_in_parallel() {
        let (answers, release) = GatedAnswers::new("held");
        let (context, reconciler, mut events) = hub(answers);
        let first = open_empty_conversation(&context).await;
        let second = open_empty_conversation(&context).await;

        reconciler.submit(first, "Block first").expect("submit");
        // The second conversation is independent; its submit is accepted
        // while the first is still in flight.
        reconciler.submit(second, "Run second").expect("submit");

        release.send(()).expect("release gate");
        wait_for_resolution(&mut events).await;
        wait_for_resolution(&mut events).await;

        assert_eq!(
            context
                .conversation_snapshot(first)
                .expect("snapshot")
                .messages
                .len(),
            2
        );
        assert_eq!(
            context
                .conversation_snapshot(second)
                .expect("snapshot")
                .messages
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn switching_away_does_not_cancel_an_in_flight_submission() {
        let (answers, release) = GatedAnswers::new("landed later");
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let (context, mut events) = SessionContext::new(store);
        let lifecycle = LifecycleCoordinator::new(context.clone());
        let reconciler = ConversationReconciler::new(context.clone(), answers);

        let first = lifecycle.ensure_active().await.expect("ensure active");
        let second = lifecycle.new_conversation().await.expect("new conversation");
        lifecycle.switch_to(first).await.expect("switch back");

        reconciler.submit(first, "Slow question").expect("submit");
        lifecycle.switch_to(second).await.expect("switch away");

        release.send(()).expect("release gate");
        assert_eq!(
            wait_for_resolution(&mut events).await,
            SubmissionOutcome::Succeeded
        );

        // The background submission landed in the first conversation even
        // though it is no longer active.
        assert_eq!(context.active_conversation(), Some(second));
        let first_view = context.conversation_snapshot(first).expect("snapshot");
        let last = first_view.messages.last().expect("resolved message");
        assert_eq!(last.content, "landed later");
        assert!(!last.is_placeholder());
    }
}
