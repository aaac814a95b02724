use std::collections::VecDeque;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::mpsc::UnboundedReceiver;

use studyhub::chat::message::SEEDED_GREETING;
use studyhub::chat::{ANSWER_FAILURE_MESSAGE, ConversationReconciler, LifecycleCoordinator};
use studyhub::events::{ChatEvent, SubmissionOutcome};
use studyhub::session::SessionContext;
use studyhub_answer::{AnswerError, AnswerRequest, AnswerResult, AnswerService, BoxFuture};
use studyhub_store::{
    ConversationId, ConversationStore, MemoryStore, MessageStore, NewMessage, SessionRegistry,
    SqliteStore, StoreError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    data_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SeedFirstLoad,
    SubmitRoundtrip,
    SubmitFailure,
    SwitchAndDelete,
    RegistryOrder,
    BlobReload,
    SqliteRoundtrip,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "seed_first_load" => Some(Self::SeedFirstLoad),
            "submit_roundtrip" => Some(Self::SubmitRoundtrip),
            "submit_failure" => Some(Self::SubmitFailure),
            "switch_and_delete" => Some(Self::SwitchAndDelete),
            "registry_order" => Some(Self::RegistryOrder),
            "blob_reload" => Some(Self::BlobReload),
            "sqlite_roundtrip" => Some(Self::SqliteRoundtrip),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SeedFirstLoad => "seed_first_load",
            Self::SubmitRoundtrip => "submit_roundtrip",
            Self::SubmitFailure => "submit_failure",
            Self::SwitchAndDelete => "switch_and_delete",
            Self::RegistryOrder => "registry_order",
            Self::BlobReload => "blob_reload",
            Self::SqliteRoundtrip => "sqlite_roundtrip",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --data argument for scenario '{scenario}'"))]
    MissingDataPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("store operation failed: {source}"))]
    StoreFailed {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("chat operation failed: {source}"))]
    ChatFailed {
        stage: &'static str,
        source: studyhub::ChatError,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    match args.scenario {
        Scenario::SeedFirstLoad => run_seed_first_load().await?,
        Scenario::SubmitRoundtrip => run_submit_roundtrip().await?,
        Scenario::SubmitFailure => run_submit_failure().await?,
        Scenario::SwitchAndDelete => run_switch_and_delete().await?,
        Scenario::RegistryOrder => run_registry_order().await?,
        Scenario::BlobReload => {
            run_blob_reload(require_data_path(&args, "blob_reload")?).await?
        }
        Scenario::SqliteRoundtrip => run_sqlite_roundtrip().await?,
        Scenario::All => {
            run_seed_first_load().await?;
            run_submit_roundtrip().await?;
            run_submit_failure().await?;
            run_switch_and_delete().await?;
            run_registry_order().await?;
            run_sqlite_roundtrip().await?;
            if let Some(data_path) = args.data_path.as_deref() {
                run_blob_reload(data_path).await?;
            } else {
                println!("blob_reload=skipped (no --data)");
            }
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args<I: Iterator<Item = String>>(mut raw_args: I) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut data_path = None;

    while let Some(arg) = raw_args.next() {
        match arg.as_str() {
            "--scenario" => {
                let value = raw_args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args",
                    arg: "--scenario",
                })?;
                scenario = Some(Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args",
                    raw: value.clone(),
                })?);
            }
            "--data" => {
                data_path = Some(raw_args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args",
                    arg: "--data",
                })?);
            }
            other => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: other.to_string(),
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args",
        })?,
        data_path,
    })
}

fn require_data_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.data_path.as_deref().context(MissingDataPathSnafu {
        stage: "require-data-path",
        scenario,
    })
}

fn check(scenario: &'static str, condition: bool, reason: &str) -> RunnerResult<()> {
    if condition {
        Ok(())
    } else {
        ScenarioFailedSnafu {
            stage: "check",
            scenario,
            reason: reason.to_string(),
        }
        .fail()
    }
}

/// Canned responder used to exercise submissions without network access.
struct CannedAnswers {
    replies: Mutex<VecDeque<AnswerResult<String>>>,
}

impl CannedAnswers {
    fn new(replies: Vec<AnswerResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

impl AnswerService for CannedAnswers {
    fn ask<'a>(&'a self, _request: AnswerRequest) -> BoxFuture<'a, AnswerResult<String>> {
        Box::pin(async move {
            self.replies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| {
                    Err(AnswerError::Upstream {
                        stage: "canned-exhausted",
                        details: "no canned reply left".to_string(),
                    })
                })
        })
    }
}

async fn wait_for_resolution(
    events: &mut UnboundedReceiver<ChatEvent>,
    scenario: &'static str,
) -> RunnerResult<SubmissionOutcome> {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let ChatEvent::SubmissionResolved { outcome, .. } = event {
                return Some(outcome);
            }
        }
        None
    })
    .await;

    match waited {
        Ok(Some(outcome)) => Ok(outcome),
        Ok(None) => ScenarioFailedSnafu {
            stage: "wait-resolution",
            scenario,
            reason: "event channel closed before resolution".to_string(),
        }
        .fail(),
        Err(_) => ScenarioFailedSnafu {
            stage: "wait-resolution",
            scenario,
            reason: "submission did not resolve within 5s".to_string(),
        }
        .fail(),
    }
}

async fn run_seed_first_load() -> RunnerResult<()> {
    const SCENARIO: &str = "seed_first_load";
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let (context, _events) = SessionContext::new(store);
    let lifecycle = LifecycleCoordinator::new(context.clone());

    let active = lifecycle.ensure_active().await.context(ChatFailedSnafu {
        stage: "seed-ensure-active",
    })?;

    let entries = context.store().list().await.context(StoreFailedSnafu {
        stage: "seed-list",
    })?;
    check(SCENARIO, entries.len() == 1, "expected exactly one conversation")?;
    check(SCENARIO, entries[0].id == active, "active id must be registered")?;

    let conversation = context
        .conversation_snapshot(active)
        .context(ScenarioFailedSnafu {
            stage: "seed-snapshot",
            scenario: SCENARIO,
            reason: "active conversation has no view".to_string(),
        })?;
    check(
        SCENARIO,
        conversation.messages.len() == 1,
        "seeded conversation must hold one message",
    )?;
    check(
        SCENARIO,
        conversation.messages[0].content == SEEDED_GREETING,
        "seeded message must be the greeting",
    )?;

    println!("seed_first_load=ok active={active}");
    Ok(())
}

async fn run_submit_roundtrip() -> RunnerResult<()> {
    const SCENARIO: &str = "submit_roundtrip";
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let (context, mut events) = SessionContext::new(store);
    let lifecycle = LifecycleCoordinator::new(context.clone());
    let reconciler =
        ConversationReconciler::new(context.clone(), CannedAnswers::new(vec![Ok("4".to_string())]));

    let active = lifecycle.ensure_active().await.context(ChatFailedSnafu {
        stage: "roundtrip-ensure-active",
    })?;
    reconciler
        .submit(active, "What is 2+2?")
        .context(ChatFailedSnafu {
            stage: "roundtrip-submit",
        })?;

    let outcome = wait_for_resolution(&mut events, SCENARIO).await?;
    check(
        SCENARIO,
        outcome == SubmissionOutcome::Succeeded,
        "submission must succeed",
    )?;

    let conversation = context
        .conversation_snapshot(active)
        .context(ScenarioFailedSnafu {
            stage: "roundtrip-snapshot",
            scenario: SCENARIO,
            reason: "active conversation has no view".to_string(),
        })?;
    check(
        SCENARIO,
        conversation.messages.len() == 3,
        "greeting + user + assistant expected",
    )?;
    check(
        SCENARIO,
        conversation.messages[2].content == "4",
        "reply must replace the placeholder",
    )?;

    let log = context
        .store()
        .load_all(active)
        .await
        .context(StoreFailedSnafu {
            stage: "roundtrip-load",
        })?;
    check(SCENARIO, log.len() == 3, "store log must hold all three entries")?;

    println!("submit_roundtrip=ok messages={}", log.len());
    Ok(())
}

async fn run_submit_failure() -> RunnerResult<()> {
    const SCENARIO: &str = "submit_failure";
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let (context, mut events) = SessionContext::new(store);
    let lifecycle = LifecycleCoordinator::new(context.clone());
    let reconciler = ConversationReconciler::new(
        context.clone(),
        CannedAnswers::new(vec![
            Err(AnswerError::Timeout {
                stage: "canned",
                waited_ms: 1,
            }),
            Ok("recovered".to_string()),
        ]),
    );

    let active = lifecycle.ensure_active().await.context(ChatFailedSnafu {
        stage: "failure-ensure-active",
    })?;

    reconciler
        .submit(active, "Will this time out?")
        .context(ChatFailedSnafu {
            stage: "failure-submit",
        })?;
    let outcome = wait_for_resolution(&mut events, SCENARIO).await?;
    check(
        SCENARIO,
        outcome == SubmissionOutcome::Failed,
        "first submission must fail",
    )?;

    let conversation = context
        .conversation_snapshot(active)
        .context(ScenarioFailedSnafu {
            stage: "failure-snapshot",
            scenario: SCENARIO,
            reason: "active conversation has no view".to_string(),
        })?;
    let failure_recorded = conversation
        .messages
        .last()
        .is_some_and(|message| message.content == ANSWER_FAILURE_MESSAGE);
    check(
        SCENARIO,
        failure_recorded,
        "placeholder must become the fixed failure message",
    )?;

    // Failure returns the conversation to rest; a resubmit is accepted.
    reconciler
        .submit(active, "Second try")
        .context(ChatFailedSnafu {
            stage: "failure-resubmit",
        })?;
    let outcome = wait_for_resolution(&mut events, SCENARIO).await?;
    check(
        SCENARIO,
        outcome == SubmissionOutcome::Succeeded,
        "resubmit must succeed",
    )?;

    println!("submit_failure=ok");
    Ok(())
}

async fn run_switch_and_delete() -> RunnerResult<()> {
    const SCENARIO: &str = "switch_and_delete";
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let (context, _events) = SessionContext::new(store);
    let lifecycle = LifecycleCoordinator::new(context.clone());

    let first = lifecycle.ensure_active().await.context(ChatFailedSnafu {
        stage: "switch-ensure-active",
    })?;
    let second = lifecycle.new_conversation().await.context(ChatFailedSnafu {
        stage: "switch-new",
    })?;

    lifecycle.switch_to(second).await.context(ChatFailedSnafu {
        stage: "switch-to-second",
    })?;
    lifecycle
        .delete_conversation(first)
        .await
        .context(ChatFailedSnafu {
            stage: "switch-delete-first",
        })?;

    check(
        SCENARIO,
        context.active_conversation() == Some(second),
        "active id must stay on the survivor",
    )?;
    let entries = context.store().list().await.context(StoreFailedSnafu {
        stage: "switch-list",
    })?;
    check(SCENARIO, entries.len() == 1, "one conversation must remain")?;
    check(
        SCENARIO,
        entries[0].id == second,
        "survivor must be the remaining entry",
    )?;

    println!("switch_and_delete=ok");
    Ok(())
}

async fn run_registry_order() -> RunnerResult<()> {
    const SCENARIO: &str = "registry_order";
    let store = MemoryStore::new();

    for (index, updated_at) in [300_u64, 100, 200].iter().enumerate() {
        store
            .upsert_summary(
                ConversationId::generate(),
                format!("conversation-{index}"),
                *updated_at,
            )
            .await
            .context(StoreFailedSnafu {
                stage: "order-upsert",
            })?;
    }

    let entries = store.list().await.context(StoreFailedSnafu {
        stage: "order-list",
    })?;
    let listed: Vec<u64> = entries
        .iter()
        .map(|entry| entry.updated_at_unix_millis)
        .collect();
    check(
        SCENARIO,
        listed == vec![300, 200, 100],
        "registry must list most-recent first",
    )?;

    println!("registry_order=ok");
    Ok(())
}

async fn run_blob_reload(data_path: &str) -> RunnerResult<()> {
    const SCENARIO: &str = "blob_reload";
    let blob_path = std::path::Path::new(data_path).join("qa-history.json");

    let conversation_id = ConversationId::generate();
    {
        let store = MemoryStore::open(blob_path.clone()).await;
        store
            .upsert_summary(conversation_id, "reload-check".to_string(), 42)
            .await
            .context(StoreFailedSnafu {
                stage: "blob-upsert",
            })?;
        store
            .append(conversation_id, NewMessage::user("persisted line"))
            .await
            .context(StoreFailedSnafu {
                stage: "blob-append",
            })?;
    }

    let reopened = MemoryStore::open(blob_path).await;
    let entries = reopened.list().await.context(StoreFailedSnafu {
        stage: "blob-list",
    })?;
    check(SCENARIO, entries.len() == 1, "blob must restore the registry")?;
    let log = reopened
        .load_all(conversation_id)
        .await
        .context(StoreFailedSnafu {
            stage: "blob-load",
        })?;
    check(SCENARIO, log.len() == 1, "blob must restore the log")?;

    println!("blob_reload=ok");
    Ok(())
}

async fn run_sqlite_roundtrip() -> RunnerResult<()> {
    const SCENARIO: &str = "sqlite_roundtrip";
    let store = SqliteStore::open_in_memory()
        .await
        .context(StoreFailedSnafu {
            stage: "sqlite-open",
        })?;

    let conversation_id = ConversationId::generate();
    store
        .upsert_summary(conversation_id, "sqlite-check".to_string(), 7)
        .await
        .context(StoreFailedSnafu {
            stage: "sqlite-upsert",
        })?;
    let first = store
        .append(conversation_id, NewMessage::user("first"))
        .await
        .context(StoreFailedSnafu {
            stage: "sqlite-append",
        })?;
    let second = store
        .append(conversation_id, NewMessage::assistant("second"))
        .await
        .context(StoreFailedSnafu {
            stage: "sqlite-append",
        })?;

    check(
        SCENARIO,
        second.created_at_unix_millis > first.created_at_unix_millis,
        "sqlite timestamps must increase",
    )?;
    let log = store
        .load_all(conversation_id)
        .await
        .context(StoreFailedSnafu {
            stage: "sqlite-load",
        })?;
    check(SCENARIO, log.len() == 2, "sqlite log must hold both entries")?;

    println!("sqlite_roundtrip=ok");
    Ok(())
}
