//! End-to-end run lifecycles against a scripted model and a stub tool
//! executor, driven one `process_next` at a time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use assistants_engine::error::{DatabaseError, Error, LlmError};
use assistants_engine::jobs::{JobHandler, NoopTrigger, Trigger};
use assistants_engine::llm::provider::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatRole, ChunkReceiver,
    FunctionCallDelta, LlmProvider, ToolCallDelta,
};
use assistants_engine::runs::events::EventName;
use assistants_engine::runs::model::{AssistantTool, ErrorCode, Role, StepType};
use assistants_engine::runs::ops::{CreateAssistant, CreateRun, CreateThread, NewMessage, ToolOutput};
use assistants_engine::runs::{
    MessageStatus, Run, RunService, RunStatus, RunWorker, StepStatus, SystemStatus,
};
use assistants_engine::store::{Database, LibSqlBackend, RunBatch};
use assistants_engine::tools::executor::ExecError;
use assistants_engine::tools::{Confirmer, ToolExecutor, ToolRegistry, ToolStepWorker};

/// One scripted answer to a `stream` call.
enum Reply {
    Chunks(Vec<ChatCompletionChunk>),
    /// Fragments, then an upstream error on the open stream.
    Broken(Vec<ChatCompletionChunk>, u16),
    /// The call itself is rejected with this status.
    Refused(u16),
}

fn upstream(status: u16) -> LlmError {
    LlmError::Status {
        status,
        message: "scripted failure".into(),
    }
}

/// Replays one scripted reply per `stream` call.
#[derive(Default)]
struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        Err(LlmError::StreamFault("scripted provider only streams".into()))
    }

    async fn stream(
        &self,
        request: ChatCompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<ChunkReceiver, LlmError> {
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Refused(500));
        let (chunks, fault) = match reply {
            Reply::Chunks(chunks) => (chunks, None),
            Reply::Broken(chunks, status) => (chunks, Some(status)),
            Reply::Refused(status) => return Err(upstream(status)),
        };
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(status) = fault {
                let _ = tx.send(Err(upstream(status))).await;
            }
        });
        Ok(rx)
    }
}

/// Counts executions; never touches the system.
#[derive(Default)]
struct StubExecutor {
    ran: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolExecutor for StubExecutor {
    async fn run(
        &self,
        program: &str,
        _env: &BTreeMap<String, String>,
        _input: &str,
        _cancel: CancellationToken,
    ) -> Result<String, ExecError> {
        self.ran.lock().unwrap().push(program.to_string());
        Ok("stub output".to_string())
    }
}

fn tool_call(id: &str, name: &str, arguments: &str) -> ChatCompletionChunk {
    ChatCompletionChunk::tool_call(ToolCallDelta {
        index: 0,
        id: Some(id.into()),
        function: Some(FunctionCallDelta {
            name: Some(name.into()),
            arguments: Some(arguments.into()),
        }),
    })
}

struct Harness {
    db: Arc<dyn Database>,
    service: RunService,
    llm: Arc<ScriptedLlm>,
}

impl Harness {
    async fn new(scripts: Vec<Vec<ChatCompletionChunk>>) -> Self {
        Self::with_replies(scripts.into_iter().map(Reply::Chunks).collect()).await
    }

    async fn with_replies(replies: Vec<Reply>) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let trigger: Arc<dyn Trigger> = Arc::new(NoopTrigger);
        let service = RunService::new(db.clone(), trigger, Duration::from_secs(600), "gpt-test");
        Self {
            db,
            service,
            llm: Arc::new(ScriptedLlm::new(replies)),
        }
    }

    fn run_worker(&self) -> RunWorker {
        RunWorker::new(
            self.db.clone(),
            self.llm.clone(),
            Arc::new(ToolRegistry::with_defaults()),
            Arc::new(NoopTrigger),
            Arc::new(NoopTrigger),
            "model-worker",
        )
        .with_cancel_poll_interval(Duration::from_millis(20))
    }

    /// Create an assistant, a thread holding `messages`, and a queued run.
    async fn start(&self, tools: Vec<AssistantTool>, messages: &[&str]) -> (String, String) {
        let assistant = self
            .service
            .create_assistant(CreateAssistant {
                tools,
                ..Default::default()
            })
            .await
            .unwrap();
        let thread = self
            .service
            .create_thread(CreateThread {
                metadata: serde_json::json!({}),
                messages: messages
                    .iter()
                    .map(|m| NewMessage {
                        content: m.to_string(),
                    })
                    .collect(),
            })
            .await
            .unwrap();
        let run = self
            .service
            .create_run(
                &thread.id,
                CreateRun {
                    assistant_id: assistant.id,
                    model: None,
                    instructions: None,
                    additional_instructions: None,
                    tools: None,
                    stream: false,
                },
            )
            .await
            .unwrap();
        (thread.id, run.id)
    }

    /// The run failed, said so last, and let go of its thread.
    async fn assert_failed(&self, thread_id: &str, run_id: &str) -> Run {
        let run = self.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.failed_at.is_some());

        let names = self.event_names(run_id).await;
        assert_eq!(names.last().map(String::as_str), Some(EventName::RunFailed.as_str()));

        let thread = self.db.get_thread(thread_id).await.unwrap().unwrap();
        assert!(thread.locked_by_run_id.is_none());
        run
    }

    async fn event_names(&self, run_id: &str) -> Vec<String> {
        self.db
            .list_run_events(run_id, 0, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_name)
            .collect()
    }
}

#[tokio::test]
async fn message_turn_completes_run() {
    let h = Harness::new(vec![vec![
        ChatCompletionChunk::text("Hel"),
        ChatCompletionChunk::text("lo"),
    ]])
    .await;
    let (thread_id, run_id) = h.start(vec![], &[]).await;

    assert!(h.run_worker().process_next().await.unwrap());

    let messages = h.db.list_messages(&thread_id, 100).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].content, "Hello");

    let steps = h.db.list_run_steps(&run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_type, StepType::MessageCreation);
    assert_eq!(steps[0].status, StepStatus::Completed);

    let names = h.event_names(&run_id).await;
    assert_eq!(names.last().map(String::as_str), Some(EventName::RunCompleted.as_str()));

    let events = h.db.list_run_events(&run_id, 0, 1000).await.unwrap();
    let indexes: Vec<i64> = events.iter().map(|e| e.response_idx).collect();
    let expected: Vec<i64> = (1..=events.len() as i64).collect();
    assert_eq!(indexes, expected);

    let thread = h.db.get_thread(&thread_id).await.unwrap().unwrap();
    assert!(thread.locked_by_run_id.is_none());
}

#[tokio::test]
async fn function_call_waits_for_client_outputs() {
    let h = Harness::new(vec![
        vec![tool_call("call-1", "get_weather", r#"{"city":"Oslo"}"#)],
        vec![ChatCompletionChunk::text("It is sunny.")],
    ])
    .await;
    let (thread_id, run_id) = h.start(vec![], &["weather in Oslo?"]).await;

    h.run_worker().process_next().await.unwrap();

    let run = h.service.get_run(&thread_id, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::RequiresAction);
    let public = serde_json::to_value(run.to_public()).unwrap();
    let calls = &public["required_action"]["submit_tool_outputs"]["tool_calls"];
    assert_eq!(calls.as_array().unwrap().len(), 1);
    assert_eq!(calls[0]["id"], "call-1");
    assert_eq!(calls[0]["function"]["name"], "get_weather");
    let thread = h.db.get_thread(&thread_id).await.unwrap().unwrap();
    assert_eq!(thread.locked_by_run_id.as_deref(), Some(run_id.as_str()));

    // Nothing to do until the client answers.
    assert!(!h.run_worker().process_next().await.unwrap());

    h.service
        .submit_tool_outputs(
            &thread_id,
            &run_id,
            vec![ToolOutput {
                tool_call_id: "call-1".into(),
                output: "sunny".into(),
            }],
        )
        .await
        .unwrap();
    assert!(h.run_worker().process_next().await.unwrap());

    let run = h.service.get_run(&thread_id, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let requests = h.llm.requests.lock().unwrap();
    let history = &requests[1].messages;
    assert_eq!(history[0].role, ChatRole::User);
    assert_eq!(history[1].role, ChatRole::Assistant);
    assert_eq!(history[1].tool_calls.len(), 1);
    assert_eq!(history[2].role, ChatRole::Tool);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(history[2].content.as_deref(), Some("sunny"));
}

#[tokio::test]
async fn stalled_stream_fails_run() {
    let h = Harness::new(vec![vec![]]).await;
    let (thread_id, run_id) = h.start(vec![], &["hello"]).await;

    assert!(h.run_worker().process_next().await.unwrap());

    let run = h.assert_failed(&thread_id, &run_id).await;
    let last_error = run.last_error.unwrap();
    assert_eq!(last_error.code, ErrorCode::ServerError);
    assert!(last_error.message.contains("neither a message nor tool calls"));
    assert!(h.db.list_run_steps(&run_id).await.unwrap().is_empty());
    assert_eq!(h.db.list_messages(&thread_id, 100).await.unwrap().len(), 1);

    // The thread takes messages again.
    h.service
        .add_message(&thread_id, NewMessage { content: "again".into() })
        .await
        .unwrap();
}

#[tokio::test]
async fn rate_limited_model_call_fails_run() {
    let h = Harness::with_replies(vec![Reply::Refused(429)]).await;
    let (thread_id, run_id) = h.start(vec![], &["hello"]).await;

    assert!(h.run_worker().process_next().await.unwrap());

    let run = h.assert_failed(&thread_id, &run_id).await;
    assert_eq!(run.last_error.unwrap().code, ErrorCode::RateLimitExceeded);
    assert!(h.db.list_run_steps(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn broken_stream_fails_message_and_step() {
    let h = Harness::with_replies(vec![Reply::Broken(
        vec![ChatCompletionChunk::text("Hel")],
        503,
    )])
    .await;
    let (thread_id, run_id) = h.start(vec![], &[]).await;

    assert!(h.run_worker().process_next().await.unwrap());

    let run = h.assert_failed(&thread_id, &run_id).await;
    assert_eq!(run.last_error.unwrap().code, ErrorCode::ServerError);

    let steps = h.db.list_run_steps(&run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    let messages = h.db.list_messages(&thread_id, 100).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Incomplete);
    assert_eq!(messages[0].content, "Hel");
}

#[tokio::test]
async fn claim_aborts_when_lock_points_elsewhere() {
    let h = Harness::new(vec![]).await;
    let (thread_id, first_id) = h.start(vec![], &[]).await;

    // A second queued run on the same thread that never took the lock.
    let first = h.db.get_run(&first_id).await.unwrap().unwrap();
    let assistant = h.db.get_assistant(&first.assistant_id).await.unwrap().unwrap();
    let mut intruder = Run::queued(&thread_id, &assistant, 600);
    intruder.created_at = first.created_at + 10;
    h.db.apply_run_batch(RunBatch::new(&intruder.id).put_run(&intruder))
        .await
        .unwrap();

    let err = h.run_worker().process_next().await.unwrap_err();
    assert!(matches!(err, Error::Database(DatabaseError::LockMismatch { .. })));

    let stored = h.db.get_run(&intruder.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Queued);
    assert!(stored.claimed_by.is_none());
    assert!(stored.started_at.is_none());
    assert!(h.event_names(&intruder.id).await.is_empty());
}

#[tokio::test]
async fn unconfirmed_builtin_never_executes() {
    let h = Harness::new(vec![vec![tool_call(
        "call-1",
        "sys_shell",
        r#"{"command":"rm -rf /tmp/never"}"#,
    )]])
    .await;
    let tools = vec![AssistantTool::Builtin {
        name: "sys_shell".into(),
    }];
    let (thread_id, run_id) = h.start(tools, &["clean up"]).await;

    h.run_worker().process_next().await.unwrap();
    let run = h.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::InProgress);
    assert_eq!(run.system_status, Some(SystemStatus::RequiresAction));

    // Shutting down before anyone answers counts as a timeout.
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let executor = Arc::new(StubExecutor::default());
    let confirmer = Confirmer::new(h.db.clone(), true, Duration::from_millis(20), Duration::from_secs(10));
    let worker = ToolStepWorker::new(
        h.db.clone(),
        Arc::new(ToolRegistry::with_defaults()),
        executor.clone(),
        confirmer,
        Arc::new(NoopTrigger),
        Arc::new(NoopTrigger),
        "tool-worker",
    )
    .with_shutdown(shutdown);

    assert!(worker.process_next().await.unwrap());

    assert!(executor.ran.lock().unwrap().is_empty());
    let run = h.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().message.contains("call-1"));
    let thread = h.db.get_thread(&thread_id).await.unwrap().unwrap();
    assert!(thread.locked_by_run_id.is_none());

    let names = h.event_names(&run_id).await;
    assert!(names.iter().any(|n| n == EventName::RunRequiresConfirmation.as_str()));
    assert_eq!(names.last().map(String::as_str), Some(EventName::RunFailed.as_str()));
}

#[tokio::test]
async fn approved_builtin_runs_and_hands_back() {
    let h = Harness::new(vec![
        vec![tool_call("call-1", "sys_shell", r#"{"command":"echo hi"}"#)],
        vec![ChatCompletionChunk::text("done")],
    ])
    .await;
    let tools = vec![AssistantTool::Builtin {
        name: "sys_shell".into(),
    }];
    let (thread_id, run_id) = h.start(tools, &["say hi"]).await;
    h.run_worker().process_next().await.unwrap();

    let executor = Arc::new(StubExecutor::default());
    let confirmer = Confirmer::new(h.db.clone(), true, Duration::from_millis(20), Duration::from_secs(10));
    let worker = Arc::new(ToolStepWorker::new(
        h.db.clone(),
        Arc::new(ToolRegistry::with_defaults()),
        executor.clone(),
        confirmer,
        Arc::new(NoopTrigger),
        Arc::new(NoopTrigger),
        "tool-worker",
    ));
    let processing = tokio::spawn({
        let worker = worker.clone();
        async move { worker.process_next().await }
    });

    // Wait for the run to ask, then approve.
    let mut asked = false;
    for _ in 0..100 {
        let run = h.db.get_run(&run_id).await.unwrap().unwrap();
        if run.status == RunStatus::RequiresConfirmation {
            asked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(asked);
    h.service
        .confirm_tool_call(
            &thread_id,
            &run_id,
            assistants_engine::runs::ops::ConfirmToolCall {
                tool_call_id: "call-1".into(),
                approved: true,
            },
        )
        .await
        .unwrap();
    assert!(processing.await.unwrap().unwrap());
    assert_eq!(executor.ran.lock().unwrap().as_slice(), ["echo hi"]);

    let run = h.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.system_status, Some(SystemStatus::Queued));

    // Same claimant resumes the model turn.
    assert!(h.run_worker().process_next().await.unwrap());
    let run = h.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}
