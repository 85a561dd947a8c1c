//! Turns a streamed completion into run-step and message rows plus the
//! run-event log.
//!
//! The first fragment that carries content or a tool-call delta decides
//! whether the response is a message or a tool-call batch; the decision is
//! sticky. Every row change is written in the same batch as the event
//! reporting it, guarded on the run still being `in_progress`.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DatabaseError, Error};
use crate::llm::provider::{ChatCompletionChunk, ChunkReceiver, ToolCallDelta};
use crate::runs::events::{EventName, EventPayload, RunStepDelta};
use crate::runs::model::{
    Message, Run, RunStep, StepDetails, ToolCall, merge_tool_call_deltas,
};
use crate::runs::state::RunStatus;
use crate::store::{Database, RunBatch};

/// What the stream turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Undecided,
    Message,
    ToolCalls,
}

/// Result of compiling one stream.
#[derive(Debug, Default)]
pub struct CompileOutcome {
    /// The message being written, for message streams.
    pub message: Option<Message>,
    /// The message-creation or tool-calls step.
    pub step: Option<RunStep>,
    /// Upstream or store failure that ended the stream.
    pub error: Option<Error>,
    /// The run left `in_progress` or the caller cancelled.
    pub interrupted: bool,
}

impl CompileOutcome {
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.step
            .as_ref()
            .map(|s| s.step_details.tool_calls())
            .unwrap_or(&[])
    }

    /// Ended cleanly without producing anything.
    pub fn is_stalled(&self) -> bool {
        !self.interrupted
            && self.error.is_none()
            && self.message.is_none()
            && self.tool_calls().is_empty()
    }
}

/// Consume the receiver in the background so the producer never blocks on
/// a full channel.
pub fn drain_in_background(mut rx: ChunkReceiver) {
    tokio::spawn(async move {
        let mut dropped = 0usize;
        while rx.recv().await.is_some() {
            dropped += 1;
        }
        debug!(dropped, "Drained abandoned completion stream");
    });
}

struct Compiler<'a> {
    db: &'a dyn Database,
    run: &'a mut Run,
    kind: StreamKind,
    message: Option<Message>,
    step: Option<RunStep>,
}

/// Compile `rx` into rows and events for `run` until the stream ends,
/// fails, or `cancel` fires.
pub async fn compile(
    db: &dyn Database,
    run: &mut Run,
    mut rx: ChunkReceiver,
    cancel: &CancellationToken,
) -> CompileOutcome {
    let mut compiler = Compiler {
        db,
        run,
        kind: StreamKind::Undecided,
        message: None,
        step: None,
    };
    let mut error: Option<Error> = None;
    let mut interrupted = false;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
            item = rx.recv() => item,
        };
        let chunk = match item {
            None => break,
            Some(Err(e)) => {
                error = Some(e.into());
                break;
            }
            Some(Ok(chunk)) => chunk,
        };
        match compiler.apply(&chunk).await {
            Ok(()) => {}
            Err(DatabaseError::InvalidTransition { status, .. }) => {
                info!(run_id = %compiler.run.id, status = %status, "Run left in_progress while streaming");
                interrupted = true;
                break;
            }
            Err(e) => {
                error = Some(e.into());
                break;
            }
        }
    }

    if interrupted || error.is_some() {
        drain_in_background(rx);
    }

    CompileOutcome {
        message: compiler.message,
        step: compiler.step,
        error,
        interrupted,
    }
}

impl Compiler<'_> {
    async fn apply(&mut self, chunk: &ChatCompletionChunk) -> Result<(), DatabaseError> {
        let deltas = chunk.tool_calls();
        let content = chunk.content().filter(|c| !c.is_empty());

        if self.kind == StreamKind::Undecided {
            self.kind = if !deltas.is_empty() {
                StreamKind::ToolCalls
            } else if content.is_some() {
                StreamKind::Message
            } else {
                return Ok(());
            };
            debug!(run_id = %self.run.id, kind = ?self.kind, "Stream classified");
        }

        match self.kind {
            StreamKind::ToolCalls if !deltas.is_empty() => self.apply_tool_calls(deltas).await,
            StreamKind::Message => match content {
                Some(text) => self.apply_content(text).await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn batch(&self) -> RunBatch {
        RunBatch::new(&self.run.id).expect_status(&[RunStatus::InProgress])
    }

    async fn commit(&mut self, batch: RunBatch) -> Result<(), DatabaseError> {
        self.run.event_index = self.db.apply_run_batch(batch).await?;
        Ok(())
    }

    async fn apply_tool_calls(&mut self, deltas: &[ToolCallDelta]) -> Result<(), DatabaseError> {
        let batch = match self.step.as_mut() {
            None => {
                let mut calls = Vec::new();
                if !merge_tool_call_deltas(&mut calls, deltas) {
                    return Ok(());
                }
                let step = RunStep::tool_calls(self.run, calls);
                let batch = self.batch().step_event(EventName::StepCreated, &step);
                self.step = Some(step);
                batch
            }
            Some(step) => {
                let Some(calls) = step.step_details.tool_calls_mut() else {
                    return Ok(());
                };
                if !merge_tool_call_deltas(calls, deltas) {
                    return Ok(());
                }
                let fragment = StepDetails::ToolCalls {
                    tool_calls: deltas.iter().map(ToolCall::from_delta).collect(),
                };
                let delta = RunStepDelta::new(&step.id, fragment);
                RunBatch::new(&self.run.id)
                    .expect_status(&[RunStatus::InProgress])
                    .step_delta(step, delta)
            }
        };
        self.commit(batch).await
    }

    async fn apply_content(&mut self, text: &str) -> Result<(), DatabaseError> {
        let mut batch = self.batch();
        if self.message.is_none() {
            let message = Message::assistant_draft(self.run);
            let step = RunStep::message_creation(self.run, &message.id);
            batch = batch
                .message_event(EventName::MessageCreated, &message)
                .emit(EventName::MessageInProgress, EventPayload::Message(message.clone()))
                .step_event(EventName::StepCreated, &step)
                .emit(EventName::StepInProgress, EventPayload::RunStep(step.clone()));
            self.message = Some(message);
            self.step = Some(step);
        }
        if let Some(message) = self.message.as_mut() {
            message.content.push_str(text);
            batch = batch.message_delta(message, text);
        }
        self.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::FunctionCallDelta;
    use crate::runs::model::{Assistant, Thread};
    use crate::runs::state::{MessageStatus, StepStatus};
    use crate::store::LibSqlBackend;

    async fn claimed_run() -> (Arc<dyn Database>, Run) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let assistant = Assistant {
            id: "asst-1".into(),
            created_at: 0,
            name: None,
            model: "gpt-test".into(),
            instructions: None,
            tools: vec![],
        };
        db.insert_assistant(&assistant).await.unwrap();
        let thread = Thread::new(serde_json::json!({}));
        db.insert_thread(&thread).await.unwrap();
        let run = Run::queued(&thread.id, &assistant, 600);
        db.apply_run_batch(
            RunBatch::new(&run.id)
                .lock_thread(&thread.id)
                .run_event(EventName::RunCreated, &run),
        )
        .await
        .unwrap();
        let run = db.claim_run("w").await.unwrap().unwrap();
        (db, run)
    }

    fn feed(items: Vec<Result<ChatCompletionChunk, LlmError>>) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        rx
    }

    fn tool_delta(id: Option<&str>, name: Option<&str>, args: &str) -> ChatCompletionChunk {
        ChatCompletionChunk::tool_call(ToolCallDelta {
            index: 0,
            id: id.map(str::to_string),
            function: Some(FunctionCallDelta {
                name: name.map(str::to_string),
                arguments: Some(args.to_string()),
            }),
        })
    }

    async fn event_names(db: &Arc<dyn Database>, run_id: &str) -> Vec<String> {
        db.list_run_events(run_id, 0, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_name)
            .collect()
    }

    #[tokio::test]
    async fn message_stream_writes_message_and_step() {
        let (db, mut run) = claimed_run().await;
        let rx = feed(vec![
            Ok(ChatCompletionChunk::text("")),
            Ok(ChatCompletionChunk::text("Hel")),
            Ok(ChatCompletionChunk::text("lo")),
        ]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;

        assert!(outcome.error.is_none());
        let message = outcome.message.as_ref().unwrap();
        assert_eq!(message.content, "Hello");
        assert_eq!(message.status, MessageStatus::InProgress);

        let stored = db.list_messages(&run.thread_id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello");

        let names = event_names(&db, &run.id).await;
        assert_eq!(
            &names[2..],
            &[
                "thread.message.created",
                "thread.message.in_progress",
                "thread.run.step.created",
                "thread.run.step.in_progress",
                "thread.message.delta",
                "thread.message.delta",
            ]
        );
        assert_eq!(run.event_index, names.len() as i64);
    }

    #[tokio::test]
    async fn tool_stream_creates_step_then_deltas() {
        let (db, mut run) = claimed_run().await;
        let rx = feed(vec![
            Ok(tool_delta(Some("call-1"), Some("lookup"), "")),
            Ok(tool_delta(None, None, "{\"q\":")),
            Ok(tool_delta(None, None, "1}")),
        ]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;

        let calls = outcome.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].function.arguments, "{\"q\":1}");
        assert!(outcome.message.is_none());

        let steps = db.list_run_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::InProgress);
        assert_eq!(steps[0].step_details, outcome.step.unwrap().step_details);

        let names = event_names(&db, &run.id).await;
        assert_eq!(
            &names[2..],
            &["thread.run.step.created", "thread.run.step.delta", "thread.run.step.delta"]
        );
    }

    #[tokio::test]
    async fn classification_is_sticky() {
        let (db, mut run) = claimed_run().await;
        let rx = feed(vec![
            Ok(ChatCompletionChunk::text("Sure")),
            Ok(tool_delta(Some("call-1"), Some("lookup"), "{}")),
        ]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;
        assert!(outcome.tool_calls().is_empty());
        assert_eq!(outcome.message.unwrap().content, "Sure");
    }

    #[tokio::test]
    async fn empty_stream_is_stalled() {
        let (db, mut run) = claimed_run().await;
        let rx = feed(vec![Ok(ChatCompletionChunk::default())]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;
        assert!(outcome.is_stalled());
    }

    #[tokio::test]
    async fn upstream_error_is_reported() {
        let (db, mut run) = claimed_run().await;
        let rx = feed(vec![
            Ok(ChatCompletionChunk::text("partial")),
            Err(LlmError::StreamFault("reset".into())),
        ]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;
        assert!(matches!(outcome.error, Some(Error::Llm(LlmError::StreamFault(_)))));
        assert_eq!(outcome.message.unwrap().content, "partial");
    }

    #[tokio::test]
    async fn cancel_stops_and_drains_producer() {
        let (db, mut run) = claimed_run().await;
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(async move {
            for _ in 0..10_000 {
                if tx.send(Ok(ChatCompletionChunk::text("x"))).await.is_err() {
                    return false;
                }
            }
            true
        });
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trip.cancel();
        });

        let outcome = compile(db.as_ref(), &mut run, rx, &cancel).await;
        assert!(outcome.interrupted);
        // The producer runs to completion instead of blocking forever.
        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(finished);
    }

    #[tokio::test]
    async fn cancelled_run_interrupts_stream() {
        let (db, mut run) = claimed_run().await;
        db.cancel_run(&run.id).await.unwrap();
        let rx = feed(vec![Ok(ChatCompletionChunk::text("late"))]);
        let outcome = compile(db.as_ref(), &mut run, rx, &CancellationToken::new()).await;
        assert!(outcome.interrupted);
        assert!(db.list_messages(&run.thread_id, 10).await.unwrap().is_empty());
    }
}
