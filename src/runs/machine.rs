//! Model-call worker: drives a claimed run through one model turn.
//!
//! Claim, build the request from the thread's history, stream the
//! completion through the compiler, then decide what the run needs next:
//! a client tool round-trip, a built-in tool step, completion, or failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CANCELLATION_POLL_INTERVAL;
use crate::error::{DatabaseError, Error, LlmError, RunError};
use crate::jobs::poller::JobHandler;
use crate::jobs::trigger::Trigger;
use crate::llm::provider::{ChatCompletionRequest, ChatMessage, ChatRole, LlmProvider};
use crate::runs::compiler::{CompileOutcome, compile};
use crate::runs::events::EventName;
use crate::runs::model::{
    LastError, Message, RequiredAction, Role, Run, RunStep, RunnerType, unix_now,
};
use crate::runs::state::{MessageStatus, RunStatus, StepStatus, SystemStatus};
use crate::store::{Database, RunBatch};
use crate::tools::confirm::watch_run;
use crate::tools::registry::{ToolKind, ToolRegistry};

/// Most thread messages sent back to the model.
const HISTORY_LIMIT: usize = 1000;

/// Map a failure onto the run's `last_error`.
pub fn classify_error(err: &Error) -> LastError {
    match err {
        Error::Llm(LlmError::Status { status, message }) => {
            LastError::from_status(*status, format!("upstream returned {status}: {message}"))
        }
        other => LastError::server_error(other.to_string()),
    }
}

fn stalled(run: &Run) -> LastError {
    classify_error(&Error::from(RunError::Stalled {
        run_id: run.id.clone(),
    }))
}

/// Fail `run` together with its open step and message, and release the
/// thread. The lock is released even when the batch cannot be written.
pub(crate) async fn fail_run(
    db: &dyn Database,
    run: &mut Run,
    step: Option<&mut RunStep>,
    message: Option<&mut Message>,
    error: LastError,
) {
    let now = unix_now();
    let mut batch = RunBatch::new(&run.id)
        .expect_status(&[RunStatus::InProgress, RunStatus::RequiresConfirmation]);
    if let Some(message) = message.filter(|m| m.status == MessageStatus::InProgress) {
        message.status = MessageStatus::Incomplete;
        message.incomplete_at = Some(now);
        batch = batch.message_event(EventName::MessageIncomplete, message);
    }
    if let Some(step) = step.filter(|s| s.status == StepStatus::InProgress) {
        step.fail(error.clone(), now);
        batch = batch.step_event(EventName::StepFailed, step);
    }
    warn!(run_id = %run.id, code = ?error.code, "Run failed: {}", error.message);
    run.fail(error, now);
    let batch = batch
        .run_event(EventName::RunFailed, run)
        .unlock_thread(&run.thread_id);

    match db.apply_run_batch(batch).await {
        Ok(idx) => run.event_index = idx,
        Err(DatabaseError::InvalidTransition { status, .. }) => {
            info!(run_id = %run.id, status = %status, "Run already left in_progress; not failing it");
        }
        Err(e) => {
            error!(run_id = %run.id, "Failed to record run failure: {}", e);
            if let Err(e) = db.force_unlock_thread(&run.thread_id, &run.id).await {
                error!(run_id = %run.id, thread_id = %run.thread_id, "Failed to release thread lock: {}", e);
            }
        }
    }
}

/// Thread history as chat messages: completed messages in order, with each
/// run's completed tool steps placed before that run's answer.
pub fn history_messages(messages: &[Message], tool_steps: &[RunStep]) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut pending: Vec<&RunStep> = tool_steps.iter().collect();

    for message in messages.iter().filter(|m| m.status == MessageStatus::Completed) {
        let run_id = message.run_id.as_deref();
        let (ready, rest): (Vec<&RunStep>, Vec<&RunStep>) = pending
            .into_iter()
            .partition(|s| Some(s.run_id.as_str()) == run_id || s.created_at < message.created_at);
        pending = rest;
        push_tool_steps(&mut out, ready);

        out.push(match message.role {
            Role::User => ChatMessage::user(message.content.clone()),
            Role::Assistant => ChatMessage::assistant(message.content.clone()),
            Role::Tool => ChatMessage::text(ChatRole::Tool, message.content.clone()),
        });
    }
    push_tool_steps(&mut out, pending);
    out
}

fn push_tool_steps(out: &mut Vec<ChatMessage>, steps: Vec<&RunStep>) {
    for step in steps {
        let calls = step.step_details.tool_calls();
        out.push(ChatMessage::assistant_tool_calls(
            calls.iter().map(|c| c.to_wire()).collect(),
        ));
        for call in calls {
            out.push(ChatMessage::tool_result(
                call.id.clone(),
                call.function.output.clone().unwrap_or_default(),
            ));
        }
    }
}

pub struct RunWorker {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    run_trigger: Arc<dyn Trigger>,
    tool_trigger: Arc<dyn Trigger>,
    worker_id: String,
    default_model: String,
    cancel_poll_interval: Duration,
    shutdown: CancellationToken,
}

impl RunWorker {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        run_trigger: Arc<dyn Trigger>,
        tool_trigger: Arc<dyn Trigger>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            llm,
            registry,
            run_trigger,
            tool_trigger,
            worker_id: worker_id.into(),
            default_model: String::new(),
            cancel_poll_interval: CANCELLATION_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    /// Model used when a run carries none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    async fn build_request(&self, run: &Run) -> Result<ChatCompletionRequest, Error> {
        let mut messages = Vec::new();
        let system = [run.instructions.as_deref(), run.additional_instructions.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }

        let thread_messages = self.db.list_messages(&run.thread_id, HISTORY_LIMIT).await?;
        let tool_steps = self.db.list_thread_tool_steps(&run.thread_id).await?;
        messages.extend(history_messages(&thread_messages, &tool_steps));

        let model = if run.model.is_empty() {
            self.default_model.clone()
        } else {
            run.model.clone()
        };
        Ok(ChatCompletionRequest {
            model,
            messages,
            tools: self.registry.definitions_for(&run.tools),
            temperature: None,
            stream: true,
        })
    }

    /// One model turn for a claimed run.
    async fn step_run(&self, run: &mut Run) -> Result<(), Error> {
        let request = self.build_request(run).await?;
        debug!(run_id = %run.id, messages = request.messages.len(), tools = request.tools.len(), "Calling model");

        let (token, watch) = watch_run(self.db.clone(), &run.id, self.cancel_poll_interval, &self.shutdown);
        let rx = match self.llm.stream(request, token.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                drop(watch);
                let err = Error::from(e);
                fail_run(self.db.as_ref(), run, None, None, classify_error(&err)).await;
                return Ok(());
            }
        };
        let outcome = compile(self.db.as_ref(), run, rx, &token).await;
        drop(watch);

        self.finish(run, outcome).await;
        Ok(())
    }

    /// Post-compile decision.
    async fn finish(&self, run: &mut Run, outcome: CompileOutcome) {
        if outcome.is_stalled() {
            let error = stalled(run);
            fail_run(self.db.as_ref(), run, None, None, error).await;
            return;
        }
        let CompileOutcome {
            mut message,
            mut step,
            error,
            interrupted,
        } = outcome;

        if interrupted {
            info!(run_id = %run.id, "Model turn interrupted");
            return;
        }
        if let Some(err) = error {
            fail_run(self.db.as_ref(), run, step.as_mut(), message.as_mut(), classify_error(&err)).await;
            return;
        }

        let now = unix_now();
        let calls = step
            .as_ref()
            .map(|s| s.step_details.tool_calls().to_vec())
            .unwrap_or_default();
        let batch = RunBatch::new(&run.id).expect_status(&[RunStatus::InProgress]);

        let (batch, hand_off) = if let Some(step) = step.as_mut().filter(|_| !calls.is_empty()) {
            run.required_action = Some(RequiredAction::submit(calls.clone()));
            if calls.iter().any(|c| ToolKind::of(&c.function.name) == ToolKind::Builtin) {
                step.runner_type = Some(RunnerType::Tools);
                run.system_status = Some(SystemStatus::RequiresAction);
                run.system_claimed_by = None;
                let batch = batch
                    .put_step(step)
                    .run_event(EventName::RunInProgress, run);
                (batch, true)
            } else {
                run.status = RunStatus::RequiresAction;
                let batch = batch
                    .put_step(step)
                    .run_event(EventName::RunRequiresAction, run);
                (batch, false)
            }
        } else if let (Some(msg), Some(step)) = (message.as_mut(), step.as_mut()) {
            msg.status = MessageStatus::Completed;
            msg.completed_at = Some(now);
            step.complete(now);
            run.complete(now);
            let batch = batch
                .message_event(EventName::MessageCompleted, msg)
                .step_event(EventName::StepCompleted, step)
                .run_event(EventName::RunCompleted, run)
                .unlock_thread(&run.thread_id);
            (batch, false)
        } else {
            let error = stalled(run);
            fail_run(self.db.as_ref(), run, step.as_mut(), message.as_mut(), error).await;
            return;
        };

        match self.db.apply_run_batch(batch).await {
            Ok(idx) => run.event_index = idx,
            Err(DatabaseError::InvalidTransition { status, .. }) => {
                info!(run_id = %run.id, status = %status, "Run changed before the turn was recorded");
                return;
            }
            Err(e) => {
                let error = LastError::server_error(e.to_string());
                fail_run(self.db.as_ref(), run, step.as_mut(), message.as_mut(), error).await;
                return;
            }
        }

        match run.status {
            RunStatus::Completed => info!(run_id = %run.id, "Run completed"),
            RunStatus::RequiresAction => info!(run_id = %run.id, calls = calls.len(), "Run requires tool outputs"),
            _ if hand_off => {
                info!(run_id = %run.id, calls = calls.len(), "Run handed to tool-step worker");
                self.tool_trigger.kick(&run.id);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl JobHandler for RunWorker {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn process_next(&self) -> Result<bool, Error> {
        let claimed = match self.db.claim_run(&self.worker_id).await {
            Ok(claimed) => claimed,
            Err(e @ DatabaseError::LockMismatch { .. }) => {
                error!(worker_id = %self.worker_id, "Run claim aborted: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(mut run) = claimed else {
            return Ok(false);
        };
        info!(run_id = %run.id, worker_id = %self.worker_id, "Claimed run");

        if let Err(e) = self.step_run(&mut run).await {
            fail_run(self.db.as_ref(), &mut run, None, None, classify_error(&e)).await;
        }
        self.run_trigger.ready(&run.id);
        Ok(true)
    }
}
