//! Run operations invoked from the API: assistants, threads, messages,
//! run creation, cancellation, tool outputs and confirmations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{DatabaseError, Error, RunError};
use crate::jobs::trigger::{NoopTrigger, Trigger};
use crate::runs::events::EventName;
use crate::runs::model::{
    Assistant, AssistantTool, Message, RequiredAction, Run, RunStep, Thread, new_id, unix_now,
};
use crate::runs::state::{RunStatus, StepStatus};
use crate::store::{Database, RunBatch};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAssistant {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<AssistantTool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateThread {
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRun {
    pub assistant_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<AssistantTool>>,
    /// Answer with the run-event stream instead of the run object.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_outputs: Vec<ToolOutput>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmToolCall {
    pub tool_call_id: String,
    pub approved: bool,
}

fn not_found(entity: &str, id: &str) -> Error {
    DatabaseError::NotFound {
        entity: entity.into(),
        id: id.into(),
    }
    .into()
}

/// Operations over assistants, threads and runs.
pub struct RunService {
    db: Arc<dyn Database>,
    run_trigger: Arc<dyn Trigger>,
    tool_trigger: Arc<dyn Trigger>,
    run_ttl: Duration,
    default_model: String,
}

impl RunService {
    pub fn new(
        db: Arc<dyn Database>,
        run_trigger: Arc<dyn Trigger>,
        run_ttl: Duration,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            run_trigger,
            tool_trigger: Arc::new(NoopTrigger),
            run_ttl,
            default_model: default_model.into(),
        }
    }

    /// Trigger of the tool-step worker, so cancelled hand-offs release
    /// their ready signal.
    pub fn with_tool_trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.tool_trigger = trigger;
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    // ── Assistants and threads ──────────────────────────────────────

    pub async fn create_assistant(&self, req: CreateAssistant) -> Result<Assistant, Error> {
        let assistant = Assistant {
            id: new_id("asst"),
            created_at: unix_now(),
            name: req.name,
            model: req
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.default_model.clone()),
            instructions: req.instructions,
            tools: req.tools,
        };
        self.db.insert_assistant(&assistant).await?;
        info!(assistant_id = %assistant.id, "Assistant created");
        Ok(assistant)
    }

    pub async fn create_thread(&self, req: CreateThread) -> Result<Thread, Error> {
        let thread = Thread::new(req.metadata);
        self.db.insert_thread(&thread).await?;
        for message in req.messages {
            self.add_message(&thread.id, message).await?;
        }
        Ok(thread)
    }

    /// Append a user message. Rejected while a run holds the thread.
    pub async fn add_message(&self, thread_id: &str, req: NewMessage) -> Result<Message, Error> {
        if req.content.trim().is_empty() {
            return Err(RunError::InvalidRequest("message content must not be empty".into()).into());
        }
        if self.db.get_thread(thread_id).await?.is_none() {
            return Err(not_found("thread", thread_id));
        }
        let message = Message::user(thread_id, req.content);
        self.db.insert_message(&message).await?;
        Ok(message)
    }

    pub async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<Message>, Error> {
        if self.db.get_thread(thread_id).await?.is_none() {
            return Err(not_found("thread", thread_id));
        }
        Ok(self.db.list_messages(thread_id, limit).await?)
    }

    // ── Runs ────────────────────────────────────────────────────────

    /// Queue a run. The thread lock, the run row and its first two events
    /// commit together.
    pub async fn create_run(&self, thread_id: &str, req: CreateRun) -> Result<Run, Error> {
        let assistant = self
            .db
            .get_assistant(&req.assistant_id)
            .await?
            .ok_or_else(|| not_found("assistant", &req.assistant_id))?;

        let mut run = Run::queued(thread_id, &assistant, self.run_ttl.as_secs() as i64);
        if let Some(model) = req.model.filter(|m| !m.trim().is_empty()) {
            run.model = model;
        }
        if req.instructions.is_some() {
            run.instructions = req.instructions;
        }
        run.additional_instructions = req.additional_instructions;
        if let Some(tools) = req.tools {
            run.tools = tools;
        }

        let batch = RunBatch::new(&run.id)
            .put_run(&run)
            .lock_thread(thread_id)
            .run_event(EventName::RunCreated, &run)
            .run_event(EventName::RunQueued, &run);
        run.event_index = self.db.apply_run_batch(batch).await?;
        info!(run_id = %run.id, thread_id, "Run queued");

        self.run_trigger.kick(&run.id);
        Ok(run)
    }

    /// A run, checked to belong to `thread_id`.
    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, Error> {
        match self.db.get_run(run_id).await? {
            Some(run) if run.thread_id == thread_id => Ok(run),
            _ => Err(not_found("run", run_id)),
        }
    }

    pub async fn list_run_steps(&self, thread_id: &str, run_id: &str) -> Result<Vec<RunStep>, Error> {
        self.get_run(thread_id, run_id).await?;
        Ok(self.db.list_run_steps(run_id).await?)
    }

    pub async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, Error> {
        self.get_run(thread_id, run_id).await?;
        let run = self.db.cancel_run(run_id).await?;
        // No worker will claim a cancelled run, so nothing else readies it.
        self.run_trigger.ready(run_id);
        self.tool_trigger.ready(run_id);
        info!(run_id, "Run cancelled");
        Ok(run)
    }

    /// Answer every pending client function call and requeue the run.
    pub async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<Run, Error> {
        let mut run = self.get_run(thread_id, run_id).await?;
        if !run.status.can_transition_to(RunStatus::Queued) {
            return Err(RunError::NotAwaitingOutputs {
                run_id: run_id.into(),
            }
            .into());
        }

        let pending: BTreeSet<&str> = run
            .required_action
            .as_ref()
            .map(|a| a.pending_tool_calls().iter().map(|c| c.id.as_str()).collect())
            .unwrap_or_default();
        let submitted: BTreeSet<&str> = outputs.iter().map(|o| o.tool_call_id.as_str()).collect();
        if submitted.len() != outputs.len() {
            return Err(mismatch(run_id, "duplicate tool_call_id"));
        }
        if submitted != pending {
            let missing: Vec<&str> = pending.difference(&submitted).copied().collect();
            let unknown: Vec<&str> = submitted.difference(&pending).copied().collect();
            return Err(mismatch(
                run_id,
                &format!("missing {missing:?}, unknown {unknown:?}"),
            ));
        }

        let mut step = self
            .db
            .list_run_steps(run_id)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.status == StepStatus::InProgress && !s.step_details.tool_calls().is_empty())
            .ok_or_else(|| mismatch(run_id, "no open tool-call step"))?;
        if let Some(calls) = step.step_details.tool_calls_mut() {
            for output in &outputs {
                if let Some(call) = calls.iter_mut().find(|c| c.id == output.tool_call_id) {
                    call.function.output = Some(output.output.clone());
                }
            }
        }
        step.complete(unix_now());

        run.status = RunStatus::Queued;
        run.claimed_by = None;
        run.system_status = None;
        run.system_claimed_by = None;
        run.required_action = None;
        let batch = RunBatch::new(run_id)
            .expect_status(&[RunStatus::RequiresAction])
            .step_event(EventName::StepCompleted, &step)
            .run_event(EventName::RunQueued, &run);
        run.event_index = self.db.apply_run_batch(batch).await?;
        info!(run_id, outputs = outputs.len(), "Tool outputs submitted");

        self.run_trigger.kick(run_id);
        Ok(run)
    }

    /// Approve or deny the built-in call the run is waiting on.
    pub async fn confirm_tool_call(
        &self,
        thread_id: &str,
        run_id: &str,
        req: ConfirmToolCall,
    ) -> Result<Run, Error> {
        let run = self.get_run(thread_id, run_id).await?;
        let waiting = matches!(
            &run.required_action,
            Some(RequiredAction::Confirm { confirm }) if confirm.tool_call_id == req.tool_call_id
        );
        if run.status != RunStatus::RequiresConfirmation || !waiting {
            return Err(RunError::NoPendingConfirmation {
                run_id: run_id.into(),
                tool_call_id: req.tool_call_id,
            }
            .into());
        }
        if !self
            .db
            .set_tool_confirmation(run_id, &req.tool_call_id, req.approved)
            .await?
        {
            return Err(RunError::NoPendingConfirmation {
                run_id: run_id.into(),
                tool_call_id: req.tool_call_id,
            }
            .into());
        }
        info!(run_id, tool_call_id = %req.tool_call_id, approved = req.approved, "Tool call confirmation recorded");
        Ok(run)
    }
}

fn mismatch(run_id: &str, reason: &str) -> Error {
    RunError::OutputMismatch {
        run_id: run_id.into(),
        reason: reason.into(),
    }
    .into()
}
