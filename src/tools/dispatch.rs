//! Tool-step worker: executes built-in tool calls for runs handed off by the
//! model-call worker, then hands the run back or surfaces the remaining
//! client functions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CANCELLATION_POLL_INTERVAL;
use crate::error::{ConfirmationError, DatabaseError, Error, RunError, ToolError};
use crate::jobs::model::ToolRun;
use crate::jobs::poller::JobHandler;
use crate::jobs::trigger::Trigger;
use crate::runs::events::{EventName, RunStepDelta};
use crate::runs::machine::fail_run;
use crate::runs::model::{
    LastError, RequiredAction, Run, RunStep, RunnerType, StepDetails, ToolCall, unix_now,
};
use crate::runs::state::{RunStatus, StepStatus, SystemStatus};
use crate::store::{Database, RunBatch};
use crate::tools::confirm::{Confirmer, watch_run};
use crate::tools::executor::{ToolExecutor, translate_outcome};
use crate::tools::registry::{ToolKind, ToolRegistry};

/// How one built-in call ended.
enum CallResult {
    Output(String),
    /// The run left `in_progress` underneath us; stop without touching it.
    Abandoned,
}

pub struct ToolStepWorker {
    db: Arc<dyn Database>,
    registry: Arc<ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    confirmer: Confirmer,
    run_trigger: Arc<dyn Trigger>,
    tool_trigger: Arc<dyn Trigger>,
    worker_id: String,
    cancel_poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ToolStepWorker {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
        confirmer: Confirmer,
        run_trigger: Arc<dyn Trigger>,
        tool_trigger: Arc<dyn Trigger>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            executor,
            confirmer,
            run_trigger,
            tool_trigger,
            worker_id: worker_id.into(),
            cancel_poll_interval: CANCELLATION_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    /// Abort confirmation waits and executions when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// The in-progress tool step the run was handed off with.
    async fn pending_step(&self, run: &Run) -> Result<RunStep, Error> {
        self.db
            .list_run_steps(&run.id)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.status == StepStatus::InProgress && s.runner_type == Some(RunnerType::Tools))
            .ok_or_else(|| {
                RunError::InvalidRequest(format!("run {} has no pending tool step", run.id)).into()
            })
    }

    async fn process_run(&self, run: &mut Run) -> Result<(), Error> {
        let mut step = self.pending_step(run).await?;
        let calls: Vec<ToolCall> = step
            .step_details
            .tool_calls()
            .iter()
            .filter(|c| ToolKind::of(&c.function.name) == ToolKind::Builtin)
            .filter(|c| c.function.output.is_none())
            .cloned()
            .collect();

        for call in &calls {
            let result = match self.execute_call(run, &step, call).await {
                Ok(result) => result,
                Err(e) => {
                    let last_error = LastError::server_error(e.to_string());
                    fail_run(self.db.as_ref(), run, Some(&mut step), None, last_error).await;
                    return Ok(());
                }
            };
            let CallResult::Output(output) = result else {
                return Ok(());
            };
            if !self.record_output(run, &mut step, &call.id, output).await? {
                return Ok(());
            }
        }

        self.hand_back(run, &mut step).await
    }

    async fn execute_call(&self, run: &mut Run, step: &RunStep, call: &ToolCall) -> Result<CallResult, Error> {
        let name = call.function.name.as_str();
        let Some(tool) = self.registry.get(name) else {
            warn!(run_id = %run.id, tool = %name, "Model called an unknown built-in tool");
            return Ok(CallResult::Output(format!("error: tool {name} is not available")));
        };
        let prepared = match tool.prepare(&call.function.arguments) {
            Ok(prepared) => prepared,
            Err(e) => return Ok(CallResult::Output(format!("error: {e}"))),
        };

        let mut record = ToolRun::new(&run.id, &step.id, &call.id, prepared.program, prepared.input);
        record.env = tool.env.clone();
        let record = self.db.ensure_tool_run(&record).await?;
        if let Some(output) = record.output.clone() {
            debug!(run_id = %run.id, tool_call_id = %call.id, "Reusing recorded tool output");
            return Ok(CallResult::Output(output));
        }

        match self
            .confirmer
            .confirm(run, &record, tool.requires_confirmation, &self.shutdown)
            .await
        {
            Ok(()) => {}
            Err(ConfirmationError::Denied { .. }) => {
                let output = format!("error: the user denied running {name}");
                self.db.finish_tool_run(&record.id, Some(&output), None).await?;
                return Ok(CallResult::Output(output));
            }
            Err(e) => return Err(e.into()),
        }

        info!(run_id = %run.id, tool = %name, tool_call_id = %call.id, "Executing built-in tool");
        let (token, watch) = watch_run(self.db.clone(), &run.id, self.cancel_poll_interval, &self.shutdown);
        let result = self
            .executor
            .run(&record.program, &record.env, &record.input, token)
            .await;
        drop(watch);

        match translate_outcome(name, result) {
            Ok(output) => {
                self.db.finish_tool_run(&record.id, Some(&output), None).await?;
                Ok(CallResult::Output(output))
            }
            Err(ToolError::Cancelled { .. }) => {
                info!(run_id = %run.id, tool = %name, "Tool execution cancelled");
                self.db.finish_tool_run(&record.id, None, Some("cancelled")).await?;
                Ok(CallResult::Abandoned)
            }
            Err(e) => {
                let message = e.to_string();
                self.db.finish_tool_run(&record.id, None, Some(&message)).await?;
                Err(e.into())
            }
        }
    }

    /// Store an answered call on the step and emit it as a step delta.
    /// Returns false if the run is no longer `in_progress`.
    async fn record_output(
        &self,
        run: &mut Run,
        step: &mut RunStep,
        call_id: &str,
        output: String,
    ) -> Result<bool, Error> {
        let mut answered = None;
        if let Some(calls) = step.step_details.tool_calls_mut() {
            if let Some(call) = calls.iter_mut().find(|c| c.id == call_id) {
                call.function.output = Some(output);
                answered = Some(call.clone());
            }
        }
        let details = StepDetails::ToolCalls {
            tool_calls: answered.into_iter().collect(),
        };
        let batch = RunBatch::new(&run.id)
            .expect_status(&[RunStatus::InProgress])
            .step_delta(step, RunStepDelta::new(&step.id, details));
        match self.db.apply_run_batch(batch).await {
            Ok(idx) => {
                run.event_index = idx;
                Ok(true)
            }
            Err(DatabaseError::InvalidTransition { status, .. }) => {
                info!(run_id = %run.id, status = %status, "Run changed while executing tools");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return the run to the model-call worker, or wait for the client if
    /// ordinary function calls remain unanswered.
    async fn hand_back(&self, run: &mut Run, step: &mut RunStep) -> Result<(), Error> {
        let remaining: Vec<ToolCall> = step
            .step_details
            .tool_calls()
            .iter()
            .filter(|c| c.function.output.is_none())
            .cloned()
            .collect();

        run.system_claimed_by = None;
        let mut batch = RunBatch::new(&run.id).expect_status(&[RunStatus::InProgress]);
        let requeue = remaining.is_empty();
        if requeue {
            step.complete(unix_now());
            run.system_status = Some(SystemStatus::Queued);
            run.required_action = None;
            batch = batch.step_event(EventName::StepCompleted, step).put_run(run);
        } else {
            step.runner_type = None;
            run.status = RunStatus::RequiresAction;
            run.system_status = None;
            run.required_action = Some(RequiredAction::submit(remaining));
            batch = batch
                .put_step(step)
                .run_event(EventName::RunRequiresAction, run);
        }

        match self.db.apply_run_batch(batch).await {
            Ok(idx) => run.event_index = idx,
            Err(DatabaseError::InvalidTransition { status, .. }) => {
                info!(run_id = %run.id, status = %status, "Run changed before hand-back");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if requeue {
            info!(run_id = %run.id, "Built-in tools done; run handed back");
            self.run_trigger.kick(&run.id);
        } else {
            info!(run_id = %run.id, "Run requires client tool outputs");
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ToolStepWorker {
    fn name(&self) -> &'static str {
        "tool_step"
    }

    async fn process_next(&self) -> Result<bool, Error> {
        let claimed = match self.db.claim_run_tool_step(&self.worker_id).await {
            Ok(claimed) => claimed,
            Err(e @ DatabaseError::LockMismatch { .. }) => {
                error!(worker_id = %self.worker_id, "Tool step claim aborted: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(mut run) = claimed else {
            return Ok(false);
        };
        info!(run_id = %run.id, worker_id = %self.worker_id, "Claimed run tool step");

        if let Err(e) = self.process_run(&mut run).await {
            warn!(run_id = %run.id, "Tool step failed: {}", e);
            fail_run(self.db.as_ref(), &mut run, None, None, LastError::server_error(e.to_string())).await;
        }
        self.tool_trigger.ready(&run.id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::jobs::trigger::{ChannelTrigger, NoopTrigger};
    use crate::runs::model::{Assistant, AssistantTool, FunctionCall, ToolCallType, Thread};
    use crate::store::LibSqlBackend;
    use crate::tools::executor::ExecError;

    /// Records every program it is asked to run.
    #[derive(Default)]
    struct RecordingExecutor {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn run(
            &self,
            program: &str,
            _env: &BTreeMap<String, String>,
            _input: &str,
            _cancel: CancellationToken,
        ) -> Result<String, ExecError> {
            self.ran.lock().unwrap().push(program.to_string());
            Ok(format!("ran {program}"))
        }
    }

    fn call(index: u32, id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            index,
            id: id.into(),
            call_type: ToolCallType::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
                output: None,
            },
        }
    }

    /// A run handed to the tool-step worker with `calls` pending.
    async fn handed_off(db: &Arc<dyn Database>, calls: Vec<ToolCall>) -> Run {
        let assistant = Assistant {
            id: "asst-1".into(),
            created_at: 0,
            name: None,
            model: "gpt-test".into(),
            instructions: None,
            tools: vec![AssistantTool::Builtin {
                name: "sys_current_time".into(),
            }],
        };
        db.insert_assistant(&assistant).await.unwrap();
        let thread = Thread::new(serde_json::json!({}));
        db.insert_thread(&thread).await.unwrap();

        let mut run = Run::queued(&thread.id, &assistant, 600);
        db.apply_run_batch(
            RunBatch::new(&run.id)
                .lock_thread(&thread.id)
                .run_event(EventName::RunCreated, &run),
        )
        .await
        .unwrap();
        let mut run = db.claim_run("model-worker").await.unwrap().unwrap();

        let mut step = RunStep::tool_calls(&run, calls.clone());
        step.runner_type = Some(RunnerType::Tools);
        run.system_status = Some(SystemStatus::RequiresAction);
        run.required_action = Some(RequiredAction::submit(calls));
        db.apply_run_batch(
            RunBatch::new(&run.id)
                .step_event(EventName::StepCreated, &step)
                .run_event(EventName::RunInProgress, &run),
        )
        .await
        .unwrap();
        run
    }

    fn worker(db: Arc<dyn Database>, executor: Arc<RecordingExecutor>) -> ToolStepWorker {
        worker_with_trigger(db, executor, Arc::new(NoopTrigger))
    }

    fn worker_with_trigger(
        db: Arc<dyn Database>,
        executor: Arc<RecordingExecutor>,
        tool_trigger: Arc<dyn Trigger>,
    ) -> ToolStepWorker {
        let confirmer = Confirmer::new(db.clone(), true, Duration::from_millis(20), Duration::from_millis(200));
        ToolStepWorker::new(
            db,
            Arc::new(ToolRegistry::with_defaults()),
            executor,
            confirmer,
            Arc::new(NoopTrigger),
            tool_trigger,
            "tool-worker",
        )
        .with_cancel_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn builtin_only_batch_is_handed_back() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let run = handed_off(&db, vec![call(0, "call-1", "sys_current_time", "{}")]).await;
        let executor = Arc::new(RecordingExecutor::default());

        assert!(worker(db.clone(), executor.clone()).process_next().await.unwrap());

        assert_eq!(executor.ran.lock().unwrap().len(), 1);
        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::InProgress);
        assert_eq!(stored.system_status, Some(SystemStatus::Queued));
        assert!(stored.system_claimed_by.is_none());

        let steps = db.list_run_steps(&run.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(steps[0].step_details.tool_calls()[0].function.output.is_some());

        // The model-call worker that held the run picks it back up.
        let resumed = db.claim_run("model-worker").await.unwrap();
        assert_eq!(resumed.map(|r| r.id), Some(run.id));
    }

    #[tokio::test]
    async fn processed_run_releases_its_signal() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let run = handed_off(&db, vec![call(0, "call-1", "sys_current_time", "{}")]).await;
        let tools = Arc::new(ChannelTrigger::new());
        let mut signal = tools.kick(&run.id);
        assert_eq!(tools.pending(), 1);

        let worker = worker_with_trigger(db, Arc::new(RecordingExecutor::default()), tools.clone());
        assert!(worker.process_next().await.unwrap());

        assert_eq!(tools.pending(), 0);
        tokio::time::timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn mixed_batch_surfaces_remaining_functions() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let run = handed_off(
            &db,
            vec![
                call(0, "call-1", "sys_current_time", "{}"),
                call(1, "call-2", "get_weather", r#"{"city":"Oslo"}"#),
            ],
        )
        .await;
        let executor = Arc::new(RecordingExecutor::default());

        worker(db.clone(), executor).process_next().await.unwrap();

        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::RequiresAction);
        let pending = stored.required_action.unwrap();
        let ids: Vec<&str> = pending.pending_tool_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call-2"]);
    }

    #[tokio::test]
    async fn unanswered_confirmation_fails_run_without_executing() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let run = handed_off(
            &db,
            vec![call(0, "call-1", "sys_shell", r#"{"command":"touch /tmp/never"}"#)],
        )
        .await;
        let executor = Arc::new(RecordingExecutor::default());

        worker(db.clone(), executor.clone()).process_next().await.unwrap();

        assert!(executor.ran.lock().unwrap().is_empty());
        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.last_error.unwrap().message.contains("call-1"));
        let thread = db.get_thread(&stored.thread_id).await.unwrap().unwrap();
        assert!(thread.locked_by_run_id.is_none());
    }

    #[tokio::test]
    async fn nothing_to_claim() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let executor = Arc::new(RecordingExecutor::default());
        assert!(!worker(db, executor).process_next().await.unwrap());
    }
}
