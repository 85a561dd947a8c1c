//! Confirmation handshake for built-in tools and the cancellation watchdog.
//!
//! A call that needs confirmation moves its run to `requires_confirmation`
//! and polls the tool-run record until the user answers. Any failure or an
//! expired wait is returned as an error and never counts as approval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConfirmationError;
use crate::jobs::model::ToolRun;
use crate::runs::events::EventName;
use crate::runs::model::{PendingConfirmation, RequiredAction, Run};
use crate::runs::state::RunStatus;
use crate::store::{Database, RunBatch};

pub struct Confirmer {
    db: Arc<dyn Database>,
    enabled: bool,
    poll_interval: Duration,
    timeout: Duration,
}

impl Confirmer {
    /// `enabled = false` approves everything without asking.
    pub fn new(db: Arc<dyn Database>, enabled: bool, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            db,
            enabled,
            poll_interval,
            timeout,
        }
    }

    /// Ask for and wait on approval of `tool_run`. Returns `Ok(())` once
    /// approved. `run` is updated in place with each status change.
    pub async fn confirm(
        &self,
        run: &mut Run,
        tool_run: &ToolRun,
        required: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmationError> {
        if !self.enabled || !required {
            return Ok(());
        }
        let id = tool_run.tool_call_id.clone();
        let db_err = |source| ConfirmationError::Database {
            id: id.clone(),
            source,
        };

        let resume_action = run.required_action.take();
        run.status = RunStatus::RequiresConfirmation;
        run.required_action = Some(RequiredAction::Confirm {
            confirm: PendingConfirmation {
                tool_call_id: tool_run.tool_call_id.clone(),
                step_id: tool_run.step_id.clone(),
                command: tool_run.program.clone(),
            },
        });
        let batch = RunBatch::new(&run.id)
            .expect_status(&[RunStatus::InProgress])
            .run_event(EventName::RunRequiresConfirmation, run);
        run.event_index = self.db.apply_run_batch(batch).await.map_err(db_err)?;
        info!(run_id = %run.id, tool_call_id = %id, "Waiting for tool confirmation");

        let approved = self.poll(tool_run, cancel).await?;

        run.status = RunStatus::InProgress;
        run.required_action = resume_action;
        let batch = RunBatch::new(&run.id)
            .expect_status(&[RunStatus::RequiresConfirmation])
            .run_event(EventName::RunConfirmationResponded, run);
        run.event_index = self.db.apply_run_batch(batch).await.map_err(db_err)?;

        if approved {
            debug!(run_id = %run.id, tool_call_id = %id, "Tool call approved");
            Ok(())
        } else {
            info!(run_id = %run.id, tool_call_id = %id, "Tool call denied");
            Err(ConfirmationError::Denied { id })
        }
    }

    /// Poll the record until a value appears, the wait times out, or
    /// `cancel` fires.
    async fn poll(&self, tool_run: &ToolRun, cancel: &CancellationToken) -> Result<bool, ConfirmationError> {
        let id = &tool_run.tool_call_id;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ConfirmationError::TimedOut { id: id.clone() });
                }
                _ = &mut deadline => {
                    return Err(ConfirmationError::TimedOut { id: id.clone() });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let taken = self
                .db
                .take_tool_confirmation(&tool_run.id)
                .await
                .map_err(|source| ConfirmationError::Database {
                    id: id.clone(),
                    source,
                })?;
            if let Some(approved) = taken {
                return Ok(approved);
            }
        }
    }
}

/// Watches a run while work happens on its behalf. Stops when dropped.
pub struct CancellationWatch {
    handle: JoinHandle<()>,
}

impl Drop for CancellationWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Poll the run every `interval` and call `on_cancel` once it is no longer
/// `in_progress` or has disappeared. Store errors are logged and retried.
pub fn poll_for_cancellation<F>(
    db: Arc<dyn Database>,
    run_id: String,
    interval: Duration,
    on_cancel: F,
) -> CancellationWatch
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match db.get_run(&run_id).await {
                Ok(Some(run)) if run.status == RunStatus::InProgress => continue,
                Ok(Some(run)) => {
                    info!(run_id = %run_id, status = %run.status, "Run left in_progress; cancelling work");
                    break;
                }
                Ok(None) => {
                    info!(run_id = %run_id, "Run disappeared; cancelling work");
                    break;
                }
                Err(e) => warn!(run_id = %run_id, "Cancellation poll failed: {}", e),
            }
        }
        on_cancel();
    });
    CancellationWatch { handle }
}

/// Child of `parent` that is also cancelled by a [`poll_for_cancellation`]
/// watch on `run_id`.
pub fn watch_run(
    db: Arc<dyn Database>,
    run_id: &str,
    interval: Duration,
    parent: &CancellationToken,
) -> (CancellationToken, CancellationWatch) {
    let token = parent.child_token();
    let trip = token.clone();
    let watch = poll_for_cancellation(db, run_id.to_string(), interval, move || trip.cancel());
    (token, watch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::model::{Assistant, Thread};
    use crate::store::LibSqlBackend;

    const FAST: Duration = Duration::from_millis(20);

    async fn in_progress_run() -> (Arc<dyn Database>, Run, ToolRun) {
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
        let thread = Thread::new(serde_json::Value::Null);
        db.insert_thread(&thread).await.unwrap();

        let mut run = Run::queued(&thread.id, &assistant, 600);
        db.apply_run_batch(
            RunBatch::new(&run.id)
                .lock_thread(&thread.id)
                .run_event(EventName::RunCreated, &run),
        )
        .await
        .unwrap();
        run.status = RunStatus::InProgress;
        db.apply_run_batch(RunBatch::new(&run.id).run_event(EventName::RunInProgress, &run))
            .await
            .unwrap();

        let tool_run = db
            .ensure_tool_run(&ToolRun::new(&run.id, "step-1", "call-1", "rm -rf /tmp/x", ""))
            .await
            .unwrap();
        (db, run, tool_run)
    }

    #[tokio::test]
    async fn not_required_skips_handshake() {
        let (db, mut run, tool_run) = in_progress_run().await;
        let confirmer = Confirmer::new(db.clone(), true, FAST, Duration::from_secs(1));
        confirmer
            .confirm(&mut run, &tool_run, false, &CancellationToken::new())
            .await
            .unwrap();
        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn approval_resumes_run() {
        let (db, mut run, tool_run) = in_progress_run().await;
        let confirmer = Confirmer::new(db.clone(), true, FAST, Duration::from_secs(5));

        let answer = db.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            loop {
                let r = answer.get_run(&run_id).await.unwrap().unwrap();
                if r.status == RunStatus::RequiresConfirmation {
                    break;
                }
                tokio::time::sleep(FAST).await;
            }
            assert!(answer.set_tool_confirmation(&run_id, "call-1", true).await.unwrap());
        });

        confirmer
            .confirm(&mut run, &tool_run, true, &CancellationToken::new())
            .await
            .unwrap();
        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::InProgress);

        let names: Vec<String> = db
            .list_run_events(&run.id, 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_name)
            .collect();
        assert!(names.ends_with(&[
            "thread.run.requires_confirmation".to_string(),
            "thread.run.confirmation_responded".to_string(),
        ]));
    }

    #[tokio::test]
    async fn denial_is_an_error() {
        let (db, mut run, tool_run) = in_progress_run().await;
        let confirmer = Confirmer::new(db.clone(), true, FAST, Duration::from_secs(5));
        let answer = db.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            while !answer.set_tool_confirmation(&run_id, "call-1", false).await.unwrap() {
                tokio::time::sleep(FAST).await;
            }
        });
        let err = confirmer
            .confirm(&mut run, &tool_run, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfirmationError::Denied { ref id } if id == "call-1"));
    }

    #[tokio::test]
    async fn cancelled_wait_names_the_call() {
        let (db, mut run, tool_run) = in_progress_run().await;
        let confirmer = Confirmer::new(db, true, FAST, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });
        let err = confirmer
            .confirm(&mut run, &tool_run, true, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfirmationError::TimedOut { ref id } if id == "call-1"));
    }

    #[tokio::test]
    async fn watchdog_fires_when_run_leaves_in_progress() {
        let (db, run, _) = in_progress_run().await;
        let (token, _watch) = watch_run(db.clone(), &run.id, FAST, &CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());

        db.cancel_run(&run.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
