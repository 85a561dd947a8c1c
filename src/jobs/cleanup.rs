//! Retention sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::jobs::trigger::Trigger;
use crate::runs::model::unix_now;
use crate::store::Database;

/// Rows removed or transitioned by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub chat_completions: usize,
    pub run_events: usize,
    pub runs: usize,
    pub expired_runs: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run every sweep once with `now` as the reference time. Expired runs
/// release their signal on `run_trigger`.
pub async fn sweep_once(
    db: &dyn Database,
    run_trigger: &dyn Trigger,
    retention: Duration,
    now: i64,
) -> Result<SweepReport, DatabaseError> {
    let cutoff = now - retention.as_secs() as i64;
    let chat_completions = db.delete_expired_chat_completions(cutoff).await?;
    let run_events = db.delete_expired_run_events(cutoff).await?;
    let runs = db.delete_expired_runs(cutoff).await?;
    let expired = db.expire_runs(now).await?;
    for run_id in &expired {
        run_trigger.ready(run_id);
    }
    Ok(SweepReport {
        chat_completions,
        run_events,
        runs,
        expired_runs: expired.len(),
    })
}

/// Spawn the periodic sweeper.
pub fn spawn_cleanup(
    db: Arc<dyn Database>,
    run_trigger: Arc<dyn Trigger>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            retention_secs = retention.as_secs(),
            interval_secs = interval.as_secs(),
            "Cleanup sweeper started"
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match sweep_once(db.as_ref(), run_trigger.as_ref(), retention, unix_now()).await {
                Ok(report) if report.is_empty() => debug!("Cleanup sweep found nothing"),
                Ok(report) => info!(
                    chat_completions = report.chat_completions,
                    run_events = report.run_events,
                    runs = report.runs,
                    expired_runs = report.expired_runs,
                    "Cleanup sweep"
                ),
                Err(e) => warn!(error = %e, "Cleanup sweep failed"),
            }
        }
        info!("Cleanup sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ChatCompletionJob, ChatCompletionResult};
    use crate::jobs::trigger::{ChannelTrigger, NoopTrigger};
    use crate::llm::provider::ChatCompletionRequest;
    use crate::runs::events::EventName;
    use crate::runs::model::{Assistant, Run, Thread};
    use crate::store::{LibSqlBackend, RunBatch};

    async fn response_at(db: &LibSqlBackend, created_at: i64) -> String {
        let mut job = ChatCompletionJob::new(ChatCompletionRequest {
            model: "m".into(),
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            stream: false,
        });
        job.created_at = created_at;
        db.insert_chat_completion_request(&job).await.unwrap();
        let mut result = ChatCompletionResult::ok(&job.id, serde_json::json!({}));
        result.created_at = created_at;
        db.complete_chat_completion_request(&result).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn sweep_prunes_only_past_cutoff() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = unix_now();
        let retention = Duration::from_secs(3600);
        let cutoff = now - 3600;

        let old = response_at(&db, cutoff - 1).await;
        let young = response_at(&db, cutoff + 1).await;

        let report = sweep_once(&db, &NoopTrigger, retention, now).await.unwrap();
        assert_eq!(report.chat_completions, 1);
        assert_eq!(report.runs, 0);

        assert!(db.get_chat_completion_response(&old).await.unwrap().is_none());
        assert!(db.get_chat_completion_request(&old).await.unwrap().is_none());
        assert!(db.get_chat_completion_response(&young).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_runs_release_their_signal() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let assistant = Assistant {
            id: "asst-1".into(),
            created_at: 0,
            name: None,
            model: "m".into(),
            instructions: None,
            tools: Vec::new(),
        };
        let thread = Thread::new(serde_json::json!({}));
        db.insert_thread(&thread).await.unwrap();
        let run = Run::queued(&thread.id, &assistant, 600);
        db.apply_run_batch(
            RunBatch::new(&run.id)
                .put_run(&run)
                .lock_thread(&thread.id)
                .run_event(EventName::RunCreated, &run),
        )
        .await
        .unwrap();

        let trigger = ChannelTrigger::new();
        let _signal = trigger.kick(&run.id);
        let report = sweep_once(&db, &trigger, Duration::from_secs(3600), unix_now() + 10_000)
            .await
            .unwrap();

        assert_eq!(report.expired_runs, 1);
        assert_eq!(trigger.pending(), 0);
        let thread = db.get_thread(&thread.id).await.unwrap().unwrap();
        assert!(thread.locked_by_run_id.is_none());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cancel = CancellationToken::new();
        let handle = spawn_cleanup(
            db,
            Arc::new(NoopTrigger),
            Duration::from_secs(60),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
