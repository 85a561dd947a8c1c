//! Worker loop: wait on the timer, the trigger, or cancellation, whichever
//! fires first, then drain available jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::jobs::trigger::Trigger;

/// One kind of background job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Claim and process a single job. `Ok(false)` means there was no work.
    async fn process_next(&self) -> Result<bool, Error>;
}

/// Spawn a loop running `handler` until `cancel` fires.
///
/// After a job is processed the loop immediately looks for another; it only
/// sleeps once the queue is empty or the handler errors. Errors are logged
/// and retried on the next tick.
pub fn spawn_worker(
    handler: Arc<dyn JobHandler>,
    trigger: Arc<dyn Trigger>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = handler.name();
        info!(worker = name, interval_ms = interval.as_millis() as u64, "Worker started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match handler.process_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(worker = name, error = %e, "Job failed");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(worker = name, "Poll tick");
                }
                _ = trigger.triggered() => {
                    debug!(worker = name, "Triggered");
                    ticker.reset();
                }
            }
        }

        info!(worker = name, "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::jobs::trigger::{ChannelTrigger, NoopTrigger};

    /// Reports `jobs` units of work, then idles.
    struct Counting {
        jobs: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(jobs: usize) -> Arc<Self> {
            Arc::new(Self {
                jobs: AtomicUsize::new(jobs),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn process_next(&self) -> Result<bool, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.jobs.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(false);
            }
            self.jobs.store(left - 1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn drains_queue_without_waiting_for_ticks() {
        let handler = Counting::new(5);
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            handler.clone(),
            Arc::new(NoopTrigger),
            Duration::from_secs(60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.jobs.load(Ordering::SeqCst), 0);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn trigger_wakes_before_interval() {
        let handler = Counting::new(0);
        let trigger = Arc::new(ChannelTrigger::new());
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            handler.clone(),
            trigger.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = handler.calls.load(Ordering::SeqCst);

        trigger.kick("job-1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), before + 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_promptly() {
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            Counting::new(0),
            Arc::new(NoopTrigger),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
