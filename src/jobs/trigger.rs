//! Wake/ready signalling layered over polling.
//!
//! `kick(id)` wakes a waiting poller and hands the caller a private signal
//! that fires when a worker calls `ready(id)`. Wake-ups coalesce: several
//! kicks before the poller looks collapse into one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

/// Fires once the request it was issued for has been processed.
pub struct ReadySignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ReadySignal {
    /// A signal that never fires on its own.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Wait until the signal fires. Also returns if the trigger dropped it.
    pub async fn wait(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                let _ = rx.wait_for(|fired| *fired).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Register (or reuse) the ready signal for `id` and wake a poller.
    fn kick(&self, id: &str) -> ReadySignal;

    /// Fire and forget the ready signal for `id`.
    fn ready(&self, id: &str);

    /// Resolves when a kick is pending.
    async fn triggered(&self);
}

/// In-process trigger.
#[derive(Default)]
pub struct ChannelTrigger {
    waiting: Mutex<HashMap<String, watch::Sender<bool>>>,
    wake: Notify,
}

impl ChannelTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids with an outstanding ready signal.
    pub fn pending(&self) -> usize {
        self.waiting.lock().map(|w| w.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Trigger for ChannelTrigger {
    fn kick(&self, id: &str) -> ReadySignal {
        let rx = {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            match waiting.get(id) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = watch::channel(false);
                    waiting.insert(id.to_string(), tx);
                    rx
                }
            }
        };
        // Stores at most one permit, so pending wake-ups coalesce.
        self.wake.notify_one();
        ReadySignal { rx: Some(rx) }
    }

    fn ready(&self, id: &str) {
        let tx = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(tx) = tx {
            tx.send_replace(true);
        }
    }

    async fn triggered(&self) {
        self.wake.notified().await;
    }
}

/// Pure polling: never wakes anyone early.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

#[async_trait]
impl Trigger for NoopTrigger {
    fn kick(&self, _id: &str) -> ReadySignal {
        ReadySignal::never()
    }

    fn ready(&self, _id: &str) {}

    async fn triggered(&self) {
        std::future::pending::<()>().await
    }
}

/// One trigger per job kind, shared by the API and the workers.
#[derive(Clone)]
pub struct Triggers {
    pub runs: Arc<dyn Trigger>,
    pub tool_steps: Arc<dyn Trigger>,
    pub chat_completions: Arc<dyn Trigger>,
}

impl Triggers {
    /// In-process triggers when `enabled`, otherwise pure polling.
    pub fn new(enabled: bool) -> Self {
        fn make(enabled: bool) -> Arc<dyn Trigger> {
            if enabled {
                Arc::new(ChannelTrigger::new())
            } else {
                Arc::new(NoopTrigger)
            }
        }
        Self {
            runs: make(enabled),
            tool_steps: make(enabled),
            chat_completions: make(enabled),
        }
    }
}
