//! Thin HTTP surface: routes, SSE framing and error bodies.

pub mod error;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use crate::jobs::trigger::Trigger;
use crate::runs::ops::RunService;

pub use error::ApiError;
pub use routes::router;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunService>,
    /// Wakes the chat-completion worker.
    pub chat_trigger: Arc<dyn Trigger>,
    /// Store re-check interval while waiting on a chat completion.
    pub poll_interval: Duration,
    /// Give up on a chat completion after this long.
    pub completion_timeout: Duration,
    pub event_poll_interval: Duration,
}

impl AppState {
    pub fn new(runs: Arc<RunService>, chat_trigger: Arc<dyn Trigger>, poll_interval: Duration) -> Self {
        Self {
            runs,
            chat_trigger,
            poll_interval,
            completion_timeout: Duration::from_secs(120),
            event_poll_interval: sse::EVENT_POLL_INTERVAL,
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}
