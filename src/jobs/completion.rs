//! Chat-completion jobs: the request/response worker and the waiting side
//! used by the API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{DatabaseError, Error};
use crate::jobs::model::{ChatCompletionJob, ChatCompletionResult};
use crate::jobs::poller::JobHandler;
use crate::jobs::queue::JobKind;
use crate::jobs::trigger::Trigger;
use crate::llm::provider::{ChatCompletionRequest, LlmProvider};
use crate::store::Database;

/// Claims queued chat-completion requests and answers them.
pub struct ChatCompletionWorker {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    trigger: Arc<dyn Trigger>,
    worker_id: String,
}

impl ChatCompletionWorker {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        trigger: Arc<dyn Trigger>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            llm,
            trigger,
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl JobHandler for ChatCompletionWorker {
    fn name(&self) -> &'static str {
        "chat_completion"
    }

    async fn process_next(&self) -> Result<bool, Error> {
        let Some(id) = self
            .db
            .dequeue(JobKind::ChatCompletion, &self.worker_id)
            .await?
        else {
            return Ok(false);
        };
        let job = self
            .db
            .get_chat_completion_request(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "chat_completion_request".into(),
                id: id.clone(),
            })?;
        debug!(request_id = %id, model = %job.body.model, "Chat completion claimed");

        let mut body = job.body.clone();
        body.stream = false;
        let result = match self.llm.complete(body).await {
            Ok(response) => ChatCompletionResult::ok(&id, serde_json::to_value(&response).map_err(DatabaseError::from)?),
            Err(e) => {
                info!(request_id = %id, error = %e, "Chat completion failed upstream");
                ChatCompletionResult::err(&id, e.status_code(), e.to_string())
            }
        };

        self.db.complete_chat_completion_request(&result).await?;
        self.trigger.ready(&id);
        Ok(true)
    }
}

/// Enqueue a request and wait for its response.
///
/// Waits on the ready signal or the poll interval, whichever comes first,
/// and re-checks the store each time. Gives up after `timeout`.
pub async fn submit_and_wait(
    db: &dyn Database,
    trigger: &dyn Trigger,
    request: ChatCompletionRequest,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<ChatCompletionResult, Error> {
    let job = ChatCompletionJob::new(request);
    db.insert_chat_completion_request(&job).await?;
    let mut ready = trigger.kick(&job.id);

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(result) = db.get_chat_completion_response(&job.id).await? {
            return Ok(result);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(ChatCompletionResult::err(
                &job.id,
                504,
                "timed out waiting for a worker",
            ));
        }
        tokio::select! {
            _ = ready.wait() => {}
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}
