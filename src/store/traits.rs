//! The `Database` trait: every persistence operation the engine needs.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::jobs::model::{ChatCompletionJob, ChatCompletionResult, ToolRun};
use crate::jobs::queue::JobKind;
use crate::runs::events::RunEvent;
use crate::runs::model::{Assistant, Message, Run, RunStep, Thread};
use crate::store::batch::RunBatch;

/// Backend-agnostic store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create tables and apply pending migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Assistants, threads, messages ───────────────────────────────

    async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), DatabaseError>;

    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>, DatabaseError>;

    async fn insert_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, DatabaseError>;

    /// Add a message. Rejected with `ThreadLocked` while a run holds the thread.
    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Messages of a thread, oldest first.
    async fn list_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    async fn get_run(&self, id: &str) -> Result<Option<Run>, DatabaseError>;

    /// Steps of a run, oldest first.
    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<RunStep>, DatabaseError>;

    /// Completed tool-call steps of a thread, oldest first.
    async fn list_thread_tool_steps(&self, thread_id: &str)
    -> Result<Vec<RunStep>, DatabaseError>;

    /// Apply a batch in one transaction. Returns the run's `event_index`
    /// after the last emitted event.
    async fn apply_run_batch(&self, batch: RunBatch) -> Result<i64, DatabaseError>;

    /// Cancel a run that is queued, in progress, or waiting for tool outputs.
    async fn cancel_run(&self, run_id: &str) -> Result<Run, DatabaseError>;

    /// Claim the next run for the model-call worker and move it to
    /// `in_progress`. Aborts with `LockMismatch` if the thread lock does not
    /// point at the run.
    async fn claim_run(&self, worker_id: &str) -> Result<Option<Run>, DatabaseError>;

    /// Claim the next run whose built-in tool calls are waiting.
    async fn claim_run_tool_step(&self, worker_id: &str) -> Result<Option<Run>, DatabaseError>;

    /// Release the thread lock outside any batch. Returns whether it was held
    /// by `run_id`.
    async fn force_unlock_thread(&self, thread_id: &str, run_id: &str)
    -> Result<bool, DatabaseError>;

    /// Events of a run with `response_idx > after`, ascending.
    async fn list_run_events(
        &self,
        run_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<RunEvent>, DatabaseError>;

    /// Expire queued or requires_action runs whose `expires_at` has passed.
    /// Returns the ids of the runs expired.
    async fn expire_runs(&self, now: i64) -> Result<Vec<String>, DatabaseError>;

    // ── Job queue ───────────────────────────────────────────────────

    /// Claim one row of `kind` for `worker_id`. `None` means no work.
    async fn dequeue(&self, kind: JobKind, worker_id: &str)
    -> Result<Option<String>, DatabaseError>;

    async fn insert_chat_completion_request(
        &self,
        job: &ChatCompletionJob,
    ) -> Result<(), DatabaseError>;

    async fn get_chat_completion_request(
        &self,
        id: &str,
    ) -> Result<Option<ChatCompletionJob>, DatabaseError>;

    /// Write the single response and mark the request done, atomically.
    async fn complete_chat_completion_request(
        &self,
        result: &ChatCompletionResult,
    ) -> Result<(), DatabaseError>;

    async fn get_chat_completion_response(
        &self,
        request_id: &str,
    ) -> Result<Option<ChatCompletionResult>, DatabaseError>;

    // ── Tool runs ───────────────────────────────────────────────────

    /// Insert the record unless one exists for the same run and call; return
    /// the stored record either way.
    async fn ensure_tool_run(&self, tool_run: &ToolRun) -> Result<ToolRun, DatabaseError>;

    async fn finish_tool_run(
        &self,
        id: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Record an approval or denial. Returns false if no record matches.
    async fn set_tool_confirmation(
        &self,
        run_id: &str,
        tool_call_id: &str,
        approved: bool,
    ) -> Result<bool, DatabaseError>;

    /// Read the confirmation and reset it to unset in one step.
    async fn take_tool_confirmation(&self, tool_run_id: &str)
    -> Result<Option<bool>, DatabaseError>;

    // ── Retention ───────────────────────────────────────────────────

    /// Delete responses older than `cutoff` with their requests.
    async fn delete_expired_chat_completions(&self, cutoff: i64) -> Result<usize, DatabaseError>;

    async fn delete_expired_run_events(&self, cutoff: i64) -> Result<usize, DatabaseError>;

    /// Run and step pruning. The selection currently matches nothing.
    async fn delete_expired_runs(&self, cutoff: i64) -> Result<usize, DatabaseError>;
}
