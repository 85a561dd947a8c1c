//! Ordered write units for a single run.
//!
//! A batch is applied in one transaction: every row mutation and the events
//! reporting it commit together or not at all, which keeps `event_index`
//! gapless.

use crate::runs::events::{EventName, EventPayload, MessageDelta, RunStepDelta};
use crate::runs::model::{Message, Run, RunStep};
use crate::runs::state::RunStatus;

/// One operation inside a [`RunBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Abort unless the run's stored status is one of these.
    ExpectRunStatus(Vec<RunStatus>),
    /// Upsert the run row (never touches `event_index`).
    PutRun(Box<Run>),
    PutStep(Box<RunStep>),
    PutMessage(Box<Message>),
    /// Take the thread lock; fails with `ThreadLocked` if another run holds it.
    LockThread { thread_id: String },
    /// Release the thread lock if this run holds it.
    UnlockThread { thread_id: String },
    /// Append an event at the next `event_index`.
    Emit {
        name: EventName,
        payload: Box<EventPayload>,
    },
}

/// Ordered writes against one run.
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub run_id: String,
    pub ops: Vec<WriteOp>,
}

impl RunBatch {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ops: Vec::new(),
        }
    }

    pub fn expect_status(mut self, statuses: &[RunStatus]) -> Self {
        self.ops.push(WriteOp::ExpectRunStatus(statuses.to_vec()));
        self
    }

    pub fn put_run(mut self, run: &Run) -> Self {
        self.ops.push(WriteOp::PutRun(Box::new(run.clone())));
        self
    }

    pub fn put_step(mut self, step: &RunStep) -> Self {
        self.ops.push(WriteOp::PutStep(Box::new(step.clone())));
        self
    }

    pub fn put_message(mut self, message: &Message) -> Self {
        self.ops.push(WriteOp::PutMessage(Box::new(message.clone())));
        self
    }

    pub fn lock_thread(mut self, thread_id: &str) -> Self {
        self.ops.push(WriteOp::LockThread {
            thread_id: thread_id.to_string(),
        });
        self
    }

    pub fn unlock_thread(mut self, thread_id: &str) -> Self {
        self.ops.push(WriteOp::UnlockThread {
            thread_id: thread_id.to_string(),
        });
        self
    }

    pub fn emit(mut self, name: EventName, payload: EventPayload) -> Self {
        self.ops.push(WriteOp::Emit {
            name,
            payload: Box::new(payload),
        });
        self
    }

    /// Upsert the run and emit its snapshot.
    pub fn run_event(self, name: EventName, run: &Run) -> Self {
        self.put_run(run)
            .emit(name, EventPayload::Run(run.to_public()))
    }

    /// Upsert the step and emit its snapshot.
    pub fn step_event(self, name: EventName, step: &RunStep) -> Self {
        self.put_step(step)
            .emit(name, EventPayload::RunStep(step.clone()))
    }

    /// Upsert the message and emit its snapshot.
    pub fn message_event(self, name: EventName, message: &Message) -> Self {
        self.put_message(message)
            .emit(name, EventPayload::Message(message.clone()))
    }

    /// Upsert the step and emit only the changed part.
    pub fn step_delta(self, step: &RunStep, delta: RunStepDelta) -> Self {
        self.put_step(step)
            .emit(EventName::StepDelta, EventPayload::RunStepDelta(delta))
    }

    /// Upsert the message and emit only the appended text.
    pub fn message_delta(self, message: &Message, fragment: &str) -> Self {
        self.put_message(message).emit(
            EventName::MessageDelta,
            EventPayload::MessageDelta(MessageDelta::new(&message.id, fragment)),
        )
    }
}
