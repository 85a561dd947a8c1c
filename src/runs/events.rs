//! Run-event names and payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::runs::model::{Message, PublicRun, RunStep, StepDetails, Thread};

/// Name of an event in the run-event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    RunCreated,
    RunQueued,
    RunInProgress,
    RunRequiresAction,
    RunRequiresConfirmation,
    RunConfirmationResponded,
    RunCompleted,
    RunFailed,
    RunCancelled,
    RunExpired,
    StepCreated,
    StepInProgress,
    StepDelta,
    StepCompleted,
    StepFailed,
    StepCancelled,
    MessageCreated,
    MessageInProgress,
    MessageDelta,
    MessageCompleted,
    MessageIncomplete,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "thread.run.created",
            Self::RunQueued => "thread.run.queued",
            Self::RunInProgress => "thread.run.in_progress",
            Self::RunRequiresAction => "thread.run.requires_action",
            Self::RunRequiresConfirmation => "thread.run.requires_confirmation",
            Self::RunConfirmationResponded => "thread.run.confirmation_responded",
            Self::RunCompleted => "thread.run.completed",
            Self::RunFailed => "thread.run.failed",
            Self::RunCancelled => "thread.run.cancelled",
            Self::RunExpired => "thread.run.expired",
            Self::StepCreated => "thread.run.step.created",
            Self::StepInProgress => "thread.run.step.in_progress",
            Self::StepDelta => "thread.run.step.delta",
            Self::StepCompleted => "thread.run.step.completed",
            Self::StepFailed => "thread.run.step.failed",
            Self::StepCancelled => "thread.run.step.cancelled",
            Self::MessageCreated => "thread.message.created",
            Self::MessageInProgress => "thread.message.in_progress",
            Self::MessageDelta => "thread.message.delta",
            Self::MessageCompleted => "thread.message.completed",
            Self::MessageIncomplete => "thread.message.incomplete",
        }
    }

    /// Events after which a streaming client has nothing more to wait for.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::RunRequiresAction
                | Self::RunCompleted
                | Self::RunFailed
                | Self::RunCancelled
                | Self::RunExpired
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_NAMES: &[EventName] = &[
    EventName::RunCreated,
    EventName::RunQueued,
    EventName::RunInProgress,
    EventName::RunRequiresAction,
    EventName::RunRequiresConfirmation,
    EventName::RunConfirmationResponded,
    EventName::RunCompleted,
    EventName::RunFailed,
    EventName::RunCancelled,
    EventName::RunExpired,
    EventName::StepCreated,
    EventName::StepInProgress,
    EventName::StepDelta,
    EventName::StepCompleted,
    EventName::StepFailed,
    EventName::StepCancelled,
    EventName::MessageCreated,
    EventName::MessageInProgress,
    EventName::MessageDelta,
    EventName::MessageCompleted,
    EventName::MessageIncomplete,
];

impl FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_NAMES
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| format!("unknown event name: {s}"))
    }
}

/// Incremental step change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStepDelta {
    pub id: String,
    pub object: String,
    pub delta: RunStepDeltaBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStepDeltaBody {
    pub step_details: StepDetails,
}

impl RunStepDelta {
    pub fn new(step_id: &str, step_details: StepDetails) -> Self {
        Self {
            id: step_id.to_string(),
            object: "thread.run.step.delta".to_string(),
            delta: RunStepDeltaBody { step_details },
        }
    }
}

/// Incremental message text. Carries only the new fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    pub id: String,
    pub object: String,
    pub delta: MessageDeltaBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub content: String,
}

impl MessageDelta {
    pub fn new(message_id: &str, content: impl Into<String>) -> Self {
        Self {
            id: message_id.to_string(),
            object: "thread.message.delta".to_string(),
            delta: MessageDeltaBody {
                content: content.into(),
            },
        }
    }
}

/// Snapshot carried by one event. Exactly one kind per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Run(PublicRun),
    Thread(Thread),
    RunStep(RunStep),
    RunStepDelta(RunStepDelta),
    Message(Message),
    MessageDelta(MessageDelta),
}

impl EventPayload {
    /// JSON of the inner snapshot, as sent on the `data:` line.
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Run(v) => serde_json::to_string(v),
            Self::Thread(v) => serde_json::to_string(v),
            Self::RunStep(v) => serde_json::to_string(v),
            Self::RunStepDelta(v) => serde_json::to_string(v),
            Self::Message(v) => serde_json::to_string(v),
            Self::MessageDelta(v) => serde_json::to_string(v),
        }
    }
}

/// One row of the run-event log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub request_id: String,
    /// The run's `event_index` at emission. Gapless, starting at 1.
    pub response_idx: i64,
    pub created_at: i64,
    pub event_name: String,
    pub payload: EventPayload,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for name in ALL_NAMES {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), *name);
        }
    }

    #[test]
    fn payload_carries_explicit_kind() {
        let payload = EventPayload::MessageDelta(MessageDelta::new("msg-1", "lo"));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "message_delta");
        assert_eq!(value["data"]["delta"]["content"], "lo");

        let data = payload.data_json().unwrap();
        assert!(data.starts_with(r#"{"id":"msg-1""#));
    }

    #[test]
    fn payload_without_kind_is_rejected() {
        let raw = r#"{"data":{"id":"x"}}"#;
        assert!(serde_json::from_str::<EventPayload>(raw).is_err());
    }

    #[test]
    fn only_run_endings_are_done() {
        assert!(EventName::RunCompleted.is_done());
        assert!(EventName::RunRequiresAction.is_done());
        assert!(!EventName::RunRequiresConfirmation.is_done());
        assert!(!EventName::MessageCompleted.is_done());
    }
}
