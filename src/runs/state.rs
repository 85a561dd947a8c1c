//! Status enums for runs, steps and messages, with their transition rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Public status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a worker to claim it.
    Queued,
    /// Claimed and being worked on.
    InProgress,
    /// Waiting for the client to submit tool outputs.
    RequiresAction,
    /// Waiting for a tool call to be approved or denied.
    RequiresConfirmation,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, InProgress) | (Queued, Cancelled) | (Queued, Expired) | (Queued, Failed) |
            // From InProgress
            (InProgress, RequiresAction) | (InProgress, RequiresConfirmation) |
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Cancelled) |
            // From RequiresAction (outputs submitted, or given up on)
            (RequiresAction, Queued) | (RequiresAction, Cancelled) |
            (RequiresAction, Expired) | (RequiresAction, Failed) |
            // From RequiresConfirmation
            (RequiresConfirmation, InProgress) | (RequiresConfirmation, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Expired
        )
    }

    /// Statuses from which an explicit cancel is accepted.
    pub const CANCELLABLE: &'static [RunStatus] =
        &[Self::InProgress, Self::RequiresAction, Self::Queued];

    /// Whether `required_action` is visible to clients in this status.
    pub fn exposes_required_action(&self) -> bool {
        matches!(self, Self::RequiresAction | Self::RequiresConfirmation)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "requires_action" => Ok(Self::RequiresAction),
            "requires_confirmation" => Ok(Self::RequiresConfirmation),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Internal hand-off marker between the model-call worker and the tool-step
/// worker. Never shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    /// Ready for the model-call worker to resume.
    Queued,
    /// Built-in tool calls are waiting for the tool-step worker.
    RequiresAction,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::RequiresAction => "requires_action",
        }
    }
}

impl FromStr for SystemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "requires_action" => Ok(Self::RequiresAction),
            other => Err(format!("unknown system status: {other}")),
        }
    }
}

/// Status of a run step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Completed,
    Incomplete,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "incomplete" => Ok(Self::Incomplete),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Format a status list for error messages.
pub fn join_statuses(statuses: &[RunStatus]) -> String {
    statuses
        .iter()
        .map(RunStatus::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
