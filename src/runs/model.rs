//! Assistants, threads, messages, runs and run steps.

use serde::{Deserialize, Serialize};

use crate::llm::provider::{FunctionDefinition, ToolCallDelta, WireFunctionCall, WireToolCall};
use crate::runs::state::{MessageStatus, RunStatus, StepStatus, SystemStatus};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate an id with a kind prefix, e.g. `run-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// A tool an assistant exposes to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantTool {
    /// Client-executed function; results come back through submit_tool_outputs.
    Function { function: FunctionDefinition },
    /// Built-in tool executed by the tool-step worker, looked up by name.
    Builtin { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assistant {
    pub id: String,
    pub created_at: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<AssistantTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub created_at: i64,
    /// Run currently holding the thread, if any.
    #[serde(default)]
    pub locked_by_run_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Thread {
    pub fn new(metadata: serde_json::Value) -> Self {
        Self {
            id: new_id("thread"),
            created_at: unix_now(),
            locked_by_run_id: None,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub created_at: i64,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub incomplete_at: Option<i64>,
}

impl Message {
    /// A finished client-authored message.
    pub fn user(thread_id: &str, content: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            id: new_id("msg"),
            created_at: now,
            thread_id: thread_id.to_string(),
            role: Role::User,
            content: content.into(),
            assistant_id: None,
            run_id: None,
            status: MessageStatus::Completed,
            completed_at: Some(now),
            incomplete_at: None,
        }
    }

    /// Empty in-progress message written by `run`.
    pub fn assistant_draft(run: &Run) -> Self {
        Self {
            id: new_id("msg"),
            created_at: unix_now(),
            thread_id: run.thread_id.clone(),
            role: Role::Assistant,
            content: String::new(),
            assistant_id: Some(run.assistant_id.clone()),
            run_id: Some(run.id.clone()),
            status: MessageStatus::InProgress,
            completed_at: None,
            incomplete_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ServerError,
    RateLimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

impl LastError {
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ServerError,
            message: message.into(),
        }
    }

    /// Classify an upstream HTTP status: 429 is a rate limit, anything else a
    /// server error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let code = if status == 429 {
            ErrorCode::RateLimitExceeded
        } else {
            ErrorCode::ServerError
        };
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    #[default]
    Function,
}

/// A (possibly still streaming) tool call recorded in step details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: ToolCallType,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    /// Filled once the call has been answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ToolCall {
    /// A call holding only what one fragment carries.
    pub fn from_delta(delta: &ToolCallDelta) -> Self {
        let function = delta.function.as_ref();
        Self {
            index: delta.index,
            id: delta.id.clone().unwrap_or_default(),
            call_type: ToolCallType::Function,
            function: FunctionCall {
                name: function.and_then(|f| f.name.clone()).unwrap_or_default(),
                arguments: function
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default(),
                output: None,
            },
        }
    }

    pub fn to_wire(&self) -> WireToolCall {
        WireToolCall {
            id: self.id.clone(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: self.function.name.clone(),
                arguments: self.function.arguments.clone(),
            },
        }
    }
}

/// Merge streamed deltas into the accumulated call list.
///
/// Calls are addressed by `index`; ids and names are set by the first
/// fragment carrying them, arguments are concatenated in arrival order.
/// Returns whether anything changed.
pub fn merge_tool_call_deltas(calls: &mut Vec<ToolCall>, deltas: &[ToolCallDelta]) -> bool {
    let mut changed = false;
    for delta in deltas {
        let Some(call) = calls.iter_mut().find(|c| c.index == delta.index) else {
            calls.push(ToolCall::from_delta(delta));
            changed = true;
            continue;
        };
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            if call.id.is_empty() {
                call.id = id.to_string();
                changed = true;
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                if call.function.name.is_empty() {
                    call.function.name = name.to_string();
                    changed = true;
                }
            }
            if let Some(args) = function.arguments.as_deref().filter(|a| !a.is_empty()) {
                call.function.arguments.push_str(args);
                changed = true;
            }
        }
    }
    calls.sort_by_key(|c| c.index);
    changed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreation {
    pub message_id: String,
}

/// What a run step did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetails {
    MessageCreation { message_creation: MessageCreation },
    ToolCalls { tool_calls: Vec<ToolCall> },
}

impl StepDetails {
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::ToolCalls { tool_calls } => tool_calls,
            Self::MessageCreation { .. } => &[],
        }
    }

    pub fn tool_calls_mut(&mut self) -> Option<&mut Vec<ToolCall>> {
        match self {
            Self::ToolCalls { tool_calls } => Some(tool_calls),
            Self::MessageCreation { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    MessageCreation,
    ToolCalls,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCreation => "message_creation",
            Self::ToolCalls => "tool_calls",
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_creation" => Ok(Self::MessageCreation),
            "tool_calls" => Ok(Self::ToolCalls),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// Marks a step that belongs to the tool-step worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    Tools,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub created_at: i64,
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    pub step_details: StepDetails,
    #[serde(default, skip_serializing)]
    pub runner_type: Option<RunnerType>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub expired_at: Option<i64>,
}

impl RunStep {
    fn new(run: &Run, step_type: StepType, step_details: StepDetails) -> Self {
        Self {
            id: new_id("step"),
            created_at: unix_now(),
            run_id: run.id.clone(),
            thread_id: run.thread_id.clone(),
            assistant_id: run.assistant_id.clone(),
            step_type,
            status: StepStatus::InProgress,
            step_details,
            runner_type: None,
            last_error: None,
            completed_at: None,
            cancelled_at: None,
            failed_at: None,
            expired_at: None,
        }
    }

    pub fn tool_calls(run: &Run, calls: Vec<ToolCall>) -> Self {
        Self::new(
            run,
            StepType::ToolCalls,
            StepDetails::ToolCalls { tool_calls: calls },
        )
    }

    pub fn message_creation(run: &Run, message_id: &str) -> Self {
        Self::new(
            run,
            StepType::MessageCreation,
            StepDetails::MessageCreation {
                message_creation: MessageCreation {
                    message_id: message_id.to_string(),
                },
            },
        )
    }

    pub fn complete(&mut self, now: i64) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: LastError, now: i64) {
        self.status = StepStatus::Failed;
        self.last_error = Some(error);
        self.failed_at = Some(now);
    }
}

/// Pending confirmation of one built-in call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub tool_call_id: String,
    pub step_id: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

/// What the run needs from outside before it can continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequiredAction {
    SubmitToolOutputs {
        submit_tool_outputs: SubmitToolOutputs,
    },
    Confirm {
        confirm: PendingConfirmation,
    },
}

impl RequiredAction {
    pub fn submit(tool_calls: Vec<ToolCall>) -> Self {
        Self::SubmitToolOutputs {
            submit_tool_outputs: SubmitToolOutputs { tool_calls },
        }
    }

    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::SubmitToolOutputs {
                submit_tool_outputs,
            } => &submit_tool_outputs.tool_calls,
            Self::Confirm { .. } => &[],
        }
    }
}

/// A run as stored. `system_status`, claimants and `event_index` are internal.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: String,
    pub created_at: i64,
    pub thread_id: String,
    pub assistant_id: String,
    pub model: String,
    pub instructions: Option<String>,
    pub additional_instructions: Option<String>,
    pub tools: Vec<AssistantTool>,
    pub status: RunStatus,
    pub system_status: Option<SystemStatus>,
    pub claimed_by: Option<String>,
    pub system_claimed_by: Option<String>,
    pub event_index: i64,
    pub required_action: Option<RequiredAction>,
    pub last_error: Option<LastError>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl Run {
    /// A freshly queued run for `assistant` on `thread_id`.
    pub fn queued(thread_id: &str, assistant: &Assistant, ttl_secs: i64) -> Self {
        let now = unix_now();
        Self {
            id: new_id("run"),
            created_at: now,
            thread_id: thread_id.to_string(),
            assistant_id: assistant.id.clone(),
            model: assistant.model.clone(),
            instructions: assistant.instructions.clone(),
            additional_instructions: None,
            tools: assistant.tools.clone(),
            status: RunStatus::Queued,
            system_status: None,
            claimed_by: None,
            system_claimed_by: None,
            event_index: 0,
            required_action: None,
            last_error: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            failed_at: None,
            expires_at: Some(now + ttl_secs),
        }
    }

    pub fn fail(&mut self, error: LastError, now: i64) {
        self.status = RunStatus::Failed;
        self.system_status = None;
        self.required_action = None;
        self.last_error = Some(error);
        self.failed_at = Some(now);
    }

    pub fn complete(&mut self, now: i64) {
        self.status = RunStatus::Completed;
        self.system_status = None;
        self.required_action = None;
        self.completed_at = Some(now);
    }

    /// Client-facing representation.
    pub fn to_public(&self) -> PublicRun {
        PublicRun {
            id: self.id.clone(),
            object: PublicRun::OBJECT.to_string(),
            created_at: self.created_at,
            thread_id: self.thread_id.clone(),
            assistant_id: self.assistant_id.clone(),
            status: self.status,
            required_action: self
                .required_action
                .clone()
                .filter(|_| self.status.exposes_required_action()),
            last_error: self.last_error.clone(),
            expires_at: self.expires_at,
            started_at: self.started_at,
            cancelled_at: self.cancelled_at,
            failed_at: self.failed_at,
            completed_at: self.completed_at,
            model: self.model.clone(),
            instructions: self.instructions.clone(),
            additional_instructions: self.additional_instructions.clone(),
            tools: self.tools.clone(),
        }
    }

    /// Rebuild a run from its public form. Internal fields start empty.
    pub fn from_public(public: PublicRun) -> Self {
        Self {
            id: public.id,
            created_at: public.created_at,
            thread_id: public.thread_id,
            assistant_id: public.assistant_id,
            model: public.model,
            instructions: public.instructions,
            additional_instructions: public.additional_instructions,
            tools: public.tools,
            status: public.status,
            system_status: None,
            claimed_by: None,
            system_claimed_by: None,
            event_index: 0,
            required_action: public.required_action,
            last_error: public.last_error,
            started_at: public.started_at,
            completed_at: public.completed_at,
            cancelled_at: public.cancelled_at,
            failed_at: public.failed_at,
            expires_at: public.expires_at,
        }
    }
}

/// `thread.run` object as returned by the API and carried in events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicRun {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<AssistantTool>,
}

impl PublicRun {
    pub const OBJECT: &'static str = "thread.run";
}
