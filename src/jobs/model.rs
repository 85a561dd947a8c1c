//! Request/response job rows.

use serde::{Deserialize, Serialize};

use crate::llm::provider::ChatCompletionRequest;
use crate::runs::model::{new_id, unix_now};

/// A queued chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionJob {
    pub id: String,
    pub created_at: i64,
    pub claimed_by: Option<String>,
    pub done: bool,
    pub response_id: Option<String>,
    pub body: ChatCompletionRequest,
}

impl ChatCompletionJob {
    pub fn new(body: ChatCompletionRequest) -> Self {
        Self {
            id: new_id("chatcmpl-req"),
            created_at: unix_now(),
            claimed_by: None,
            done: false,
            response_id: None,
            body,
        }
    }
}

/// The single response written for a [`ChatCompletionJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResult {
    pub id: String,
    pub created_at: i64,
    pub request_id: String,
    pub status_code: u16,
    pub error: Option<String>,
    /// Upstream response body on success.
    pub body: Option<serde_json::Value>,
}

impl ChatCompletionResult {
    pub fn ok(request_id: &str, body: serde_json::Value) -> Self {
        Self {
            id: new_id("chatcmpl"),
            created_at: unix_now(),
            request_id: request_id.to_string(),
            status_code: 200,
            error: None,
            body: Some(body),
        }
    }

    pub fn err(request_id: &str, status_code: u16, error: impl Into<String>) -> Self {
        Self {
            id: new_id("chatcmpl"),
            created_at: unix_now(),
            request_id: request_id.to_string(),
            status_code,
            error: Some(error.into()),
            body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// One built-in tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub id: String,
    pub created_at: i64,
    pub run_id: String,
    pub step_id: String,
    pub tool_call_id: String,
    pub program: String,
    pub env: std::collections::BTreeMap<String, String>,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    /// `None` until someone approves (`Some(true)`) or denies (`Some(false)`).
    pub confirmed: Option<bool>,
}

impl ToolRun {
    pub fn new(
        run_id: &str,
        step_id: &str,
        tool_call_id: &str,
        program: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("toolrun"),
            created_at: unix_now(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            program: program.into(),
            env: Default::default(),
            input: input.into(),
            output: None,
            error: None,
            confirmed: None,
        }
    }
}
