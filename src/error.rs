//! Error types for the assistants engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Confirmation error: {0}")]
    Confirmation(#[from] ConfirmationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The thread already has an active run. A normal rejected request.
    #[error("Thread {thread_id} is locked by run {locked_by}")]
    ThreadLocked { thread_id: String, locked_by: String },

    /// A claimed run's thread lock does not point back at the run.
    #[error("Thread {thread_id} lock points at {found:?}, expected run {run_id}")]
    LockMismatch {
        thread_id: String,
        run_id: String,
        found: Option<String>,
    },

    /// A conditional status guard did not match the stored row.
    #[error("{entity} {id} is {status}, expected one of [{expected}]")]
    InvalidTransition {
        entity: String,
        id: String,
        status: String,
        expected: String,
    },
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    /// Upstream answered with a non-2xx status.
    #[error("Provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// The event stream broke its framing contract (error line, keep-alive flood).
    #[error("Stream fault: {0}")]
    StreamFault(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// HTTP status to record on a response row.
    pub fn status_code(&self) -> u16 {
        match self {
            LlmError::Status { status, .. } => *status,
            _ => 500,
        }
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} was cancelled")]
    Cancelled { name: String },
}

/// Run orchestration errors surfaced to callers of run operations.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run {run_id} produced neither a message nor tool calls")]
    Stalled { run_id: String },

    #[error("Run {run_id} is not waiting for tool outputs")]
    NotAwaitingOutputs { run_id: String },

    #[error("Tool outputs for run {run_id} do not match pending calls: {reason}")]
    OutputMismatch { run_id: String, reason: String },

    #[error("Run {run_id} has no pending confirmation for tool call {tool_call_id}")]
    NoPendingConfirmation {
        run_id: String,
        tool_call_id: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Confirmation handshake failures. Never treated as approval.
#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("Tool call {id} was denied")]
    Denied { id: String },

    #[error("Timed out waiting for confirmation of tool call {id}")]
    TimedOut { id: String },

    #[error("Database error while confirming {id}: {source}")]
    Database {
        id: String,
        #[source]
        source: DatabaseError,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
