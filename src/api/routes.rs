//! HTTP routes over the run operations and the chat-completion queue.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use super::sse::{run_event_stream, sse_response};
use crate::jobs::completion::submit_and_wait;
use crate::llm::provider::ChatCompletionRequest;
use crate::runs::model::Run;
use crate::runs::ops::{
    ConfirmToolCall, CreateAssistant, CreateRun, CreateThread, NewMessage, SubmitToolOutputs,
};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/assistants", post(create_assistant))
        .route("/v1/threads", post(create_thread))
        .route(
            "/v1/threads/{thread_id}/messages",
            post(add_message).get(list_messages),
        )
        .route("/v1/threads/{thread_id}/runs", post(create_run))
        .route("/v1/threads/{thread_id}/runs/{run_id}", get(get_run))
        .route("/v1/threads/{thread_id}/runs/{run_id}/steps", get(list_steps))
        .route("/v1/threads/{thread_id}/runs/{run_id}/events", get(stream_events))
        .route("/v1/threads/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .route(
            "/v1/threads/{thread_id}/runs/{run_id}/submit_tool_outputs",
            post(submit_tool_outputs),
        )
        .route("/v1/threads/{thread_id}/runs/{run_id}/confirm", post(confirm))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

fn list<T: serde::Serialize>(data: Vec<T>) -> Json<serde_json::Value> {
    Json(json!({ "object": "list", "data": data }))
}

fn run_json(run: &Run) -> Json<serde_json::Value> {
    Json(json!(run.to_public()))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "assistants-engine"
    }))
}

// ── Assistants, threads, messages ───────────────────────────────────────

async fn create_assistant(
    State(state): State<AppState>,
    Json(body): Json<CreateAssistant>,
) -> Result<Response, ApiError> {
    let assistant = state.runs.create_assistant(body).await?;
    Ok((StatusCode::OK, Json(json!(assistant))).into_response())
}

async fn create_thread(
    State(state): State<AppState>,
    body: Option<Json<CreateThread>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let thread = state.runs.create_thread(body).await?;
    Ok(Json(json!(thread)).into_response())
}

async fn add_message(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<NewMessage>,
) -> Result<Response, ApiError> {
    let message = state.runs.add_message(&thread_id, body).await?;
    Ok(Json(json!(message)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let messages = state.runs.list_messages(&thread_id, limit).await?;
    Ok(list(messages).into_response())
}

// ── Runs ────────────────────────────────────────────────────────────────

async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<CreateRun>,
) -> Result<Response, ApiError> {
    let stream = body.stream;
    let run = state.runs.create_run(&thread_id, body).await?;
    if stream {
        return Ok(follow(&state, run.id, 0));
    }
    Ok(run_json(&run).into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let run = state.runs.get_run(&thread_id, &run_id).await?;
    Ok(run_json(&run).into_response())
}

async fn list_steps(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let steps = state.runs.list_run_steps(&thread_id, &run_id).await?;
    Ok(list(steps).into_response())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: i64,
}

async fn stream_events(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    state.runs.get_run(&thread_id, &run_id).await?;
    Ok(follow(&state, run_id, query.after))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let run = state.runs.cancel_run(&thread_id, &run_id).await?;
    Ok(run_json(&run).into_response())
}

async fn submit_tool_outputs(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Json(body): Json<SubmitToolOutputs>,
) -> Result<Response, ApiError> {
    let before = state.runs.get_run(&thread_id, &run_id).await?.event_index;
    let run = state
        .runs
        .submit_tool_outputs(&thread_id, &run_id, body.tool_outputs)
        .await?;
    if body.stream {
        return Ok(follow(&state, run.id, before));
    }
    Ok(run_json(&run).into_response())
}

async fn confirm(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Json(body): Json<ConfirmToolCall>,
) -> Result<Response, ApiError> {
    let run = state.runs.confirm_tool_call(&thread_id, &run_id, body).await?;
    Ok(run_json(&run).into_response())
}

fn follow(state: &AppState, run_id: String, after: i64) -> Response {
    sse_response(run_event_stream(
        state.runs.db().clone(),
        run_id,
        after,
        state.event_poll_interval,
    ))
}

// ── Chat completions ────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let result = submit_and_wait(
        state.runs.db().as_ref(),
        state.chat_trigger.as_ref(),
        body,
        state.poll_interval,
        state.completion_timeout,
    )
    .await?;

    if result.is_success() {
        let body = result.body.unwrap_or(serde_json::Value::Null);
        return Ok((StatusCode::OK, Json(body)).into_response());
    }
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let message = result.error.unwrap_or_else(|| "upstream request failed".to_string());
    Err(ApiError::new(status, "upstream_error", None, message))
}
