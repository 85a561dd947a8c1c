//! Run-event streaming over `text/event-stream`.
//!
//! Frames are written by hand so the terminator can be exactly
//! `data: [DONE]` (or `event: done` + `data: [DONE]` once a named event has
//! gone out).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::error::Error;
use crate::store::Database;

/// How often a follower re-reads the event log once it has caught up.
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_PAGE: usize = 100;

/// One event frame. Unnamed frames carry only `data:`.
pub fn frame(event_name: Option<&str>, data: &str) -> String {
    match event_name {
        Some(name) if !name.is_empty() => format!("event: {name}\ndata: {data}\n\n"),
        _ => format!("data: {data}\n\n"),
    }
}

/// Stream terminator.
pub fn done_frame(named: bool) -> String {
    if named {
        "event: done\ndata: [DONE]\n\n".to_string()
    } else {
        "data: [DONE]\n\n".to_string()
    }
}

/// Replay events of `run_id` after `after` and follow new ones until one is
/// marked done. Store failures end the stream with an error frame.
pub fn run_event_stream(
    db: Arc<dyn Database>,
    run_id: String,
    after: i64,
    poll_interval: Duration,
) -> impl Stream<Item = Result<String, Infallible>> {
    async_stream::stream! {
        let mut after = after;
        let mut named = false;
        loop {
            let events = match db.list_run_events(&run_id, after, EVENT_PAGE).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Event stream read failed");
                    yield Ok(frame(None, &ApiError::from(Error::from(e)).to_json()));
                    yield Ok(done_frame(named));
                    return;
                }
            };
            let caught_up = events.len() < EVENT_PAGE;
            for event in events {
                after = event.response_idx;
                let data = match event.payload.data_json() {
                    Ok(data) => data,
                    Err(e) => {
                        let err = ApiError::from(Error::from(crate::error::DatabaseError::from(e)));
                        yield Ok(frame(None, &err.to_json()));
                        yield Ok(done_frame(named));
                        return;
                    }
                };
                named = true;
                yield Ok(frame(Some(&event.event_name), &data));
                if event.done {
                    debug!(run_id = %run_id, idx = after, "Event stream finished");
                    yield Ok(done_frame(named));
                    return;
                }
            }
            if caught_up {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Wrap a frame stream in a streaming response.
pub fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = Result<String, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
