//! Error bodies: `{"error": {"message", "type", "code"}}` with a status
//! derived from the failure kind.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::{DatabaseError, Error};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: ErrorDetail {
                    message: message.into(),
                    kind,
                    code: code.map(str::to_string),
                },
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", None, message)
    }

    /// The body as one JSON line, for the tail of an event stream.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_else(|_| {
            r#"{"error":{"message":"internal error","type":"server_error","code":null}}"#.to_string()
        })
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match &err {
            Error::Database(DatabaseError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, "invalid_request_error", Some("not_found"), message)
            }
            Error::Database(DatabaseError::ThreadLocked { .. }) => {
                Self::new(StatusCode::CONFLICT, "invalid_request_error", Some("thread_locked"), message)
            }
            Error::Database(DatabaseError::InvalidTransition { .. }) => {
                Self::new(StatusCode::CONFLICT, "invalid_request_error", Some("invalid_state"), message)
            }
            Error::Run(_) => Self::bad_request(message),
            Error::Llm(e) => {
                let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
                Self::new(status, "upstream_error", None, message)
            }
            _ => {
                error!(error = %err, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None, "internal server error")
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        Error::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
