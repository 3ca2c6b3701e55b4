//! HTTP surface of the gateway.

use crate::core::outcome::RequestError;
use crate::core::scheduler::SchedulerContext;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub mod chat;
pub mod queue;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SchedulerContext>,
}

/// Non-standard "client closed request" status reported for disconnects
/// and cancellations.
pub(crate) fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is a valid status code")
}

/// Error response in the OpenAI error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> ApiError {
        ApiError {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn from_request_error(request_id: Uuid, err: RequestError) -> ApiError {
        match err {
            RequestError::ClientDisconnected | RequestError::Cancelled => ApiError::new(
                client_closed_request(),
                "client_closed_request",
                format!("[{request_id}] {err}"),
            ),
            RequestError::Backend(_) | RequestError::Internal(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                format!("[{request_id}] {err}"),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.message,
                    "type": self.kind,
                }
            })),
        )
            .into_response()
    }
}
