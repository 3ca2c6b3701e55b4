//! Queue observability and out-of-band cancellation endpoints.

use crate::api::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde_json::json;
use uuid::Uuid;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queue", get(queue_status))
        .route("/cancel/:request_id", post(cancel_request))
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.ctx.status();
    Json(json!({
        "status": "ok",
        "queue_length": status.queue_length,
        "processing": status.processing,
        "accepting": !state.ctx.is_shutting_down(),
    }))
}

async fn queue_status(State(state): State<AppState>) -> Json<schemas::QueueStatusResponse> {
    Json(state.ctx.status().into())
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Response {
    info!("[{request_id}] received cancellation request");
    if state.ctx.cancel(request_id) {
        Json(json!({
            "success": true,
            "message": format!("Request {request_id} marked as cancelled in queue."),
        }))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "message": format!(
                    "Request {request_id} not found in queue (it may be executing or already finished)."
                ),
            })),
        )
            .into_response()
    }
}

pub mod schemas {
    use crate::core::queue::QueuedItem;
    use crate::core::scheduler::QueueStatus;
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Serialize, Debug)]
    pub struct QueueStatusResponse {
        pub queue_length: usize,
        pub is_processing_locked: bool,
        pub items: Vec<QueueItemStatus>,
    }

    #[derive(Serialize, Debug)]
    pub struct QueueItemStatus {
        pub request_id: Uuid,
        pub enqueue_time: DateTime<Utc>,
        pub wait_time_seconds: f64,
        pub is_streaming: bool,
        pub cancelled: bool,
    }

    impl From<QueuedItem> for QueueItemStatus {
        fn from(item: QueuedItem) -> Self {
            QueueItemStatus {
                request_id: item.request_id,
                enqueue_time: item.enqueued_at,
                wait_time_seconds: (item.wait_seconds * 100.0).round() / 100.0,
                is_streaming: item.streaming,
                cancelled: item.cancelled,
            }
        }
    }

    impl From<QueueStatus> for QueueStatusResponse {
        fn from(status: QueueStatus) -> Self {
            QueueStatusResponse {
                queue_length: status.queue_length,
                is_processing_locked: status.processing,
                items: status.items.into_iter().map(QueueItemStatus::from).collect(),
            }
        }
    }
}
