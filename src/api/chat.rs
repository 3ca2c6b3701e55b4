//! Chat-completion endpoint: admission, result wait, SSE delivery.

use crate::api::{ApiError, AppState};
use crate::core::outcome::{CompletionPayload, StreamEvent};
use crate::core::prompt::{self, ChatMessage};
use crate::core::queue::{GenerationParams, NormalizedRequest};
use crate::core::services::{ConnectionGuard, ConnectionWatch};
use async_stream::stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use log::{error, info};
use std::convert::Infallible;
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn router() -> Router<AppState> {
    Router::new().route("/chat/completions", post(chat_completions))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<schemas::ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let ctx = &state.ctx;
    let request_id = Uuid::new_v4();
    info!(
        "[{request_id}] received /v1/chat/completions request (stream={})",
        request.stream
    );

    if ctx.is_shutting_down() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            format!("[{request_id}] service is shutting down, not accepting requests"),
        ));
    }

    let messages: Vec<ChatMessage> = request
        .messages
        .iter()
        .map(schemas::Message::to_chat_message)
        .collect();
    prompt::validate(&messages).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("[{request_id}] {err}"),
        )
    })?;
    let combined = prompt::combine(&messages).map_err(|err| {
        error!("[{request_id}] prompt assembly failed: {err:#}");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            format!("[{request_id}] failed to assemble the prompt"),
        )
    })?;

    let payload = NormalizedRequest {
        streaming: request.stream,
        prompt: combined,
        model: request.model.clone(),
        params: GenerationParams {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
            top_p: request.top_p,
            stop: request.stop.clone().unwrap_or_default(),
        },
    };

    // The guard rides along with this handler future (and later the SSE
    // stream); axum dropping either flips the probe to disconnected.
    let (probe, guard) = ConnectionWatch::new();
    let receiver = ctx.enqueue(request_id, payload, probe);

    let result = match tokio::time::timeout(ctx.settings.completion_timeout, receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            error!("[{request_id}] result sink dropped without a resolution");
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                format!("[{request_id}] request was dropped internally"),
            ));
        }
        Err(_) => {
            error!("[{request_id}] timed out waiting for the worker response");
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "server_error",
                format!("[{request_id}] request processing timed out waiting for the worker"),
            ));
        }
    };

    match result {
        Ok(CompletionPayload::Full(completion)) => {
            info!("[{request_id}] worker finished, returning the completion");
            Ok(Json(schemas::ChatCompletionResponse::new(request_id, completion)).into_response())
        }
        Ok(CompletionPayload::Streaming(events)) => {
            info!("[{request_id}] worker handed over a fragment stream");
            Ok(stream_response(request_id, request.model, events, guard))
        }
        Err(err) => Err(ApiError::from_request_error(request_id, err)),
    }
}

fn stream_response(
    request_id: Uuid,
    model: Option<String>,
    mut events: mpsc::Receiver<StreamEvent>,
    guard: ConnectionGuard,
) -> Response {
    let model = model.unwrap_or_else(|| "default".to_string());
    let stream = stream! {
        let _guard = guard;
        let created = Utc::now().timestamp();
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    let chunk = schemas::ChatCompletionChunk::delta(request_id, &model, created, delta);
                    yield Ok::<Event, Infallible>(
                        Event::default().json_data(chunk).expect("stream chunk serializes"),
                    );
                }
                StreamEvent::Done(usage) => {
                    let chunk = schemas::ChatCompletionChunk::stop(request_id, &model, created, usage);
                    yield Ok(Event::default().json_data(chunk).expect("stream chunk serializes"));
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

pub mod schemas {
    use crate::core::outcome::{Completion, UsageStats};
    use crate::core::prompt::{ChatMessage, Role};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug)]
    pub struct ChatCompletionRequest {
        pub model: Option<String>,
        #[serde(default)]
        pub messages: Vec<Message>,
        #[serde(default)]
        pub stream: bool,
        pub temperature: Option<f64>,
        #[serde(alias = "max_tokens")]
        pub max_output_tokens: Option<u32>,
        pub top_p: Option<f64>,
        pub stop: Option<Vec<String>>,
    }

    #[derive(Deserialize, Debug)]
    pub struct Message {
        pub role: String,
        #[serde(default)]
        pub content: MessageContent,
    }

    #[derive(Deserialize, Debug)]
    #[serde(untagged)]
    pub enum MessageContent {
        Text(String),
        Parts(Vec<ContentPart>),
    }

    impl Default for MessageContent {
        fn default() -> Self {
            MessageContent::Text(String::new())
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct ContentPart {
        #[serde(rename = "type", default)]
        pub kind: String,
        #[serde(default)]
        pub text: String,
    }

    impl Message {
        /// Flattens multi-part content down to its text parts.
        pub fn to_chat_message(&self) -> ChatMessage {
            let content = match &self.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Parts(parts) => parts
                    .iter()
                    .filter(|part| part.kind == "text")
                    .map(|part| part.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            ChatMessage {
                role: Role::from_wire(&self.role),
                content,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ChatCompletionResponse {
        pub id: String,
        pub object: &'static str,
        pub created: i64,
        pub model: String,
        pub choices: Vec<Choice>,
        pub usage: UsageStats,
    }

    #[derive(Serialize, Debug)]
    pub struct Choice {
        pub index: u32,
        pub message: ResponseMessage,
        pub finish_reason: &'static str,
    }

    #[derive(Serialize, Debug)]
    pub struct ResponseMessage {
        pub role: &'static str,
        pub content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reasoning_content: Option<String>,
    }

    impl ChatCompletionResponse {
        pub fn new(request_id: Uuid, completion: Completion) -> ChatCompletionResponse {
            ChatCompletionResponse {
                id: format!("chatcmpl-{request_id}"),
                object: "chat.completion",
                created: Utc::now().timestamp(),
                model: completion.model,
                choices: vec![Choice {
                    index: 0,
                    message: ResponseMessage {
                        role: "assistant",
                        content: completion.content,
                        reasoning_content: completion.reasoning,
                    },
                    finish_reason: "stop",
                }],
                usage: completion.usage,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ChatCompletionChunk {
        pub id: String,
        pub object: &'static str,
        pub created: i64,
        pub model: String,
        pub choices: Vec<ChunkChoice>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub usage: Option<UsageStats>,
    }

    #[derive(Serialize, Debug)]
    pub struct ChunkChoice {
        pub index: u32,
        pub delta: ChunkDelta,
        pub finish_reason: Option<&'static str>,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct ChunkDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
    }

    impl ChatCompletionChunk {
        pub fn delta(
            request_id: Uuid,
            model: &str,
            created: i64,
            content: String,
        ) -> ChatCompletionChunk {
            ChatCompletionChunk {
                id: format!("chatcmpl-{request_id}"),
                object: "chat.completion.chunk",
                created,
                model: model.to_string(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        content: Some(content),
                    },
                    finish_reason: None,
                }],
                usage: None,
            }
        }

        pub fn stop(
            request_id: Uuid,
            model: &str,
            created: i64,
            usage: UsageStats,
        ) -> ChatCompletionChunk {
            ChatCompletionChunk {
                id: format!("chatcmpl-{request_id}"),
                object: "chat.completion.chunk",
                created,
                model: model.to_string(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta::default(),
                    finish_reason: Some("stop"),
                }],
                usage: Some(usage),
            }
        }
    }

}
