//! Request outcomes and the terminal error taxonomy.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Terminal status of a request, delivered exactly once through its
/// [`ResultSink`](crate::core::queue::ResultSink).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The originating client went away before the turn could run.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The request was cancelled out-of-band before the turn could run.
    #[error("request cancelled")]
    Cancelled,

    /// The backend turn itself failed.
    #[error("backend turn failed: {0}")]
    Backend(String),

    /// Something went wrong inside the gateway while the request was held.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type TurnResult = Result<CompletionPayload, RequestError>;

/// What the caller receives on success.
#[derive(Debug)]
pub enum CompletionPayload {
    /// The whole completion, ready to serialize.
    Full(Completion),
    /// A live fragment stream the transport keeps pumping into SSE chunks.
    Streaming(mpsc::Receiver<StreamEvent>),
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub model: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: UsageStats,
}

#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done(UsageStats),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// How a backend call ended, as seen by the worker.
///
/// The error arm of the backend's `Result` is the third case: the turn
/// raised, and the worker resolves the sink with [`RequestError::Backend`].
#[derive(Debug)]
pub enum TurnOutcome {
    /// The backend resolved the sink itself; nothing left to deliver.
    Completed,
    /// A streaming delivery is in flight. The worker must NOT resolve the
    /// sink; the delivery resolves it once the stream is handed to the
    /// caller.
    StreamingStarted(StreamingTurn),
}

/// Handle to an in-flight streaming delivery.
#[derive(Debug)]
pub struct StreamingTurn {
    /// Fired by the delivery once the last fragment has been handed over.
    pub completion: oneshot::Receiver<()>,
}
