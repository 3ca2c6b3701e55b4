//! Seam interfaces between the scheduler core and its collaborators.

use crate::core::outcome::TurnOutcome;
use crate::core::queue::{NormalizedRequest, ResultSink};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Capability to ask whether the originating client is still connected.
///
/// The core only ever polls this; it never closes or mutates the underlying
/// connection.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// The single-concurrency execution backend that carries out one
/// conversational turn.
///
/// `execute` is only ever called while the worker holds the execution gate.
/// The auxiliary gates in [`TurnGates`](crate::core::scheduler::TurnGates)
/// are taken by implementations, never by the worker.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runs one turn.
    ///
    /// On `Ok(TurnOutcome::Completed)` the backend has already resolved
    /// `sink`. On `Ok(TurnOutcome::StreamingStarted(_))` the spawned
    /// streaming delivery resolves it. On `Err` the caller (the worker)
    /// resolves it with a backend failure.
    async fn execute(
        &self,
        request_id: Uuid,
        payload: &NormalizedRequest,
        probe: Arc<dyn LivenessProbe>,
        sink: &ResultSink,
    ) -> anyhow::Result<TurnOutcome>;
}

/// Shared fragment buffer of the streaming capture path.
///
/// Cleared by the worker after every turn so no fragment can leak into the
/// next request.
#[async_trait]
pub trait StreamCache: Send + Sync {
    /// Discards all buffered fragments, returning how many were dropped.
    async fn clear(&self) -> anyhow::Result<usize>;
}
