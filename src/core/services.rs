//! Implementations for the services the gateway needs.
//!

use crate::core::outcome::{
    Completion, CompletionPayload, RequestError, StreamEvent, StreamingTurn, TurnOutcome,
};
use crate::core::prompt;
use crate::core::queue::{GenerationParams, NormalizedRequest, ResultSink};
use crate::core::scheduler::TurnGates;
use crate::core::traits::{ExecutionBackend, LivenessProbe, StreamCache};
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Liveness probe backed by a drop guard on the transport side.
///
/// The handler keeps the guard alive for as long as the client connection
/// is; when axum drops the handler (or the SSE stream), the guard's drop
/// flips the probe.
pub struct ConnectionWatch {
    connected: AtomicBool,
}

impl ConnectionWatch {
    pub fn new() -> (Arc<ConnectionWatch>, ConnectionGuard) {
        let watch = Arc::new(ConnectionWatch {
            connected: AtomicBool::new(true),
        });
        let guard = ConnectionGuard {
            watch: watch.clone(),
        };
        (watch, guard)
    }
}

#[async_trait]
impl LivenessProbe for ConnectionWatch {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

pub struct ConnectionGuard {
    watch: Arc<ConnectionWatch>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.watch.connected.store(false, Ordering::Release);
    }
}

/// Shared buffer for raw fragments captured off the session's stream.
///
/// The worker clears it after every turn; anything still inside belonged to
/// a request that is already over.
#[derive(Default)]
pub struct FragmentCache {
    fragments: Mutex<VecDeque<String>>,
}

impl FragmentCache {
    pub fn push(&self, fragment: String) {
        self.fragments
            .lock()
            .expect("fragment cache mutex poisoned")
            .push_back(fragment);
    }

    pub fn pop(&self) -> Option<String> {
        self.fragments
            .lock()
            .expect("fragment cache mutex poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.fragments
            .lock()
            .expect("fragment cache mutex poisoned")
            .len()
    }
}

#[async_trait]
impl StreamCache for FragmentCache {
    async fn clear(&self) -> anyhow::Result<usize> {
        let mut fragments = self
            .fragments
            .lock()
            .expect("fragment cache mutex poisoned");
        let dropped = fragments.len();
        fragments.clear();
        Ok(dropped)
    }
}

const DEFAULT_MODEL: &str = "echo-1";

/// Development backend: answers every prompt with an echo of the last user
/// turn. Drives the full admission/worker/transport pipeline without the
/// real automated session.
pub struct EchoBackend {
    gates: Arc<TurnGates>,
    current_model: Mutex<String>,
    cached_params: Mutex<Option<GenerationParams>>,
}

impl EchoBackend {
    pub fn new(gates: Arc<TurnGates>) -> EchoBackend {
        EchoBackend {
            gates,
            current_model: Mutex::new(DEFAULT_MODEL.to_string()),
            cached_params: Mutex::new(None),
        }
    }

    /// Switches the active model under the model-switch gate when the
    /// request names a different one.
    async fn ensure_model(&self, requested: Option<&str>) -> String {
        let requested = requested.unwrap_or(DEFAULT_MODEL);
        let needs_switch = *self
            .current_model
            .lock()
            .expect("model mutex poisoned")
            != requested;
        if needs_switch {
            let _switch = self.gates.model_switch.lock().await;
            let mut current = self.current_model.lock().expect("model mutex poisoned");
            if *current != requested {
                debug!("switching active model from {} to {requested}", *current);
                *current = requested.to_string();
            }
        }
        requested.to_string()
    }

    /// Refreshes the cached generation parameters under the params-cache
    /// gate.
    async fn refresh_params(&self, params: &GenerationParams) {
        let _refresh = self.gates.params_cache.lock().await;
        let mut cached = self.cached_params.lock().expect("params mutex poisoned");
        if cached.as_ref() != Some(params) {
            debug!("refreshing cached generation parameters: {params:?}");
            *cached = Some(params.clone());
        }
    }

    fn reply_for(prompt: &str) -> String {
        let tail = prompt.rsplit("User:\n").next().unwrap_or(prompt);
        let tail = tail.split("\n---\n").next().unwrap_or(tail);
        format!("Echo: {tail}")
    }
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    async fn execute(
        &self,
        request_id: Uuid,
        payload: &NormalizedRequest,
        probe: Arc<dyn LivenessProbe>,
        sink: &ResultSink,
    ) -> anyhow::Result<TurnOutcome> {
        let model = self.ensure_model(payload.model.as_deref()).await;
        self.refresh_params(&payload.params).await;

        if !probe.is_connected().await {
            sink.resolve(Err(RequestError::ClientDisconnected));
            return Ok(TurnOutcome::Completed);
        }

        let content = EchoBackend::reply_for(&payload.prompt);
        let stats = prompt::usage(&payload.prompt, &content, None);

        if !payload.streaming {
            sink.resolve(Ok(CompletionPayload::Full(Completion {
                model,
                content,
                reasoning: None,
                usage: stats,
            })));
            return Ok(TurnOutcome::Completed);
        }

        // Streaming delivery: it owns the sink from here, hands the caller
        // the fragment stream, and fires the completion signal when the
        // last fragment is out.
        let fragments: Vec<String> = content
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let (event_tx, event_rx) = mpsc::channel(fragments.len() + 1);
        let (done_tx, done_rx) = oneshot::channel();
        let sink = sink.clone();
        tokio::spawn(async move {
            sink.resolve(Ok(CompletionPayload::Streaming(event_rx)));
            for fragment in fragments {
                if event_tx.send(StreamEvent::Delta(fragment)).await.is_err() {
                    debug!("[{request_id}] stream receiver dropped, stopping delivery");
                    break;
                }
            }
            let _ = event_tx.send(StreamEvent::Done(stats)).await;
            let _ = done_tx.send(());
        });

        Ok(TurnOutcome::StreamingStarted(StreamingTurn {
            completion: done_rx,
        }))
    }
}
