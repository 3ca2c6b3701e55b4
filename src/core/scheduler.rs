//! Scheduler context: the queue, the gates, and the producer-facing API.

use crate::core::outcome::TurnResult;
use crate::core::queue::{AdmissionQueue, NormalizedRequest, PendingRequest, QueuedItem};
use crate::core::traits::LivenessProbe;
use crate::config::Settings;
use log::info;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Auxiliary gates serializing the two cross-cutting backend operations.
///
/// Acquisition order is fixed: the execution gate is outermost; these are
/// only ever taken by a backend while it already holds the execution gate.
pub struct TurnGates {
    pub model_switch: Mutex<()>,
    pub params_cache: Mutex<()>,
}

/// Everything the producers, the worker and the backend share, constructed
/// eagerly at the composition root and passed around by handle.
pub struct SchedulerContext {
    pub settings: Settings,
    pub queue: AdmissionQueue,
    /// At most one backend turn runs while this is held.
    pub turn_gate: Mutex<()>,
    pub gates: Arc<TurnGates>,
    pub shutdown: CancellationToken,
}

/// Snapshot answered by the queue-status query.
#[derive(Debug)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing: bool,
    pub items: Vec<QueuedItem>,
}

impl SchedulerContext {
    pub fn new(settings: Settings) -> Arc<SchedulerContext> {
        Arc::new(SchedulerContext {
            settings,
            queue: AdmissionQueue::new(),
            turn_gate: Mutex::new(()),
            gates: Arc::new(TurnGates {
                model_switch: Mutex::new(()),
                params_cache: Mutex::new(()),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Admission entry point: creates the record, queues it, and hands the
    /// caller the receiving half of its result sink.
    pub fn enqueue(
        &self,
        request_id: Uuid,
        payload: NormalizedRequest,
        probe: Arc<dyn LivenessProbe>,
    ) -> oneshot::Receiver<TurnResult> {
        let (record, receiver) = PendingRequest::new(request_id, payload, probe);
        self.queue.enqueue(record);
        info!(
            "[{request_id}] request admitted (queue length: {})",
            self.queue.len()
        );
        receiver
    }

    /// Out-of-band cancellation of a queued request.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let cancelled = self.queue.cancel(request_id);
        if cancelled {
            info!("[{request_id}] marked as cancelled while queued");
        }
        cancelled
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            processing: self.turn_gate.try_lock().is_err(),
            items: self.queue.snapshot(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
