//! Pending-request records and the FIFO admission queue.

use crate::core::outcome::{RequestError, TurnResult};
use crate::core::traits::LivenessProbe;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// The request as the worker and backend see it: prompt already assembled,
/// parameters extracted. Read-only past admission.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub streaming: bool,
    pub prompt: String,
    pub model: Option<String>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
}

/// Single-assignment destination for a request's terminal outcome.
///
/// Cloned freely between the worker, the backend and its streaming delivery;
/// whichever of them resolves first wins, every later attempt is a no-op
/// reporting `false`.
#[derive(Clone)]
pub struct ResultSink {
    tx: Arc<Mutex<Option<oneshot::Sender<TurnResult>>>>,
}

impl ResultSink {
    pub fn channel() -> (ResultSink, oneshot::Receiver<TurnResult>) {
        let (tx, rx) = oneshot::channel();
        (
            ResultSink {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers the outcome. Returns `false` if the sink was already
    /// resolved; the passed result is dropped in that case.
    pub fn resolve(&self, result: TurnResult) -> bool {
        let sender = self
            .tx
            .lock()
            .expect("result sink mutex poisoned")
            .take();
        match sender {
            Some(tx) => {
                // The caller may already be gone; the record still counts
                // as resolved.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx
            .lock()
            .expect("result sink mutex poisoned")
            .is_none()
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// One admitted request, alive until its sink is resolved.
pub struct PendingRequest {
    pub request_id: Uuid,
    pub payload: NormalizedRequest,
    pub probe: Arc<dyn LivenessProbe>,
    pub sink: ResultSink,
    pub enqueued_at: DateTime<Utc>,
    cancelled: AtomicBool,
}

impl PendingRequest {
    pub fn new(
        request_id: Uuid,
        payload: NormalizedRequest,
        probe: Arc<dyn LivenessProbe>,
    ) -> (Arc<PendingRequest>, oneshot::Receiver<TurnResult>) {
        let (sink, receiver) = ResultSink::channel();
        (
            Arc::new(PendingRequest {
                request_id,
                payload,
                probe,
                sink,
                enqueued_at: Utc::now(),
                cancelled: AtomicBool::new(false),
            }),
            receiver,
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Marks the record cancelled. Returns `true` only for the call that
    /// made the transition.
    pub fn set_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .field("streaming", &self.payload.streaming)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Observability view of one queued record.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub request_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub wait_seconds: f64,
    pub streaming: bool,
    pub cancelled: bool,
}

/// Unbounded FIFO queue of pending requests.
///
/// Records are only ever removed by the worker's `dequeue`; maintenance,
/// cancellation and status all inspect the queue in place, so FIFO order is
/// never disturbed by them.
pub struct AdmissionQueue {
    items: Mutex<VecDeque<Arc<PendingRequest>>>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        AdmissionQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Admits a record. Never blocks, never rejects.
    pub fn enqueue(&self, record: Arc<PendingRequest>) {
        self.items
            .lock()
            .expect("admission queue mutex poisoned")
            .push_back(record);
        self.notify.notify_one();
    }

    /// Removes and returns the oldest record, waiting up to `timeout` for
    /// one to arrive. `None` on timeout is expected, not an error.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Arc<PendingRequest>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(record) = self
                .items
                .lock()
                .expect("admission queue mutex poisoned")
                .pop_front()
            {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Clones handles to up to `limit` of the oldest queued records,
    /// de-duplicated by request id, without removing anything.
    pub fn scan_oldest(&self, limit: usize) -> Vec<Arc<PendingRequest>> {
        let items = self.items.lock().expect("admission queue mutex poisoned");
        let mut seen = HashSet::new();
        items
            .iter()
            .filter(|record| seen.insert(record.request_id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Cancels a queued record by id, resolving its sink immediately.
    /// Returns `true` only when this call made the cancelling transition.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let record = self
            .items
            .lock()
            .expect("admission queue mutex poisoned")
            .iter()
            .find(|record| record.request_id == request_id)
            .cloned();
        match record {
            Some(record) if record.set_cancelled() => {
                record.sink.resolve(Err(RequestError::Cancelled));
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedItem> {
        let now = Utc::now();
        self.items
            .lock()
            .expect("admission queue mutex poisoned")
            .iter()
            .map(|record| QueuedItem {
                request_id: record.request_id,
                enqueued_at: record.enqueued_at,
                wait_seconds: (now - record.enqueued_at).num_milliseconds() as f64 / 1000.0,
                streaming: record.payload.streaming,
                cancelled: record.is_cancelled(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .expect("admission queue mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outcome::{Completion, CompletionPayload, UsageStats};
    use async_trait::async_trait;

    struct AlwaysConnected;

    #[async_trait]
    impl LivenessProbe for AlwaysConnected {
        async fn is_connected(&self) -> bool {
            true
        }
    }

    fn request(streaming: bool) -> NormalizedRequest {
        NormalizedRequest {
            streaming,
            prompt: "User:\nhello".to_string(),
            model: None,
            params: GenerationParams::default(),
        }
    }

    fn completion() -> CompletionPayload {
        CompletionPayload::Full(Completion {
            model: "echo".to_string(),
            content: "hi".to_string(),
            reasoning: None,
            usage: UsageStats::default(),
        })
    }

    #[test]
    fn sink_resolves_exactly_once() {
        let (sink, mut rx) = ResultSink::channel();
        assert!(!sink.is_resolved());

        assert!(sink.resolve(Ok(completion())));
        assert!(sink.is_resolved());
        assert!(!sink.resolve(Err(RequestError::Cancelled)));

        let delivered = rx.try_recv().expect("first resolution should arrive");
        assert!(delivered.is_ok());
    }

    #[test]
    fn sink_counts_as_resolved_when_caller_is_gone() {
        let (sink, rx) = ResultSink::channel();
        drop(rx);

        assert!(sink.resolve(Err(RequestError::ClientDisconnected)));
        assert!(sink.is_resolved());
    }

    #[test]
    fn cancel_transition_happens_once() {
        let (record, _rx) =
            PendingRequest::new(Uuid::new_v4(), request(false), Arc::new(AlwaysConnected));

        assert!(!record.is_cancelled());
        assert!(record.set_cancelled());
        assert!(record.is_cancelled());
        assert!(!record.set_cancelled());
    }

    #[test]
    fn scan_is_bounded_and_deduplicated() {
        let queue = AdmissionQueue::new();
        let (record, _rx) =
            PendingRequest::new(Uuid::new_v4(), request(false), Arc::new(AlwaysConnected));
        for _ in 0..3 {
            queue.enqueue(record.clone());
        }
        for _ in 0..12 {
            let (other, _rx) =
                PendingRequest::new(Uuid::new_v4(), request(false), Arc::new(AlwaysConnected));
            queue.enqueue(other);
        }

        let scanned = queue.scan_oldest(10);
        assert_eq!(scanned.len(), 10);
        assert_eq!(scanned[0].request_id, record.request_id);
        assert!(
            scanned[1..]
                .iter()
                .all(|r| r.request_id != record.request_id)
        );
        // Inspection only: nothing was removed.
        assert_eq!(queue.len(), 15);
    }
}
