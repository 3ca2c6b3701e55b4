//! Integration tests for the admission queue worker.
//!
//! The backend is an instrumented stub: it records call order, asserts
//! non-reentrancy, and can be scripted to succeed, fail, stream, stall or
//! panic per call.

use async_trait::async_trait;
use session_llm_gateway::config::Settings;
use session_llm_gateway::core::outcome::{
    Completion, CompletionPayload, RequestError, StreamEvent, StreamingTurn, TurnOutcome,
    UsageStats,
};
use session_llm_gateway::core::queue::{GenerationParams, NormalizedRequest, ResultSink};
use session_llm_gateway::core::scheduler::SchedulerContext;
use session_llm_gateway::core::traits::{ExecutionBackend, LivenessProbe, StreamCache};
use session_llm_gateway::core::worker;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

// =============================================================================
// Test doubles
// =============================================================================

struct TestProbe {
    connected: AtomicBool,
}

impl TestProbe {
    fn connected() -> Arc<TestProbe> {
        Arc::new(TestProbe {
            connected: AtomicBool::new(true),
        })
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for TestProbe {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Succeed,
    Slow(Duration),
    Fail,
    Panic,
    Stream,
}

#[derive(Default)]
struct StubBackend {
    /// Scripted behaviors, popped per call; `Succeed` once exhausted.
    modes: Mutex<VecDeque<Mode>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    overlapped: AtomicBool,
    started: Mutex<Vec<(Uuid, Instant)>>,
    finished: Mutex<Vec<(Uuid, Instant)>>,
}

impl StubBackend {
    fn scripted(modes: impl IntoIterator<Item = Mode>) -> Arc<StubBackend> {
        let backend = StubBackend::default();
        backend.modes.lock().unwrap().extend(modes);
        Arc::new(backend)
    }

    fn started_ids(&self) -> Vec<Uuid> {
        self.started.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    fn full(content: &str) -> CompletionPayload {
        CompletionPayload::Full(Completion {
            model: "stub".to_string(),
            content: content.to_string(),
            reasoning: None,
            usage: UsageStats::default(),
        })
    }
}

#[async_trait]
impl ExecutionBackend for StubBackend {
    async fn execute(
        &self,
        request_id: Uuid,
        _payload: &NormalizedRequest,
        _probe: Arc<dyn LivenessProbe>,
        sink: &ResultSink,
    ) -> anyhow::Result<TurnOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.started
            .lock()
            .unwrap()
            .push((request_id, Instant::now()));

        let mode = self
            .modes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Mode::Succeed);
        let result = match mode {
            Mode::Succeed => {
                sink.resolve(Ok(StubBackend::full("done")));
                Ok(TurnOutcome::Completed)
            }
            Mode::Slow(pause) => {
                tokio::time::sleep(pause).await;
                sink.resolve(Ok(StubBackend::full("done")));
                Ok(TurnOutcome::Completed)
            }
            Mode::Fail => Err(anyhow::anyhow!("session exploded")),
            Mode::Panic => panic!("backend blew up"),
            Mode::Stream => {
                let (event_tx, event_rx) = mpsc::channel(8);
                let (done_tx, done_rx) = oneshot::channel();
                let sink = sink.clone();
                tokio::spawn(async move {
                    sink.resolve(Ok(CompletionPayload::Streaming(event_rx)));
                    let _ = event_tx.send(StreamEvent::Delta("chunk ".to_string())).await;
                    let _ = event_tx.send(StreamEvent::Done(UsageStats::default())).await;
                    let _ = done_tx.send(());
                });
                Ok(TurnOutcome::StreamingStarted(StreamingTurn {
                    completion: done_rx,
                }))
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .unwrap()
            .push((request_id, Instant::now()));
        result
    }
}

#[derive(Default)]
struct CountingCache {
    clears: AtomicUsize,
}

#[async_trait]
impl StreamCache for CountingCache {
    async fn clear(&self) -> anyhow::Result<usize> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(0)
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

struct Harness {
    ctx: Arc<SchedulerContext>,
    backend: Arc<StubBackend>,
    cache: Arc<CountingCache>,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(backend: Arc<StubBackend>) -> Harness {
        let ctx = SchedulerContext::new(Settings::default());
        let cache = Arc::new(CountingCache::default());
        let worker = tokio::spawn(worker::run(ctx.clone(), backend.clone(), cache.clone()));
        Harness {
            ctx,
            backend,
            cache,
            worker,
        }
    }

    async fn stop(self) {
        self.ctx.shutdown.cancel();
        self.worker.await.expect("worker task join");
    }

    async fn wait_for_started(&self, count: usize) {
        while self.backend.started.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_a_full_completion_reaches_the_caller() {
    let harness = Harness::start(StubBackend::scripted([Mode::Succeed]));

    let receiver = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());
    let result = receiver.await.expect("sink resolves");
    match result {
        Ok(CompletionPayload::Full(completion)) => assert_eq!(completion.content, "done"),
        other => panic!("expected a full completion, got {other:?}"),
    }

    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.ctx.queue.len(), 0);

    let cache = harness.cache.clone();
    harness.stop().await;
    assert_eq!(cache.clears.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_disconnect_while_queued_skips_the_backend() {
    let backend = StubBackend::scripted([]);
    let ctx = SchedulerContext::new(Settings::default());
    let cache = Arc::new(CountingCache::default());

    let probe = TestProbe::connected();
    let receiver = ctx.enqueue(Uuid::new_v4(), request(false), probe.clone());
    probe.disconnect();

    // Worker starts only now, so the first maintenance pass sees the dead
    // client before the record is ever dequeued for execution.
    let worker = tokio::spawn(worker::run(ctx.clone(), backend.clone(), cache.clone()));

    let result = receiver.await.expect("sink resolves");
    assert!(matches!(result, Err(RequestError::ClientDisconnected)));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

    ctx.shutdown.cancel();
    worker.await.expect("worker task join");
}

#[tokio::test(start_paused = true)]
async fn scenario_c_consecutive_streaming_turns_are_paced_apart() {
    let harness = Harness::start(StubBackend::scripted([Mode::Stream, Mode::Stream]));

    let first = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(true), TestProbe::connected());
    let second = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(true), TestProbe::connected());

    let first = first.await.expect("sink resolves").expect("first turn succeeds");
    assert!(matches!(first, CompletionPayload::Streaming(_)));
    let second = second
        .await
        .expect("sink resolves")
        .expect("second turn succeeds");
    assert!(matches!(second, CompletionPayload::Streaming(_)));

    harness.wait_for_started(2).await;
    let first_finished = harness.backend.finished.lock().unwrap()[0].1;
    let second_started = harness.backend.started.lock().unwrap()[1].1;
    assert!(
        second_started.duration_since(first_finished) >= Duration::from_millis(500),
        "second streaming turn started {:?} after the first finished",
        second_started.duration_since(first_finished)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_d_backend_error_resolves_the_caller_and_the_loop_survives() {
    let harness = Harness::start(StubBackend::scripted([Mode::Fail, Mode::Succeed]));

    let failing = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());
    let healthy = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());

    match failing.await.expect("sink resolves") {
        Err(RequestError::Backend(message)) => assert!(message.contains("session exploded")),
        other => panic!("expected a backend failure, got {other:?}"),
    }
    assert!(healthy.await.expect("sink resolves").is_ok());
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn a_panicking_backend_is_contained() {
    let harness = Harness::start(StubBackend::scripted([Mode::Panic, Mode::Succeed]));

    let poisoned = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());
    let healthy = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());

    assert!(matches!(
        poisoned.await.expect("sink resolves"),
        Err(RequestError::Internal(_))
    ));
    assert!(healthy.await.expect("sink resolves").is_ok());

    harness.stop().await;
}

// =============================================================================
// Ordering and exclusion properties
// =============================================================================

#[tokio::test(start_paused = true)]
async fn execution_order_matches_enqueue_order() {
    let harness = Harness::start(StubBackend::scripted([]));

    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    let receivers: Vec<_> = ids
        .iter()
        .map(|id| harness.ctx.enqueue(*id, request(false), TestProbe::connected()))
        .collect();
    for receiver in receivers {
        assert!(receiver.await.expect("sink resolves").is_ok());
    }

    assert_eq!(harness.backend.started_ids(), ids);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backend_turns_never_overlap() {
    let backend = StubBackend::scripted(
        std::iter::repeat(Mode::Slow(Duration::from_millis(100))).take(4),
    );
    let harness = Harness::start(backend);

    let receivers: Vec<_> = (0..4)
        .map(|_| {
            harness
                .ctx
                .enqueue(Uuid::new_v4(), request(false), TestProbe::connected())
        })
        .collect();
    for receiver in receivers {
        assert!(receiver.await.expect("sink resolves").is_ok());
    }

    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 4);
    assert!(!harness.backend.overlapped.load(Ordering::SeqCst));
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_records_never_reach_the_backend() {
    let backend = StubBackend::scripted([]);
    let ctx = SchedulerContext::new(Settings::default());
    let cache = Arc::new(CountingCache::default());

    let request_id = Uuid::new_v4();
    let receiver = ctx.enqueue(request_id, request(false), TestProbe::connected());
    assert!(ctx.cancel(request_id));
    assert!(!ctx.cancel(request_id), "second cancel is not a transition");

    let worker = tokio::spawn(worker::run(ctx.clone(), backend.clone(), cache.clone()));

    assert!(matches!(
        receiver.await.expect("sink resolves"),
        Err(RequestError::Cancelled)
    ));
    while ctx.queue.len() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    // The cancelled record skipped the gate, so no cache clear happened.
    assert_eq!(cache.clears.load(Ordering::SeqCst), 0);

    ctx.shutdown.cancel();
    worker.await.expect("worker task join");
}

#[tokio::test(start_paused = true)]
async fn shutdown_resolves_the_in_flight_record() {
    let backend = StubBackend::scripted([Mode::Slow(Duration::from_secs(600))]);
    let harness = Harness::start(backend);

    let receiver = harness
        .ctx
        .enqueue(Uuid::new_v4(), request(false), TestProbe::connected());
    harness.wait_for_started(1).await;

    harness.ctx.shutdown.cancel();
    assert!(matches!(
        receiver.await.expect("sink resolves"),
        Err(RequestError::Cancelled)
    ));
    harness.worker.await.expect("worker task join");
}

// =============================================================================
// Exactly-once resolution under randomized interleavings
// =============================================================================

fn xorshift(seed: &mut u64) -> u64 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 7;
    *seed ^= *seed << 17;
    *seed
}

#[tokio::test(start_paused = true)]
async fn every_record_resolves_exactly_once_under_mixed_outcomes() {
    let mut seed = 0x9E37_79B9_7F4A_7C15u64;

    for _round in 0..8 {
        let modes: Vec<Mode> = (0..12)
            .map(|_| match xorshift(&mut seed) % 3 {
                0 => Mode::Succeed,
                1 => Mode::Fail,
                _ => Mode::Stream,
            })
            .collect();
        let backend = StubBackend::scripted(modes);
        let ctx = SchedulerContext::new(Settings::default());
        let cache = Arc::new(CountingCache::default());

        let mut receivers = Vec::new();
        for _ in 0..12 {
            let request_id = Uuid::new_v4();
            let probe = TestProbe::connected();
            let streaming = xorshift(&mut seed) % 2 == 0;
            let receiver = ctx.enqueue(request_id, request(streaming), probe.clone());
            match xorshift(&mut seed) % 4 {
                0 => probe.disconnect(),
                1 => {
                    ctx.cancel(request_id);
                }
                _ => {}
            }
            receivers.push(receiver);
        }

        let worker = tokio::spawn(worker::run(ctx.clone(), backend, cache));

        for receiver in receivers {
            // Resolved exactly once: the oneshot yields a value instead of
            // a channel-closed error, whatever the outcome was.
            assert!(receiver.await.is_ok(), "a record was dropped unresolved");
        }

        ctx.shutdown.cancel();
        worker.await.expect("worker task join");
    }
}
