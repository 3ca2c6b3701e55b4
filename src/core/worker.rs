//! The queue worker: drains admissions against the backend, one turn at a
//! time.
//!
//! A single long-lived task owns this loop. Producers only ever enqueue and
//! then block on their own result sink, so the queue and the turn gate are
//! the only points of contention in the process.

use crate::config::Settings;
use crate::core::outcome::{RequestError, TurnOutcome};
use crate::core::queue::PendingRequest;
use crate::core::scheduler::SchedulerContext;
use crate::core::traits::{ExecutionBackend, StreamCache};
use futures_util::FutureExt;
use log::{debug, error, info};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Runs until the context's shutdown token fires. Every dequeued record has
/// its sink resolved exactly once on every path out of an iteration.
pub async fn run(
    ctx: Arc<SchedulerContext>,
    backend: Arc<dyn ExecutionBackend>,
    cache: Arc<dyn StreamCache>,
) {
    info!("queue worker started");
    let mut pacing = Pacing::default();

    loop {
        maintain(&ctx).await;

        let record = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            dequeued = ctx.queue.dequeue(ctx.settings.queue_poll_timeout) => match dequeued {
                Some(record) => record,
                // Timeout: loop back so maintenance keeps running even with
                // no arrivals.
                None => continue,
            },
        };

        let request_id = record.request_id;
        if record.is_cancelled() {
            info!("[{request_id}] request was cancelled while queued, skipping");
            record.sink.resolve(Err(RequestError::Cancelled));
            continue;
        }

        let streaming = record.payload.streaming;
        info!(
            "[{request_id}] dequeued ({} request)",
            if streaming { "streaming" } else { "non-streaming" }
        );

        if let Some(delay) = pacing.required_delay(streaming, Instant::now(), &ctx.settings) {
            info!(
                "[{request_id}] consecutive streaming requests, delaying {:.2}s",
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }

        if !record.probe.is_connected().await {
            info!("[{request_id}] client disconnected while waiting for the turn gate");
            record.set_cancelled();
            record.sink.resolve(Err(RequestError::ClientDisconnected));
            continue;
        }

        debug!("[{request_id}] waiting for the turn gate");
        let stopping = {
            let _turn = ctx.turn_gate.lock().await;
            debug!("[{request_id}] turn gate acquired");

            if !record.probe.is_connected().await {
                info!("[{request_id}] client disconnected after acquiring the turn gate");
                record.set_cancelled();
                record.sink.resolve(Err(RequestError::ClientDisconnected));
                false
            } else if record.sink.is_resolved() {
                info!("[{request_id}] result already resolved before execution, skipping");
                false
            } else {
                execute_turn(&ctx, backend.as_ref(), &record).await
            }
            // Gate guard drops here on every path.
        };
        if stopping {
            break;
        }

        match cache.clear().await {
            Ok(0) => {}
            Ok(dropped) => info!("[{request_id}] dropped {dropped} stale stream fragments"),
            Err(err) => error!("[{request_id}] failed to clear the stream cache: {err:#}"),
        }

        pacing.record(streaming, Instant::now());
    }

    info!("queue worker stopped");
}

/// Scans the oldest queued records and cancels the ones whose client is
/// gone, so a disconnected caller never waits behind a long queue.
async fn maintain(ctx: &SchedulerContext) {
    for record in ctx.queue.scan_oldest(ctx.settings.maintenance_scan_limit) {
        if record.is_cancelled() {
            continue;
        }
        if !record.probe.is_connected().await && record.set_cancelled() {
            info!(
                "[{}] client disconnected while queued, cancelling",
                record.request_id
            );
            record.sink.resolve(Err(RequestError::ClientDisconnected));
        }
    }
}

/// Invokes the backend under the already-held gate and interprets the
/// outcome. Returns `true` when shutdown interrupted the turn and the loop
/// must stop.
async fn execute_turn(
    ctx: &SchedulerContext,
    backend: &dyn ExecutionBackend,
    record: &PendingRequest,
) -> bool {
    let request_id = record.request_id;
    let call = AssertUnwindSafe(backend.execute(
        request_id,
        &record.payload,
        record.probe.clone(),
        &record.sink,
    ))
    .catch_unwind();

    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            info!("[{request_id}] shutdown requested during the turn, cancelling");
            record.sink.resolve(Err(RequestError::Cancelled));
            return true;
        }
        outcome = call => outcome,
    };

    match outcome {
        Ok(Ok(TurnOutcome::Completed)) => {
            // The backend must have resolved the sink itself; if it did
            // not, the caller would wait forever.
            let unresolved = record.sink.resolve(Err(RequestError::Internal(
                "backend reported completion without a result".to_string(),
            )));
            if unresolved {
                error!("[{request_id}] backend reported completion without resolving the result");
            } else {
                debug!("[{request_id}] turn completed");
            }
        }
        Ok(Ok(TurnOutcome::StreamingStarted(_turn))) => {
            // The streaming delivery owns the sink from here.
            debug!("[{request_id}] streaming delivery in flight");
        }
        Ok(Err(err)) => {
            error!("[{request_id}] backend turn failed: {err:#}");
            record
                .sink
                .resolve(Err(RequestError::Backend(err.to_string())));
        }
        Err(_panic) => {
            error!("[{request_id}] backend panicked during the turn");
            record.sink.resolve(Err(RequestError::Internal(
                "backend panicked during the turn".to_string(),
            )));
        }
    }
    false
}

/// Spacing state for consecutive streaming turns. Private to the worker
/// task; never shared.
#[derive(Default)]
struct Pacing {
    was_last_streaming: bool,
    last_completion: Option<Instant>,
}

impl Pacing {
    /// Delay to insert before starting `streaming` work at `now`, if the
    /// previous completed turn was a streaming one that finished less than
    /// the configured gap ago.
    fn required_delay(&self, streaming: bool, now: Instant, settings: &Settings) -> Option<Duration> {
        if !(self.was_last_streaming && streaming) {
            return None;
        }
        let elapsed = now.duration_since(self.last_completion?);
        if elapsed >= settings.stream_gap {
            return None;
        }
        Some((settings.stream_gap - elapsed).max(settings.stream_gap_floor))
    }

    fn record(&mut self, streaming: bool, completed_at: Instant) {
        self.was_last_streaming = streaming;
        self.last_completion = Some(completed_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn no_delay_without_a_previous_turn() {
        let pacing = Pacing::default();
        assert_eq!(
            pacing.required_delay(true, Instant::now(), &settings()),
            None
        );
    }

    #[test]
    fn no_delay_after_a_non_streaming_turn() {
        let mut pacing = Pacing::default();
        let base = Instant::now();
        pacing.record(false, base);
        assert_eq!(pacing.required_delay(true, base, &settings()), None);
    }

    #[test]
    fn no_delay_for_a_non_streaming_follow_up() {
        let mut pacing = Pacing::default();
        let base = Instant::now();
        pacing.record(true, base);
        assert_eq!(pacing.required_delay(false, base, &settings()), None);
    }

    #[test]
    fn full_gap_when_turns_are_back_to_back() {
        let mut pacing = Pacing::default();
        let base = Instant::now();
        pacing.record(true, base);
        assert_eq!(
            pacing.required_delay(true, base, &settings()),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn remaining_gap_is_clamped_to_the_floor() {
        let mut pacing = Pacing::default();
        let base = Instant::now();
        pacing.record(true, base);
        // 700 ms already elapsed: the remaining 300 ms is below the floor.
        assert_eq!(
            pacing.required_delay(true, base + Duration::from_millis(700), &settings()),
            Some(Duration::from_millis(500))
        );
        // 200 ms elapsed: the remaining 800 ms is above the floor.
        assert_eq!(
            pacing.required_delay(true, base + Duration::from_millis(200), &settings()),
            Some(Duration::from_millis(800))
        );
    }

    #[test]
    fn no_delay_once_the_gap_has_passed() {
        let mut pacing = Pacing::default();
        let base = Instant::now();
        pacing.record(true, base);
        assert_eq!(
            pacing.required_delay(true, base + Duration::from_millis(1200), &settings()),
            None
        );
    }
}
