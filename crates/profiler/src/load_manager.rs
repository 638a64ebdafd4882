//! Client-side load generator (spec section 4.4)
//!
//! Grounded on `examples/original_source/.../concurrency_manager.cc`'s
//! `ConcurrencyManager`: a worker pool that is told a target concurrency
//! level and distributes it across workers as evenly as possible, never
//! shrinking the pool, with sequence models pinned to one context (and so
//! one in-flight request) per worker and non-sequence models parallelizing
//! via concurrent asynchronous requests within a single shared context.

use crate::client::TargetClient;
use crate::stats::RequestTiming;
use multiserve_common::metrics::METRICS;
use multiserve_common::{Error, Result};
use multiserve_proto::RequestPayload;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Per-worker state: its target concurrency, accumulated timestamps, and
/// whether it has recorded a failure (spec section 4.4, "Health").
struct WorkerState {
    target_concurrency: AtomicUsize,
    timestamps: Mutex<Vec<RequestTiming>>,
    failed: AtomicBool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            target_concurrency: AtomicUsize::new(0),
            timestamps: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        }
    }
}

/// Drives a target server at a chosen concurrency level.
///
/// Rate-mode scheduling (Poisson / uniform inter-arrival, spec section 4.4)
/// is layered on top of the same worker pool by a caller that pre-schedules
/// send times and counts late sends as `delayed_request_count`; this type
/// provides the concurrency-mode primitive directly and exposes
/// `record_delayed` for a rate-mode caller to report misses.
pub struct LoadManager {
    client: Arc<dyn TargetClient>,
    request_template: RequestPayload,
    max_threads: usize,
    on_sequence_model: bool,
    workers: Mutex<Vec<Arc<WorkerState>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    notify: Arc<Notify>,
    early_exit: Arc<AtomicBool>,
    inflight: Arc<AtomicUsize>,
    delayed_requests: AtomicU64,
    next_correlation_id: AtomicU64,
}

impl LoadManager {
    pub fn new(
        client: Arc<dyn TargetClient>,
        request_template: RequestPayload,
        max_threads: usize,
        on_sequence_model: bool,
    ) -> Self {
        Self {
            client,
            request_template,
            max_threads: max_threads.max(1),
            on_sequence_model,
            workers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            notify: Arc::new(Notify::new()),
            early_exit: Arc::new(AtomicBool::new(false)),
            inflight: Arc::new(AtomicUsize::new(0)),
            delayed_requests: AtomicU64::new(0),
            next_correlation_id: AtomicU64::new(1),
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Spawns one more worker task, up to `max_threads`. Returns `false` if
    /// the pool is already at capacity.
    fn spawn_worker(&self) -> bool {
        let mut workers = self.workers.lock();
        if workers.len() >= self.max_threads {
            return false;
        }
        let state = Arc::new(WorkerState::new());
        workers.push(state.clone());
        let worker_id = workers.len() - 1;
        drop(workers);

        let client = self.client.clone();
        let template = self.request_template.clone();
        let notify = self.notify.clone();
        let early_exit = self.early_exit.clone();
        let inflight = self.inflight.clone();
        let sequence = self.on_sequence_model;
        let correlation_counter = Arc::new(AtomicU64::new(
            self.next_correlation_id.fetch_add(1, Ordering::Relaxed),
        ));

        let handle = tokio::spawn(async move {
            worker_loop(
                worker_id,
                state,
                client,
                template,
                notify,
                early_exit,
                inflight,
                sequence,
                correlation_counter,
            )
            .await;
        });
        self.handles.lock().push(handle);
        true
    }

    /// Distributes `concurrent_request_count` across workers as
    /// `floor(C/W)` with the first `C mod W` workers taking one extra,
    /// spawning new workers up to `max_threads` if `C > W`. Never shrinks
    /// the worker count (spec section 4.4).
    pub fn change_concurrency_level(&self, concurrent_request_count: usize) -> Result<()> {
        if self.on_sequence_model {
            // One context per concurrent sequence: spawn up to the
            // requested level (capped by max_threads) so each worker owns
            // at most one sequence at a time.
            while self.worker_count() < concurrent_request_count.min(self.max_threads) {
                if !self.spawn_worker() {
                    break;
                }
            }
        } else {
            while concurrent_request_count > self.worker_count() && self.worker_count() < self.max_threads {
                if !self.spawn_worker() {
                    break;
                }
            }
        }

        let workers = self.workers.lock();
        if workers.is_empty() {
            if concurrent_request_count == 0 {
                return Ok(());
            }
            return Err(Error::internal("load manager has no workers to assign concurrency to"));
        }

        let w = workers.len();
        let avg = concurrent_request_count / w;
        let remainder = concurrent_request_count % w;
        for (i, worker) in workers.iter().enumerate() {
            let target = if self.on_sequence_model {
                if i < concurrent_request_count { 1 } else { 0 }
            } else {
                avg + if i < remainder { 1 } else { 0 }
            };
            worker.target_concurrency.store(target, Ordering::Relaxed);
        }
        drop(workers);

        self.notify.notify_waiters();
        debug!(concurrency = concurrent_request_count, workers = w, "concurrency level updated");
        Ok(())
    }

    /// Atomically drains every worker's accumulated timestamps. A second
    /// immediate call returns empty (spec section 8, "Laws").
    pub fn swap_timestamps(&self) -> Vec<RequestTiming> {
        let workers = self.workers.lock();
        let mut drained = Vec::new();
        for worker in workers.iter() {
            let mut timestamps = worker.timestamps.lock();
            drained.append(&mut *timestamps);
        }
        drained
    }

    /// Requests that missed their scheduled send time since the last call
    /// (rate-mode bookkeeping), drained alongside timestamps.
    pub fn swap_delayed_count(&self) -> u64 {
        self.delayed_requests.swap(0, Ordering::Relaxed)
    }

    pub fn record_delayed(&self) {
        self.delayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns an error if any worker has recorded a failure status.
    pub fn check_health(&self) -> Result<()> {
        let workers = self.workers.lock();
        if workers.iter().any(|w| w.failed.load(Ordering::Relaxed)) {
            return Err(Error::internal(
                "one or more load manager workers failed to maintain the requested concurrency",
            ));
        }
        Ok(())
    }

    /// Signals `early_exit`, waits for in-flight requests to drain with a
    /// 500ms poll loop (spec section 5, "Cancellation / timeouts"), then
    /// joins every worker task.
    pub async fn shutdown(&self) {
        self.early_exit.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        while self.inflight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    state: Arc<WorkerState>,
    client: Arc<dyn TargetClient>,
    template: RequestPayload,
    notify: Arc<Notify>,
    early_exit: Arc<AtomicBool>,
    inflight: Arc<AtomicUsize>,
    on_sequence_model: bool,
    correlation_counter: Arc<AtomicU64>,
) {
    loop {
        if early_exit.load(Ordering::SeqCst) {
            break;
        }

        let target = state.target_concurrency.load(Ordering::Relaxed);
        if target == 0 {
            notify.notified().await;
            continue;
        }

        if on_sequence_model {
            run_sequence_round(&state, &client, &template, &inflight, &correlation_counter).await;
        } else {
            run_async_round(&state, &client, &template, target, &inflight).await;
        }
    }
    debug!(worker_id, "load manager worker exiting");
}

/// Non-sequence mode: fires `target` concurrent requests through
/// `spawn_blocking` tasks (the client call is synchronous from its
/// perspective) and waits for all of them, recording each completion.
async fn run_async_round(
    state: &Arc<WorkerState>,
    client: &Arc<dyn TargetClient>,
    template: &RequestPayload,
    target: usize,
    inflight: &Arc<AtomicUsize>,
) {
    let mut tasks = Vec::with_capacity(target);
    for _ in 0..target {
        let client = client.clone();
        let request = template.clone();
        let inflight = inflight.clone();
        inflight.fetch_add(1, Ordering::SeqCst);
        tasks.push(tokio::task::spawn_blocking(move || {
            let send_start = Instant::now();
            let send_end = send_start;
            let result = client.infer(&request);
            let recv_end = Instant::now();
            inflight.fetch_sub(1, Ordering::SeqCst);
            result.map(|_| RequestTiming {
                send_start,
                send_end,
                recv_start: recv_end,
                recv_end,
                sequence_start: request.sequence_start,
                sequence_end: request.sequence_end,
            })
        }));
    }

    let mut timestamps = Vec::with_capacity(tasks.len());
    let mut saw_failure = false;
    for task in tasks {
        match task.await {
            Ok(Ok(timing)) => {
                METRICS.profiler.client_latency.observe(timing.total_latency().as_secs_f64());
                timestamps.push(timing);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "inference request failed");
                saw_failure = true;
            }
            Err(e) => {
                warn!(error = %e, "worker task panicked");
                saw_failure = true;
            }
        }
    }

    if saw_failure {
        state.failed.store(true, Ordering::Relaxed);
    }
    state.timestamps.lock().extend(timestamps);
}

/// Sequence mode: exactly one request in flight at a time on this worker's
/// context, cycling through one full sequence (start -> ... -> end) before
/// moving to the next correlation ID.
async fn run_sequence_round(
    state: &Arc<WorkerState>,
    client: &Arc<dyn TargetClient>,
    template: &RequestPayload,
    inflight: &Arc<AtomicUsize>,
    correlation_counter: &Arc<AtomicU64>,
) {
    let correlation_id = correlation_counter.fetch_add(1, Ordering::Relaxed);
    let mut request = template.clone();
    request.correlation_id = Some(correlation_id);
    request.sequence_start = true;
    request.sequence_end = true;

    let client = client.clone();
    let req = request.clone();
    inflight.fetch_add(1, Ordering::SeqCst);
    let result = tokio::task::spawn_blocking(move || {
        let send_start = Instant::now();
        let outcome = client.infer(&req);
        let recv_end = Instant::now();
        outcome.map(|_| RequestTiming {
            send_start,
            send_end: send_start,
            recv_start: recv_end,
            recv_end,
            sequence_start: req.sequence_start,
            sequence_end: req.sequence_end,
        })
    })
    .await;
    inflight.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(Ok(timing)) => {
            METRICS.profiler.client_latency.observe(timing.total_latency().as_secs_f64());
            state.timestamps.lock().push(timing);
        }
        Ok(Err(e)) => {
            warn!(error = %e, correlation_id, "sequence request failed");
            state.failed.store(true, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(error = %e, "sequence worker task panicked");
            state.failed.store(true, Ordering::Relaxed);
        }
    }
}
