//! Model scheduler: per-model dispatch loop (spec section 4.1)
//!
//! Grounded on `batching.rs`'s `BatchScheduler`: an atomic depth counter plus
//! a `tokio::sync::Notify` wake signal, generalized from "collect until a
//! window elapses" into the full preferred-batch-size / max-queue-delay /
//! instance-claim coordinator the dynamic batcher needs. One
//! `ModelScheduler` owns one model; it is the sole mutator of its queue and
//! its instance pool, matching the single-coordinator discipline.
//!
//! Unlike `batching.rs`'s lock-free `SegQueue`, the queue here is a
//! `Mutex<VecDeque<_>>`: `dispatch_once` needs to inspect more than the head
//! (to partition stateful requests by target instance) before deciding how
//! much to pop, and only ever removes the exact items it dispatches. That
//! keeps it a one-at-a-time pop under the same lock `enqueue` pushes under,
//! same as `batching.rs`'s `next_batch`/`submit` pair, so a request that is
//! inspected-but-not-dispatched is never displaced behind one enqueued after
//! it.

use crate::instance::{no_instances_available_error, BackendInstance, InstancePool, InstanceState};
use crate::sequence::SequenceRouter;
use multiserve_common::metrics::METRICS;
use multiserve_common::{Error, Result};
use multiserve_proto::{ModelConfig, RequestPayload, ResponsePayload};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// One request sitting in a model's queue, with the means to deliver its
/// result back to whoever enqueued it.
struct QueuedRequest {
    payload: RequestPayload,
    enqueued_at: Instant,
    /// For sequence-stateful models: the instance this request's sequence
    /// is bound to. `None` for stateless models.
    instance_hint: Option<u64>,
    respond: oneshot::Sender<Result<ResponsePayload>>,
}

/// Chooses the dispatch batch size B per spec section 4.1 step 2.
///
/// `preferred` need not be pre-filtered to `max_batch_size`; this function
/// does that itself. Returns a value in `1..=max_batch_size.max(1)`, or `1`
/// when `max_batch_size == 0` (batching disabled).
///
/// The largest preferred size that fits within `queue_len` always wins,
/// whether or not the head of the queue has aged out: a queue of 5 against
/// preferred sizes `[4, 8]` dispatches a batch of 4 immediately, it does not
/// wait for 8 to accumulate or for the max-queue-delay timer. Aging the head
/// out only matters when *no* preferred size fits yet (the queue is shorter
/// than the smallest preferred size) - then the aged head forces a
/// non-preferred batch of whatever is queued rather than holding requests
/// indefinitely.
fn choose_batch_size(
    preferred: &[usize],
    max_batch_size: usize,
    queue_len: usize,
    head_aged_out: bool,
) -> usize {
    if max_batch_size == 0 {
        return 1;
    }

    let fitting: Vec<usize> = preferred
        .iter()
        .copied()
        .filter(|&p| p >= 1 && p <= max_batch_size)
        .collect();

    if let Some(&best) = fitting.iter().filter(|&&p| p <= queue_len).max() {
        return best;
    }

    if head_aged_out {
        return queue_len.clamp(1, max_batch_size);
    }

    1
}

/// Dispatches a single model's queue against its instance pool.
pub struct ModelScheduler {
    model_name: String,
    config: ModelConfig,
    queue: Mutex<VecDeque<QueuedRequest>>,
    queue_depth: AtomicUsize,
    queue_capacity: usize,
    notify: Notify,
    shutdown: AtomicBool,
    instances: Mutex<InstancePool>,
    sequence_router: Option<SequenceRouter>,
}

impl ModelScheduler {
    pub fn new(config: ModelConfig, instances: Vec<Arc<BackendInstance>>, queue_capacity: usize) -> Self {
        let sequence_router = config
            .sequence_batching
            .as_ref()
            .map(|sb| SequenceRouter::new(Duration::from_micros(sb.max_sequence_idle_microseconds)));

        Self {
            model_name: config.name.clone(),
            config,
            queue: Mutex::new(VecDeque::new()),
            queue_depth: AtomicUsize::new(0),
            queue_capacity,
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            instances: Mutex::new(InstancePool::new(instances)),
            sequence_router,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Enqueues one request. Returns a receiver the caller awaits for the
    /// eventual result. Rejects immediately on queue overflow, an oversized
    /// batch dimension, or (for stateful models) an unroutable sequence.
    pub fn enqueue(
        &self,
        payload: RequestPayload,
    ) -> Result<oneshot::Receiver<Result<ResponsePayload>>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::unavailable(format!(
                "model '{}' is shutting down",
                self.model_name
            )));
        }

        if self.queue_depth.load(Ordering::Relaxed) >= self.queue_capacity {
            METRICS.scheduler.requests_rejected.inc();
            return Err(Error::unavailable(format!(
                "queue full for model '{}'",
                self.model_name
            )));
        }

        for input in &payload.inputs {
            if let Some(&dim0) = input.1.shape.first() {
                if self.config.max_batch_size != 0 && dim0 as usize > self.config.max_batch_size {
                    METRICS.scheduler.requests_rejected.inc();
                    return Err(Error::invalid_argument(format!(
                        "input '{}' batch dimension {} exceeds max_batch_size {}",
                        input.0, dim0, self.config.max_batch_size
                    )));
                }
            }
        }

        let instance_hint = if let Some(router) = &self.sequence_router {
            let correlation_id = payload.correlation_id.ok_or_else(|| {
                Error::invalid_argument("stateful model requires a correlation_id")
            })?;
            let id = router.route(
                correlation_id,
                payload.sequence_start,
                payload.sequence_end,
                || self.assign_unbound_instance(router),
            )?;
            Some(id)
        } else {
            None
        };

        let (respond, receiver) = oneshot::channel();
        self.queue.lock().push_back(QueuedRequest {
            payload,
            enqueued_at: Instant::now(),
            instance_hint,
            respond,
        });
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        METRICS.scheduler.requests_total.inc();
        METRICS.scheduler.queue_depth.inc();
        self.notify.notify_one();

        Ok(receiver)
    }

    /// Picks an instance with no live sequence binding, evicting
    /// TTL-expired bindings first to free candidates (spec section 4.2).
    fn assign_unbound_instance(&self, router: &SequenceRouter) -> Result<u64> {
        router.evict_expired();
        let bound = router.bound_instance_ids();
        let instances = self.instances.lock();
        instances
            .non_fatal_ids()
            .into_iter()
            .find(|id| !bound.contains(id))
            .ok_or_else(|| no_instances_available_error(&self.model_name))
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Runs the dispatch loop until shutdown is requested and the queue has
    /// drained. Intended to be spawned once per model.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.dispatch_once() {
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) && self.queue_depth() == 0 {
                break;
            }

            let wait = self.config.max_queue_delay().max(Duration::from_millis(1));
            let _ = timeout(wait, self.notify.notified()).await;
        }
        debug!(model = %self.model_name, "dispatch loop exited");
    }

    /// One iteration of the dispatch loop. Returns `true` if a batch was
    /// dispatched (the caller should re-evaluate immediately, per step 5).
    ///
    /// Holds the queue lock only long enough to decide and pop the exact
    /// requests being dispatched; nothing is removed and reinserted, so a
    /// concurrent `enqueue` can only ever land after whatever this call
    /// inspected, never ahead of it.
    fn dispatch_once(self: &Arc<Self>) -> bool {
        let preferred = self.config.preferred_batch_sizes();
        let smallest_preferred = preferred.first().copied();
        let max_delay = self.config.max_queue_delay();

        let mut queue = self.queue.lock();

        let head_aged_out = match queue.front() {
            Some(head) => !max_delay.is_zero() && head.enqueued_at.elapsed() > max_delay,
            None => return false,
        };

        let target_hint = queue.front().and_then(|r| r.instance_hint);
        let candidate_count = if self.sequence_router.is_some() {
            queue.iter().filter(|r| r.instance_hint == target_hint).count()
        } else {
            queue.len()
        };

        let meets_len = smallest_preferred.map(|s| candidate_count >= s).unwrap_or(true);
        if !meets_len && !head_aged_out {
            return false;
        }

        let claimed = {
            let instances = self.instances.lock();
            match target_hint {
                Some(id) => instances.claim_specific(id),
                None => instances.claim_any_idle(),
            }
        };

        let instance = match claimed {
            Some(inst) => inst,
            None => return false,
        };

        let b = choose_batch_size(&preferred, instance.max_batch_size(), candidate_count, head_aged_out)
            .min(candidate_count);

        let mut dispatch = Vec::with_capacity(b);
        let mut scan_from = 0;
        while dispatch.len() < b {
            let pos = queue
                .iter()
                .skip(scan_from)
                .position(|r| r.instance_hint == target_hint)
                .expect("candidate_count undercounted a matching request");
            let real_pos = scan_from + pos;
            dispatch.push(
                queue
                    .remove(real_pos)
                    .expect("position was just found in the same queue"),
            );
            scan_from = real_pos;
        }
        drop(queue);

        trace!(
            model = %self.model_name,
            batch_size = dispatch.len(),
            instance = instance.id,
            "dispatching batch"
        );
        self.run_batch(instance, dispatch);
        true
    }

    /// Hands a claimed batch to its instance on a blocking task and returns
    /// immediately (spec section 5: backend instances run on their own
    /// executor threads, and the coordinator keeps dispatching to other idle
    /// instances while one is busy). The instance was already marked `Busy`
    /// by the claim in `dispatch_once`; this settles it back to `Idle` (or
    /// `Fatal`) and fans out responses once the backend call returns.
    fn run_batch(self: &Arc<Self>, instance: Arc<BackendInstance>, dispatch: Vec<QueuedRequest>) {
        self.queue_depth.fetch_sub(dispatch.len(), Ordering::Relaxed);
        METRICS.scheduler.queue_depth.sub(dispatch.len() as i64);
        METRICS.scheduler.batch_size.observe(dispatch.len() as f64);
        METRICS.scheduler.instances_busy.inc();

        let scheduler = Arc::clone(self);
        let model_name = self.model_name.clone();

        tokio::task::spawn_blocking(move || {
            let payloads: Vec<RequestPayload> = dispatch.iter().map(|r| r.payload.clone()).collect();

            let start = Instant::now();
            let result = instance.run(&payloads);
            METRICS
                .scheduler
                .backend_run_duration
                .observe(start.elapsed().as_secs_f64());
            METRICS.scheduler.instances_busy.dec();

            match result {
                Ok(responses) => {
                    for (req, response) in dispatch.into_iter().zip(responses.into_iter()) {
                        let _ = req.respond.send(Ok(response));
                    }
                }
                Err(err) => {
                    METRICS.scheduler.requests_failed.inc_by(dispatch.len() as u64);
                    if instance.state() == InstanceState::Fatal {
                        METRICS.scheduler.instances_fatal.inc();
                        warn!(model = %model_name, instance = instance.id, "instance marked fatal");
                        scheduler.instances.lock().remove(instance.id);
                    }
                    let message = err.to_string();
                    for req in dispatch {
                        let _ = req.respond.send(Err(Error::internal(message.clone())));
                    }
                }
            }
            scheduler.notify.notify_one();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::MockBackend;
    use multiserve_proto::{DynamicBatchingConfig, SequenceBatchingConfig, TensorBytes};
    use std::collections::HashMap;

    fn base_config(max_batch_size: usize, preferred: Vec<usize>, delay_us: u64) -> ModelConfig {
        ModelConfig {
            name: "m".into(),
            platform: "mock".into(),
            max_batch_size,
            input: vec![],
            output: vec![],
            dynamic_batching: Some(DynamicBatchingConfig {
                preferred_batch_size: preferred,
                max_queue_delay_microseconds: delay_us,
            }),
            sequence_batching: None,
            instance_group: vec![],
            ensemble_scheduling: None,
        }
    }

    fn request(correlation_id: Option<u64>, start: bool, end: bool) -> RequestPayload {
        RequestPayload {
            model_name: "m".into(),
            model_version: 1,
            inputs: HashMap::new(),
            correlation_id,
            sequence_start: start,
            sequence_end: end,
        }
    }

    #[test]
    fn choose_batch_size_prefers_largest_fitting_when_queue_reaches_it() {
        assert_eq!(choose_batch_size(&[4, 8], 8, 8, false), 8);
        assert_eq!(choose_batch_size(&[4, 8], 8, 10, false), 8);
    }

    #[test]
    fn choose_batch_size_disables_batching_at_zero_max_batch() {
        assert_eq!(choose_batch_size(&[4, 8], 0, 10, true), 1);
    }

    #[test]
    fn choose_batch_size_on_aged_head_picks_largest_fitting_preferred() {
        // S1: preferred [4,8], queue_len 3, aged out -> no preferred <= 3 -> queue_len itself.
        assert_eq!(choose_batch_size(&[4, 8], 8, 3, true), 3);
        assert_eq!(choose_batch_size(&[4, 8], 8, 5, true), 4);
    }

    #[test]
    fn choose_batch_size_picks_largest_fitting_preferred_without_aging() {
        // S2: preferred [4,8], queue_len 5, head not aged out -> still picks 4,
        // not the full queue and not a wait for 8 to accumulate.
        assert_eq!(choose_batch_size(&[4, 8], 8, 5, false), 4);
    }

    #[tokio::test]
    async fn s1_three_requests_dispatch_as_one_batch_after_max_queue_delay() {
        let backend = MockBackend::new(8);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let config = base_config(8, vec![4, 8], 10_000);
        let scheduler = Arc::new(ModelScheduler::new(config, vec![instance], 16));

        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(scheduler.enqueue(request(None, true, true)).unwrap());
        }

        assert!(!scheduler.dispatch_once());
        tokio::time::sleep(Duration::from_millis(12)).await;
        assert!(scheduler.dispatch_once());

        for receiver in receivers {
            assert!(receiver.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn s2_five_requests_dispatch_preferred_four_immediately_leaving_one_queued() {
        let backend = MockBackend::new(8);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        // Long max_queue_delay: the first dispatch must happen because 4 of the
        // 5 queued requests meet the smallest preferred size, not because the
        // head aged out.
        let config = base_config(8, vec![4, 8], 10_000_000);
        let scheduler = Arc::new(ModelScheduler::new(config, vec![instance], 16));

        let mut receivers = Vec::new();
        for _ in 0..5 {
            receivers.push(scheduler.enqueue(request(None, true, true)).unwrap());
        }

        assert!(scheduler.dispatch_once());
        assert_eq!(scheduler.queue_depth(), 1);

        for receiver in receivers.drain(..4) {
            assert!(receiver.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_with_unavailable() {
        let backend = MockBackend::new(8);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let config = base_config(8, vec![4], 1_000_000);
        let scheduler = ModelScheduler::new(config, vec![instance], 1);

        scheduler.enqueue(request(None, true, true)).unwrap();
        let err = scheduler.enqueue(request(None, true, true)).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn oversized_batch_dimension_is_rejected() {
        let backend = MockBackend::new(4);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let config = base_config(4, vec![4], 1_000);
        let scheduler = ModelScheduler::new(config, vec![instance], 16);

        let mut payload = request(None, true, true);
        payload.inputs.insert(
            "x".into(),
            TensorBytes {
                dtype: multiserve_proto::DataType::Fp32,
                shape: vec![100],
                bytes: vec![],
            },
        );
        let err = scheduler.enqueue(payload).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn stateful_requests_are_pinned_to_one_instance() {
        let backend_a = MockBackend::new(4);
        let backend_b = MockBackend::new(4);
        let instance_a = Arc::new(BackendInstance::new(1, Box::new(backend_a)));
        let instance_b = Arc::new(BackendInstance::new(2, Box::new(backend_b)));

        let mut config = base_config(4, vec![], 1_000);
        config.sequence_batching = Some(SequenceBatchingConfig {
            max_sequence_idle_microseconds: 60_000_000,
        });
        let scheduler = Arc::new(ModelScheduler::new(config, vec![instance_a, instance_b], 16));

        let r1 = scheduler.enqueue(request(Some(7), true, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(scheduler.dispatch_once());
        r1.await.unwrap().unwrap();

        let r2 = scheduler.enqueue(request(Some(7), false, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(scheduler.dispatch_once());
        r2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_correlation_without_start_flag_is_rejected() {
        let backend = MockBackend::new(4);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let mut config = base_config(4, vec![], 1_000);
        config.sequence_batching = Some(SequenceBatchingConfig {
            max_sequence_idle_microseconds: 60_000_000,
        });
        let scheduler = ModelScheduler::new(config, vec![instance], 16);

        let err = scheduler.enqueue(request(Some(99), false, false)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn fatal_backend_error_removes_instance_and_fails_batch() {
        let backend = MockBackend::new(4);
        backend.arm_failure(true);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let config = base_config(4, vec![1], 1_000);
        let scheduler = Arc::new(ModelScheduler::new(config, vec![instance], 16));

        let receiver = scheduler.enqueue(request(None, true, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(scheduler.dispatch_once());
        assert!(receiver.await.unwrap().is_err());

        // No instances remain, so the request after the failure is rejected.
        scheduler.enqueue(request(None, true, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!scheduler.dispatch_once());
    }

    #[tokio::test]
    async fn concurrent_enqueue_during_dispatch_never_jumps_ahead_of_older_requests() {
        // Testable Property #4 (FIFO for stateless models): a request enqueued
        // while `dispatch_once` is deciding its batch must land behind every
        // request that was already queued, never in front of one that gets
        // left behind.
        let backend = MockBackend::new(8);
        let instance = Arc::new(BackendInstance::new(1, Box::new(backend)));
        let config = base_config(8, vec![2], 1_000_000);
        let scheduler = Arc::new(ModelScheduler::new(config, vec![instance], 16));

        let first = scheduler.enqueue(request(None, true, true)).unwrap();
        let second = scheduler.enqueue(request(None, true, true)).unwrap();
        assert!(scheduler.dispatch_once());
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let third = scheduler.enqueue(request(None, true, true)).unwrap();
        assert_eq!(scheduler.queue_depth(), 1);
        drop(third);
    }
}
