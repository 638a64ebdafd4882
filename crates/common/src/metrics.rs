//! Metrics collection for MultiServe
//!
//! Prometheus metrics for the scheduler and profiler subsystems. All
//! metrics are registered once into a process-wide registry, matching the
//! teacher's `MetricsRegistry` shape.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for MultiServe.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub profiler: ProfilerMetrics,
}

/// Scheduler-side metrics.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Total requests enqueued.
    pub requests_total: IntCounter,

    /// Requests rejected at enqueue time (queue full, invalid argument, ...).
    pub requests_rejected: IntCounter,

    /// Requests that failed in a dispatched batch.
    pub requests_failed: IntCounter,

    /// Current per-model queue depth, summed across models.
    pub queue_depth: IntGauge,

    /// Time a request spends queued before dispatch.
    pub queue_wait: Histogram,

    /// Dispatched batch size distribution.
    pub batch_size: Histogram,

    /// Backend `Run` duration.
    pub backend_run_duration: Histogram,

    /// Count of instances currently busy.
    pub instances_busy: IntGauge,

    /// Count of instances marked fatal and removed.
    pub instances_fatal: IntCounter,
}

/// Profiler-side metrics.
#[derive(Debug, Clone)]
pub struct ProfilerMetrics {
    /// Measurement windows taken.
    pub measurements_total: IntCounter,

    /// Measurement windows judged unstable (triggered a retry).
    pub measurements_unstable: IntCounter,

    /// Client-observed request latency.
    pub client_latency: Histogram,

    /// Inferences per second at the current load point.
    pub inferences_per_second: prometheus::Gauge,
}

lazy_static! {
    /// Global metrics registry instance.
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "scheduler_requests_total",
            "Total number of requests enqueued",
        )
        .unwrap();

        let requests_rejected = IntCounter::new(
            "scheduler_requests_rejected_total",
            "Total number of requests rejected at enqueue time",
        )
        .unwrap();

        let requests_failed = IntCounter::new(
            "scheduler_requests_failed_total",
            "Total number of requests that failed within a dispatched batch",
        )
        .unwrap();

        let queue_depth = IntGauge::new(
            "scheduler_queue_depth",
            "Current total queue depth across all models",
        )
        .unwrap();

        let queue_wait = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "scheduler_queue_wait_seconds",
                "Time a request spends queued before dispatch",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5]),
        )
        .unwrap();

        let batch_size = Histogram::with_opts(
            prometheus::HistogramOpts::new("scheduler_batch_size", "Dispatched batch size")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )
        .unwrap();

        let backend_run_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "scheduler_backend_run_duration_seconds",
                "Backend Run() call duration",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0]),
        )
        .unwrap();

        let instances_busy = IntGauge::new(
            "scheduler_instances_busy",
            "Current number of busy backend instances",
        )
        .unwrap();

        let instances_fatal = IntCounter::new(
            "scheduler_instances_fatal_total",
            "Total number of backend instances removed after a fatal error",
        )
        .unwrap();

        let measurements_total = IntCounter::new(
            "profiler_measurements_total",
            "Total number of measurement windows taken",
        )
        .unwrap();

        let measurements_unstable = IntCounter::new(
            "profiler_measurements_unstable_total",
            "Total number of measurement windows judged unstable",
        )
        .unwrap();

        let client_latency = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "profiler_client_latency_seconds",
                "Client-observed request latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )
        .unwrap();

        let inferences_per_second = prometheus::Gauge::new(
            "profiler_inferences_per_second",
            "Observed inferences per second at the current load point",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(queue_wait.clone())).unwrap();
        registry.register(Box::new(batch_size.clone())).unwrap();
        registry
            .register(Box::new(backend_run_duration.clone()))
            .unwrap();
        registry.register(Box::new(instances_busy.clone())).unwrap();
        registry.register(Box::new(instances_fatal.clone())).unwrap();
        registry.register(Box::new(measurements_total.clone())).unwrap();
        registry
            .register(Box::new(measurements_unstable.clone()))
            .unwrap();
        registry.register(Box::new(client_latency.clone())).unwrap();
        registry
            .register(Box::new(inferences_per_second.clone()))
            .unwrap();

        let scheduler = SchedulerMetrics {
            requests_total,
            requests_rejected,
            requests_failed,
            queue_depth,
            queue_wait,
            batch_size,
            backend_run_duration,
            instances_busy,
            instances_fatal,
        };

        let profiler = ProfilerMetrics {
            measurements_total,
            measurements_unstable,
            client_latency,
            inferences_per_second,
        };

        MetricsRegistry {
            registry,
            scheduler,
            profiler,
        }
    }

    /// Gather all metrics as Prometheus text exposition format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for timing a closure into a histogram.
pub trait LatencyTimer {
    fn observe<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn observe<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        let duration = start.elapsed().as_secs_f64();
        Histogram::observe(self, duration);
        result
    }
}
