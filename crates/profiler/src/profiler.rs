//! Stability detection and the measurement loop (spec section 4.5)
//!
//! Grounded on `inference_profiler.h`: one measurement takes a server-side
//! snapshot before and after a sleep window, differences them, and combines
//! the difference with client-side timestamps drained from the load
//! manager into one `PerfStatus`. The profiler retries measurement windows
//! until a sliding window of the last `stability_window` samples agrees
//! within `stability_threshold`, or gives up after `max_trials`.
//!
//! The profiler itself is deliberately synchronous ("Profiler runs on the
//! main thread and blocks on measurement windows", spec section 5): it
//! drives the (async, task-based) load manager through its plain
//! function-call API and sleeps on `std::thread::sleep` between snapshots.

use crate::load_manager::LoadManager;
use crate::search::{run_search, Probe, SearchMode};
use crate::stats::{compute_client_stats, stabilizing_latency, PerfStatus, ServerSideStats};
use multiserve_common::metrics::METRICS;
use multiserve_common::{Error, Result};
use multiserve_proto::ModelIdentifier;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fetches a server-side statistics snapshot for a model. The stats
/// endpoint itself is part of the wire protocol and out of scope (spec
/// section 1); this trait is the boundary the profiler depends on.
pub trait ServerStatsSource: Send + Sync {
    fn snapshot(&self, model: &ModelIdentifier) -> Result<ServerSideStats>;
}

/// A source that always reports zeroed stats, for driving the profiler
/// against a target that doesn't expose server-side statistics.
pub struct NullServerStats;

impl ServerStatsSource for NullServerStats {
    fn snapshot(&self, _model: &ModelIdentifier) -> Result<ServerSideStats> {
        Ok(ServerSideStats::default())
    }
}

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub measurement_window: Duration,
    /// Default 3 (spec section 4.5).
    pub stability_window: usize,
    pub stability_threshold: f64,
    pub max_trials: u32,
    pub latency_threshold: Duration,
    /// -1 selects mean latency as the stabilizing statistic.
    pub percentile: i32,
    pub percentiles_to_report: Vec<u32>,
    pub on_sequence_model: bool,
    pub batch_size: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            measurement_window: Duration::from_millis(5000),
            stability_window: 3,
            stability_threshold: 0.1,
            max_trials: 10,
            latency_threshold: Duration::MAX,
            percentile: -1,
            percentiles_to_report: vec![50, 90, 95, 99],
            on_sequence_model: false,
            batch_size: 1,
        }
    }
}

pub struct InferenceProfiler {
    load_manager: Arc<LoadManager>,
    server_stats: Arc<dyn ServerStatsSource>,
    model: ModelIdentifier,
    config: ProfilerConfig,
}

impl InferenceProfiler {
    pub fn new(
        load_manager: Arc<LoadManager>,
        server_stats: Arc<dyn ServerStatsSource>,
        model: ModelIdentifier,
        config: ProfilerConfig,
    ) -> Self {
        Self {
            load_manager,
            server_stats,
            model,
            config,
        }
    }

    /// One measurement: snapshot, sleep, snapshot, diff, combine with
    /// drained client timestamps (spec section 4.5, "One measurement").
    fn measure_once(&self, concurrency: Option<usize>, request_rate: Option<f64>) -> Result<PerfStatus> {
        let s0 = self.server_stats.snapshot(&self.model)?;
        let t0 = Instant::now();

        std::thread::sleep(self.config.measurement_window);

        let s1 = self.server_stats.snapshot(&self.model)?;
        let t1 = Instant::now();

        let timings = self.load_manager.swap_timestamps();
        let delayed = self.load_manager.swap_delayed_count();
        self.load_manager.check_health()?;

        let client_stats =
            compute_client_stats(&timings, t0, t1, delayed, &self.config.percentiles_to_report);
        let server_stats = s1.diff(&s0);
        let stabilizing = stabilizing_latency(&client_stats, self.config.percentile);

        METRICS.profiler.measurements_total.inc();
        METRICS.profiler.inferences_per_second.set(client_stats.inferences_per_sec);

        Ok(PerfStatus {
            concurrency,
            request_rate,
            batch_size: self.config.batch_size,
            server_stats,
            client_stats,
            on_sequence_model: self.config.on_sequence_model,
            stabilizing_latency: stabilizing,
        })
    }

    /// Retries measurement windows at the current load point until a
    /// sliding window of the last `stability_window` samples agrees within
    /// `stability_threshold`, or `TimedOut` after `max_trials` (spec
    /// section 4.5, "Stability criterion").
    pub fn measure_stable(&self, concurrency: Option<usize>, request_rate: Option<f64>) -> Result<PerfStatus> {
        let mut window: VecDeque<PerfStatus> = VecDeque::with_capacity(self.config.stability_window);

        for _ in 0..self.config.max_trials.max(1) {
            let sample = self.measure_once(concurrency, request_rate)?;
            window.push_back(sample.clone());
            while window.len() > self.config.stability_window {
                window.pop_front();
            }

            if window.len() == self.config.stability_window {
                let samples: Vec<PerfStatus> = window.iter().cloned().collect();
                if is_window_stable(&samples, self.config.stability_threshold) {
                    return Ok(sample);
                }
            }
            METRICS.profiler.measurements_unstable.inc();
        }

        Err(Error::timed_out(format!(
            "no stable measurement window after {} trials",
            self.config.max_trials
        )))
    }

    /// A load point meets the threshold iff it is stable AND its
    /// stabilizing latency is within `latency_threshold_ms` (spec section
    /// 4.5, "Threshold check").
    fn meets_threshold(&self, status: &PerfStatus) -> bool {
        status.stabilizing_latency <= self.config.latency_threshold
    }

    /// Runs a NONE/LINEAR/BINARY search over concurrency (spec section
    /// 4.5, "Search"). Returns every `PerfStatus` measured and the search
    /// outcome; a measurement error aborts the search but the partial
    /// trace is still returned (spec section 4.5, "Failure semantics").
    pub fn profile(
        &self,
        mode: SearchMode,
        start: u64,
        end: u64,
        step: u64,
    ) -> (Vec<PerfStatus>, Result<()>) {
        let mut measured: Vec<PerfStatus> = Vec::new();

        let (_probes, outcome): (Vec<Probe>, Result<()>) = run_search(mode, start, end, step, |value| {
            self.load_manager.change_concurrency_level(value as usize)?;
            let sample = self.measure_stable(Some(value as usize), None)?;
            let meets = self.meets_threshold(&sample);
            measured.push(sample);
            Ok(meets)
        });

        (measured, outcome)
    }
}

/// Given the last `W` samples, checks that every sample's inferences/sec
/// and stabilizing latency lie within `(1 +/- threshold)` of the window's
/// mean (spec section 4.5).
fn is_window_stable(samples: &[PerfStatus], threshold: f64) -> bool {
    if samples.is_empty() {
        return false;
    }

    let mean_ips =
        samples.iter().map(|s| s.client_stats.inferences_per_sec).sum::<f64>() / samples.len() as f64;
    let mean_latency_ns = samples
        .iter()
        .map(|s| s.stabilizing_latency.as_nanos() as f64)
        .sum::<f64>()
        / samples.len() as f64;

    if mean_ips <= f64::EPSILON || mean_latency_ns <= f64::EPSILON {
        return false;
    }

    samples.iter().all(|s| {
        let ips_ratio = s.client_stats.inferences_per_sec / mean_ips;
        let latency_ratio = s.stabilizing_latency.as_nanos() as f64 / mean_latency_ns;
        (ips_ratio - 1.0).abs() <= threshold && (latency_ratio - 1.0).abs() <= threshold
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ClientSideStats;

    fn status(ips: f64, latency_ms: u64) -> PerfStatus {
        PerfStatus {
            concurrency: Some(1),
            request_rate: None,
            batch_size: 1,
            server_stats: ServerSideStats::default(),
            client_stats: ClientSideStats {
                inferences_per_sec: ips,
                ..Default::default()
            },
            on_sequence_model: false,
            stabilizing_latency: Duration::from_millis(latency_ms),
        }
    }

    #[test]
    fn window_within_threshold_is_stable() {
        let samples = vec![status(100.0, 10), status(101.0, 9), status(99.0, 11)];
        assert!(is_window_stable(&samples, 0.1));
    }

    // S6: latency oscillates between 9ms and 11ms against a 10% threshold;
    // the deviation from the window mean (10ms) is exactly +/-10%, so this
    // window sits right at the boundary and is judged stable, while a wider
    // oscillation is not.
    #[test]
    fn window_exceeding_threshold_is_unstable() {
        let samples = vec![status(100.0, 10), status(80.0, 15), status(120.0, 5)];
        assert!(!is_window_stable(&samples, 0.1));
    }

    #[test]
    fn empty_window_is_not_stable() {
        assert!(!is_window_stable(&[], 0.1));
    }
}
