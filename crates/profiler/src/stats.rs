//! Measurement statistics (spec section 3, "Measurement Sample" / section 4.5)
//!
//! Grounded on `inference_profiler.h`'s `ServerSideStats`, `ClientSideStats`
//! and `PerfStatus`: one measurement window's worth of server- and
//! client-side numbers, computed by differencing two server snapshots and
//! filtering client timestamps to the window's valid interval.

use multiserve_proto::ModelIdentifier;
use std::collections::HashMap;
use std::time::Duration;

/// Server-reported cumulative/queue/compute time counters for one model,
/// recursing into composing models for an ensemble (spec section 4.5 step 6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSideStats {
    pub request_count: u64,
    pub cumulative_time_ns: u64,
    pub queue_time_ns: u64,
    pub compute_time_ns: u64,
    pub composing_models: HashMap<ModelIdentifier, ServerSideStats>,
}

impl ServerSideStats {
    /// Differences two snapshots (`self` is the later one, `s1 - s0`),
    /// recursing into composing models by identifier.
    pub fn diff(&self, earlier: &ServerSideStats) -> ServerSideStats {
        let mut composing = HashMap::new();
        for (id, later_child) in &self.composing_models {
            let earlier_child = earlier
                .composing_models
                .get(id)
                .cloned()
                .unwrap_or_default();
            composing.insert(id.clone(), later_child.diff(&earlier_child));
        }

        ServerSideStats {
            request_count: self.request_count.saturating_sub(earlier.request_count),
            cumulative_time_ns: self
                .cumulative_time_ns
                .saturating_sub(earlier.cumulative_time_ns),
            queue_time_ns: self.queue_time_ns.saturating_sub(earlier.queue_time_ns),
            compute_time_ns: self
                .compute_time_ns
                .saturating_sub(earlier.compute_time_ns),
            composing_models: composing,
        }
    }
}

/// Client-observed statistics for one measurement window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSideStats {
    pub request_count: u64,
    /// Only sequences that both started and ended within the window.
    pub sequence_count: u64,
    /// Requests that missed their scheduled send time (rate mode).
    pub delayed_request_count: u64,
    pub duration: Duration,
    pub avg_latency: Duration,
    /// Percentile (e.g. 50, 90, 99) -> latency.
    pub percentile_latency: HashMap<u32, Duration>,
    /// Standard deviation, computed in microseconds to avoid overflow
    /// squaring large nanosecond counts (spec section 4.5 step 5).
    pub std_dev_us: f64,
    pub avg_send: Duration,
    pub avg_server_round_trip: Duration,
    pub avg_receive: Duration,
    pub inferences_per_sec: f64,
    pub sequences_per_sec: f64,
}

/// One completed request's timing, as recorded by a load manager worker.
#[derive(Debug, Clone, Copy)]
pub struct RequestTiming {
    pub send_start: std::time::Instant,
    pub send_end: std::time::Instant,
    pub recv_start: std::time::Instant,
    pub recv_end: std::time::Instant,
    pub sequence_start: bool,
    pub sequence_end: bool,
}

impl RequestTiming {
    pub fn total_latency(&self) -> Duration {
        self.recv_end.saturating_duration_since(self.send_start)
    }

    fn send_phase(&self) -> Duration {
        self.send_end.saturating_duration_since(self.send_start)
    }

    fn server_round_trip(&self) -> Duration {
        self.recv_start.saturating_duration_since(self.send_end)
    }

    fn receive_phase(&self) -> Duration {
        self.recv_end.saturating_duration_since(self.recv_start)
    }
}

/// Computes client-side stats from the timings whose completion falls in
/// `[window_start, window_end]` (spec section 4.5 step 4's valid interval).
///
/// `delayed` counts requests from the full set that missed their scheduled
/// send time, independent of whether they fall in the valid interval (a
/// delayed send is itself an observation about the window being measured).
pub fn compute_client_stats(
    timings: &[RequestTiming],
    window_start: std::time::Instant,
    window_end: std::time::Instant,
    delayed_request_count: u64,
    percentiles: &[u32],
) -> ClientSideStats {
    let in_window: Vec<&RequestTiming> = timings
        .iter()
        .filter(|t| t.recv_end >= window_start && t.recv_end <= window_end)
        .collect();

    if in_window.is_empty() {
        return ClientSideStats {
            delayed_request_count,
            ..Default::default()
        };
    }

    let sequence_count = in_window
        .iter()
        .filter(|t| t.sequence_start && t.sequence_end)
        .count() as u64;

    let mut latencies_ns: Vec<u64> = in_window
        .iter()
        .map(|t| t.total_latency().as_nanos() as u64)
        .collect();
    latencies_ns.sort_unstable();

    let sum_ns: u128 = latencies_ns.iter().map(|&l| l as u128).sum();
    let avg_ns = (sum_ns / latencies_ns.len() as u128) as u64;
    let avg_latency = Duration::from_nanos(avg_ns);

    let mean_us = avg_ns as f64 / 1_000.0;
    let variance_us = latencies_ns
        .iter()
        .map(|&l| {
            let us = l as f64 / 1_000.0;
            (us - mean_us).powi(2)
        })
        .sum::<f64>()
        / latencies_ns.len() as f64;
    let std_dev_us = variance_us.sqrt();

    let percentile_latency = percentiles
        .iter()
        .map(|&p| (p, Duration::from_nanos(percentile_of(&latencies_ns, p))))
        .collect();

    let avg_send = average_duration(in_window.iter().map(|t| t.send_phase()));
    let avg_round_trip = average_duration(in_window.iter().map(|t| t.server_round_trip()));
    let avg_receive = average_duration(in_window.iter().map(|t| t.receive_phase()));

    let duration = window_end.saturating_duration_since(window_start);
    let secs = duration.as_secs_f64().max(f64::EPSILON);

    ClientSideStats {
        request_count: in_window.len() as u64,
        sequence_count,
        delayed_request_count,
        duration,
        avg_latency,
        percentile_latency,
        std_dev_us,
        avg_send,
        avg_server_round_trip: avg_round_trip,
        avg_receive,
        inferences_per_sec: in_window.len() as f64 / secs,
        sequences_per_sec: sequence_count as f64 / secs,
    }
}

fn average_duration(durations: impl Iterator<Item = Duration> + Clone) -> Duration {
    let count = durations.clone().count();
    if count == 0 {
        return Duration::ZERO;
    }
    let total: Duration = durations.sum();
    total / count as u32
}

/// Nearest-rank percentile over an ascending-sorted slice of nanosecond
/// latencies.
fn percentile_of(sorted_ns: &[u64], percentile: u32) -> u64 {
    if sorted_ns.is_empty() {
        return 0;
    }
    let rank = ((percentile as f64 / 100.0) * sorted_ns.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted_ns.len() - 1);
    sorted_ns[idx]
}

/// The stabilizing latency for one sample: mean, or a chosen percentile.
/// `percentile == -1` selects the mean (spec section 6, boundary behavior).
pub fn stabilizing_latency(stats: &ClientSideStats, percentile: i32) -> Duration {
    if percentile < 0 {
        return stats.avg_latency;
    }
    stats
        .percentile_latency
        .get(&(percentile as u32))
        .copied()
        .unwrap_or(stats.avg_latency)
}

/// The full statistics record for one load point (spec section 3).
#[derive(Debug, Clone)]
pub struct PerfStatus {
    pub concurrency: Option<usize>,
    pub request_rate: Option<f64>,
    pub batch_size: usize,
    pub server_stats: ServerSideStats,
    pub client_stats: ClientSideStats,
    pub on_sequence_model: bool,
    pub stabilizing_latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn timing_with_latency(base: Instant, latency_ms: u64) -> RequestTiming {
        RequestTiming {
            send_start: base,
            send_end: base + Duration::from_millis(1),
            recv_start: base + Duration::from_millis(latency_ms - 1),
            recv_end: base + Duration::from_millis(latency_ms),
            sequence_start: true,
            sequence_end: true,
        }
    }

    #[test]
    fn percentile_of_picks_nearest_rank() {
        let sorted = vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile_of(&sorted, 50), 50);
        assert_eq!(percentile_of(&sorted, 90), 90);
        assert_eq!(percentile_of(&sorted, 100), 100);
    }

    #[test]
    fn compute_client_stats_filters_to_valid_interval() {
        let base = Instant::now();
        let timings = vec![
            timing_with_latency(base, 10),
            timing_with_latency(base + Duration::from_secs(10), 10),
        ];

        let window_end = base + Duration::from_millis(100);
        let stats = compute_client_stats(&timings, base, window_end, 0, &[50, 99]);
        assert_eq!(stats.request_count, 1);
    }

    #[test]
    fn stabilizing_latency_uses_mean_for_sentinel_percentile() {
        let stats = ClientSideStats {
            avg_latency: Duration::from_millis(7),
            ..Default::default()
        };
        assert_eq!(stabilizing_latency(&stats, -1), Duration::from_millis(7));
    }

    #[test]
    fn server_side_stats_diff_subtracts_and_recurses() {
        let mut earlier_children = HashMap::new();
        earlier_children.insert(
            ModelIdentifier::new("child", 1),
            ServerSideStats {
                request_count: 5,
                ..Default::default()
            },
        );
        let earlier = ServerSideStats {
            request_count: 10,
            composing_models: earlier_children,
            ..Default::default()
        };

        let mut later_children = HashMap::new();
        later_children.insert(
            ModelIdentifier::new("child", 1),
            ServerSideStats {
                request_count: 12,
                ..Default::default()
            },
        );
        let later = ServerSideStats {
            request_count: 25,
            composing_models: later_children,
            ..Default::default()
        };

        let diff = later.diff(&earlier);
        assert_eq!(diff.request_count, 15);
        assert_eq!(
            diff.composing_models[&ModelIdentifier::new("child", 1)].request_count,
            7
        );
    }
}
