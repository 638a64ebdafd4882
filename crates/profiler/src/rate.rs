//! Request-rate scheduling (spec section 4.4, rate mode)
//!
//! An inter-arrival schedule with mean `1/R`: either `Uniform` (every
//! request spaced exactly `1/R` apart) or `Poisson` (exponentially
//! distributed gaps, sampled via inverse-transform from a `U(0,1)` draw).
//! Pure functions so the scheduling math is tested without a clock or a
//! running load manager.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDistribution {
    Uniform,
    Poisson,
}

/// How far past its scheduled send time a request is considered late
/// before it counts toward `delayed_request_count`.
pub const LATE_TOLERANCE: Duration = Duration::from_millis(1);

/// Samples the next inter-arrival interval for mean rate `rate_per_sec`.
/// `uniform01` must be in `(0, 1]`; callers supply it from an RNG so this
/// function stays deterministic and testable.
pub fn interarrival_interval(rate_per_sec: f64, distribution: RateDistribution, uniform01: f64) -> Duration {
    let mean_secs = 1.0 / rate_per_sec.max(f64::MIN_POSITIVE);
    let secs = match distribution {
        RateDistribution::Uniform => mean_secs,
        RateDistribution::Poisson => {
            let u = uniform01.clamp(f64::MIN_POSITIVE, 1.0);
            -mean_secs * u.ln()
        }
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// True if `actual_send` missed `scheduled_send` by more than the
/// tolerance (spec section 3, "delayed-request count").
pub fn is_delayed(
    scheduled_send: std::time::Instant,
    actual_send: std::time::Instant,
) -> bool {
    actual_send.saturating_duration_since(scheduled_send) > LATE_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn uniform_interval_equals_mean_period() {
        let interval = interarrival_interval(10.0, RateDistribution::Uniform, 0.5);
        assert!((interval.as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn poisson_interval_is_exponential_inverse_transform() {
        // At u=1, ln(1)=0 -> interval 0. At small u, interval grows.
        let at_one = interarrival_interval(10.0, RateDistribution::Poisson, 1.0);
        assert_eq!(at_one, Duration::ZERO);

        let small = interarrival_interval(10.0, RateDistribution::Poisson, 0.01);
        let large = interarrival_interval(10.0, RateDistribution::Poisson, 0.5);
        assert!(small > large);
    }

    #[test]
    fn is_delayed_respects_tolerance() {
        let scheduled = Instant::now();
        let on_time = scheduled + Duration::from_micros(500);
        let late = scheduled + Duration::from_millis(5);
        assert!(!is_delayed(scheduled, on_time));
        assert!(is_delayed(scheduled, late));
    }
}
