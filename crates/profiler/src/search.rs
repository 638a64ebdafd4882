//! 1-D search over a load axis (spec section 4.5, "Search")
//!
//! Grounded on `inference_profiler.h`'s load-parameter sweep: a linear scan
//! across `[start, end]` by `step`, or a binary search maintaining the
//! invariant that `lo` meets the stability+latency threshold and `hi` does
//! not. `NONE` takes exactly one measurement at no load parameter (custom
//! load mode, where the rate schedule is supplied externally).

use multiserve_common::{Error, Result};

/// Sentinel for an unbounded linear-search end (spec GLOSSARY, `NO_LIMIT`).
pub const NO_LIMIT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    None,
    Linear,
    Binary,
}

/// One probe of the search: the load value tried and whether it met the
/// combined stability + latency threshold.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub value: u64,
    pub meets_threshold: bool,
}

/// Drives a linear or binary search over `u64` load values (concurrency) by
/// repeatedly asking the caller to measure a value and report whether it met
/// threshold. `measure` returns `Err` to abort the search (a measurement
/// error propagates per spec section 4.5, "Failure semantics").
pub fn run_search(
    mode: SearchMode,
    start: u64,
    end: u64,
    step: u64,
    mut measure: impl FnMut(u64) -> Result<bool>,
) -> (Vec<Probe>, Result<()>) {
    let mut trace = Vec::new();

    match mode {
        SearchMode::None => {
            let outcome = measure(start).map(|meets| {
                trace.push(Probe {
                    value: start,
                    meets_threshold: meets,
                });
            });
            (trace, outcome)
        }
        SearchMode::Linear => linear_search(start, end, step, &mut measure, &mut trace),
        SearchMode::Binary => binary_search(start, end, step, &mut measure, &mut trace),
    }
}

fn linear_search(
    start: u64,
    end: u64,
    step: u64,
    measure: &mut impl FnMut(u64) -> Result<bool>,
    trace: &mut Vec<Probe>,
) -> (Vec<Probe>, Result<()>) {
    let step = step.max(1);
    let mut value = start;
    loop {
        if end != NO_LIMIT && value > end {
            break;
        }
        let meets = match measure(value) {
            Ok(m) => m,
            Err(e) => return (std::mem::take(trace), Err(e)),
        };
        trace.push(Probe {
            value,
            meets_threshold: meets,
        });
        if !meets {
            break;
        }
        value = match value.checked_add(step) {
            Some(v) => v,
            None => break,
        };
    }
    (std::mem::take(trace), Ok(()))
}

fn binary_search(
    start: u64,
    end: u64,
    step: u64,
    measure: &mut impl FnMut(u64) -> Result<bool>,
    trace: &mut Vec<Probe>,
) -> (Vec<Probe>, Result<()>) {
    let step = step.max(1);

    let lo_meets = match measure(start) {
        Ok(m) => m,
        Err(e) => return (std::mem::take(trace), Err(e)),
    };
    trace.push(Probe {
        value: start,
        meets_threshold: lo_meets,
    });
    if !lo_meets {
        return (
            std::mem::take(trace),
            Err(Error::invalid_argument(format!(
                "binary search requires start={start} to meet threshold"
            ))),
        );
    }

    let hi_meets = match measure(end) {
        Ok(m) => m,
        Err(e) => return (std::mem::take(trace), Err(e)),
    };
    trace.push(Probe {
        value: end,
        meets_threshold: hi_meets,
    });
    if hi_meets {
        return (
            std::mem::take(trace),
            Err(Error::invalid_argument(format!(
                "binary search requires end={end} to not meet threshold"
            ))),
        );
    }

    let mut lo = start;
    let mut hi = end;
    while hi - lo > step {
        let mid = lo + (hi - lo) / 2;
        let meets = match measure(mid) {
            Ok(m) => m,
            Err(e) => return (std::mem::take(trace), Err(e)),
        };
        trace.push(Probe {
            value: mid,
            meets_threshold: meets,
        });
        if meets {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    (std::mem::take(trace), Ok(()))
}
