//! Command-line argument parsing (spec section 6, "Profiler CLI surface")
//!
//! A hand-rolled `--flag value` matcher rather than a parsing crate,
//! matching how little the rest of this workspace invests in argument
//! parsing (config lives in YAML; the CLI only needs to select a load axis
//! and a few thresholds).

use crate::rate::RateDistribution;
use crate::search::SearchMode;
use multiserve_common::{Error, Result};
use std::time::Duration;

/// The axis the load manager is driven along.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadAxis {
    Concurrency { start: u64, end: u64, step: u64 },
    RequestRate { start: u64, end: u64, step: u64, distribution: RateDistribution },
}

#[derive(Debug, Clone)]
pub struct ProfilerArgs {
    pub url: String,
    pub model_name: String,
    pub model_version: i64,
    pub max_threads: usize,
    pub axis: LoadAxis,
    pub search_mode: SearchMode,
    pub measurement_interval: Duration,
    pub stability_percentage: f64,
    pub max_trials: u32,
    pub latency_threshold: Duration,
    pub percentile: i32,
    pub input_data: Option<std::path::PathBuf>,
    pub string_length: usize,
    pub string_data: Option<String>,
    pub zero_input: bool,
    pub shapes: Vec<(String, Vec<i64>)>,
}

impl Default for ProfilerArgs {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:8001".into(),
            model_name: String::new(),
            model_version: 1,
            max_threads: 4,
            axis: LoadAxis::Concurrency { start: 1, end: 1, step: 1 },
            search_mode: SearchMode::None,
            measurement_interval: Duration::from_millis(5000),
            stability_percentage: 10.0,
            max_trials: 10,
            latency_threshold: Duration::MAX,
            percentile: -1,
            input_data: None,
            string_length: 16,
            string_data: None,
            zero_input: false,
            shapes: Vec::new(),
        }
    }
}

/// Exit codes, matching the original perf_client's three-way split between
/// "ran to completion", "bad arguments" and "something broke mid-run".
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const MEASUREMENT_ERROR: i32 = 2;
}

fn parse_range(spec: &str, flag: &str) -> Result<(u64, u64, u64)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let parse_one = |s: &str| -> Result<u64> {
        s.parse::<u64>()
            .map_err(|_| Error::config(format!("{flag}: '{s}' is not a non-negative integer")))
    };
    match parts.as_slice() {
        [start] => {
            let start = parse_one(start)?;
            Ok((start, start, 1))
        }
        [start, end] => Ok((parse_one(start)?, parse_one(end)?, 1)),
        [start, end, step] => Ok((parse_one(start)?, parse_one(end)?, parse_one(step)?)),
        _ => Err(Error::config(format!(
            "{flag} expects start[:end[:step]], got '{spec}'"
        ))),
    }
}

fn parse_shape(spec: &str) -> Result<(String, Vec<i64>)> {
    let (name, dims) = spec
        .split_once(':')
        .ok_or_else(|| Error::config(format!("--shape expects NAME:d1,d2,..., got '{spec}'")))?;
    let dims = dims
        .split(',')
        .map(|d| {
            d.parse::<i64>()
                .map_err(|_| Error::config(format!("--shape: '{d}' is not an integer dimension")))
        })
        .collect::<Result<Vec<i64>>>()?;
    Ok((name.to_string(), dims))
}

/// Parses argv (excluding the program name). Unknown or malformed flags
/// produce a `Config` error, which the binary maps to `exit_code::CONFIG_ERROR`.
pub fn parse_args(args: &[String]) -> Result<ProfilerArgs> {
    let mut parsed = ProfilerArgs::default();
    let mut i = 0;

    let mut take_value = |args: &[String], i: &mut usize, flag: &str| -> Result<String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| Error::config(format!("{flag} requires a value")))
    };

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--url" => parsed.url = take_value(args, &mut i, flag)?,
            "--model-name" => parsed.model_name = take_value(args, &mut i, flag)?,
            "--model-version" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.model_version = v
                    .parse()
                    .map_err(|_| Error::config(format!("--model-version: '{v}' is not an integer")))?;
            }
            "--max-threads" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.max_threads = v
                    .parse()
                    .map_err(|_| Error::config(format!("--max-threads: '{v}' is not a non-negative integer")))?;
            }
            "--concurrency-range" => {
                let v = take_value(args, &mut i, flag)?;
                let (start, end, step) = parse_range(&v, flag)?;
                parsed.axis = LoadAxis::Concurrency { start: start.max(1), end, step };
            }
            "--request-rate-range" => {
                let v = take_value(args, &mut i, flag)?;
                let (start, end, step) = parse_range(&v, flag)?;
                parsed.axis = LoadAxis::RequestRate {
                    start: start.max(1),
                    end,
                    step,
                    distribution: RateDistribution::Poisson,
                };
            }
            "--rate-distribution" => {
                let v = take_value(args, &mut i, flag)?;
                let distribution = match v.as_str() {
                    "poisson" => RateDistribution::Poisson,
                    "uniform" => RateDistribution::Uniform,
                    other => {
                        return Err(Error::config(format!(
                            "--rate-distribution expects poisson|uniform, got '{other}'"
                        )))
                    }
                };
                if let LoadAxis::RequestRate { start, end, step, .. } = parsed.axis {
                    parsed.axis = LoadAxis::RequestRate { start, end, step, distribution };
                }
            }
            "--measurement-interval" => {
                let v = take_value(args, &mut i, flag)?;
                let ms: u64 = v
                    .parse()
                    .map_err(|_| Error::config(format!("--measurement-interval: '{v}' is not milliseconds")))?;
                parsed.measurement_interval = Duration::from_millis(ms);
            }
            "--stability-percentage" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.stability_percentage = v
                    .parse()
                    .map_err(|_| Error::config(format!("--stability-percentage: '{v}' is not a number")))?;
            }
            "--max-trials" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.max_trials = v
                    .parse()
                    .map_err(|_| Error::config(format!("--max-trials: '{v}' is not a non-negative integer")))?;
            }
            "--latency-threshold" => {
                let v = take_value(args, &mut i, flag)?;
                let ms: u64 = v
                    .parse()
                    .map_err(|_| Error::config(format!("--latency-threshold: '{v}' is not milliseconds")))?;
                parsed.latency_threshold = Duration::from_millis(ms);
            }
            "--percentile" => {
                let v = take_value(args, &mut i, flag)?;
                let p: i32 = v
                    .parse()
                    .map_err(|_| Error::config(format!("--percentile: '{v}' is not an integer")))?;
                if p != -1 && !(1..=99).contains(&p) {
                    return Err(Error::config(format!(
                        "--percentile must be -1 or in 1..=99, got {p}"
                    )));
                }
                parsed.percentile = p;
            }
            "--search-mode" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.search_mode = match v.as_str() {
                    "none" => SearchMode::None,
                    "linear" => SearchMode::Linear,
                    "binary" => SearchMode::Binary,
                    other => {
                        return Err(Error::config(format!(
                            "--search-mode expects none|linear|binary, got '{other}'"
                        )))
                    }
                };
            }
            "--input-data" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.input_data = Some(std::path::PathBuf::from(v));
            }
            "--string-length" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.string_length = v
                    .parse()
                    .map_err(|_| Error::config(format!("--string-length: '{v}' is not a non-negative integer")))?;
            }
            "--string-data" => {
                parsed.string_data = Some(take_value(args, &mut i, flag)?);
            }
            "--zero-input" => {
                parsed.zero_input = true;
            }
            "--shape" => {
                let v = take_value(args, &mut i, flag)?;
                parsed.shapes.push(parse_shape(&v)?);
            }
            other => {
                return Err(Error::config(format!("unrecognized flag '{other}'")));
            }
        }
        i += 1;
    }

    if parsed.model_name.is_empty() {
        return Err(Error::config("--model-name is required"));
    }

    Ok(parsed)
}
