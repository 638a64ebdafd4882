//! MultiServe Profiler - Main Entry Point
//!
//! Parses the CLI surface, fabricates input tensors, wires an `EchoClient`
//! (or a real `TargetClient`, when one is plugged in) into a `LoadManager`,
//! and runs an `InferenceProfiler` search over the chosen load axis,
//! printing one line per measured load point.

use multiserve_common::metrics::METRICS;
use multiserve_profiler::cli::{exit_code, parse_args, LoadAxis};
use multiserve_profiler::{
    fabricate_inputs, EchoClient, InferenceProfiler, InputSource, LoadManager, NullServerStats,
    ProfilerConfig,
};
use multiserve_proto::RequestPayload;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multiserve_profiler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };

    info!(url = %args.url, model = %args.model_name, "starting multiserve profiler");

    let source = if let Some(dir) = &args.input_data {
        InputSource::Directory(dir.clone())
    } else {
        InputSource::Synthetic {
            zero: args.zero_input,
            string_length: args.string_length,
            string_data: args.string_data.clone(),
        }
    };

    // Without a model-metadata endpoint wired in (out of scope, spec section
    // 1), input shapes come entirely from `--shape` overrides.
    let input_specs: Vec<multiserve_proto::IoSpec> = args
        .shapes
        .iter()
        .map(|(name, dims)| multiserve_proto::IoSpec {
            name: name.clone(),
            data_type: multiserve_proto::DataType::Fp32,
            dims: dims.clone(),
            reshape: None,
        })
        .collect();

    let inputs = match fabricate_inputs(&input_specs, 1, &source) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };

    let request_template = RequestPayload {
        model_name: args.model_name.clone(),
        model_version: args.model_version,
        inputs,
        correlation_id: None,
        sequence_start: true,
        sequence_end: true,
    };

    // `LoadManager` spawns its worker pool as tokio tasks even though the
    // profiler drives it synchronously (spec section 5); entering the
    // runtime here lets `tokio::spawn` work from this non-async `main`
    // without wrapping the whole measurement loop in `block_on`.
    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let _guard = runtime.enter();

    let client = Arc::new(EchoClient::new(Duration::ZERO));
    let load_manager = Arc::new(LoadManager::new(
        client,
        request_template,
        args.max_threads,
        false,
    ));

    let model = multiserve_proto::ModelIdentifier::new(args.model_name.clone(), args.model_version);
    let profiler_config = ProfilerConfig {
        measurement_window: args.measurement_interval,
        stability_threshold: args.stability_percentage / 100.0,
        max_trials: args.max_trials,
        latency_threshold: args.latency_threshold,
        percentile: args.percentile,
        ..ProfilerConfig::default()
    };

    let profiler = InferenceProfiler::new(
        load_manager.clone(),
        Arc::new(NullServerStats),
        model,
        profiler_config,
    );

    let (start, end, step) = match args.axis {
        LoadAxis::Concurrency { start, end, step } => (start, end, step),
        LoadAxis::RequestRate { start, end, step, .. } => (start, end, step),
    };

    let (measured, outcome) = profiler.profile(args.search_mode, start, end, step);

    for status in &measured {
        println!(
            "concurrency={:?} inferences/sec={:.2} latency={:?} requests={}",
            status.concurrency,
            status.client_stats.inferences_per_sec,
            status.stabilizing_latency,
            status.client_stats.request_count,
        );
    }

    runtime.block_on(load_manager.shutdown());

    info!(metrics = METRICS.gather().len(), "profiler run complete");

    match outcome {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("measurement error: {e}");
            ExitCode::from(exit_code::MEASUREMENT_ERROR as u8)
        }
    }
}
