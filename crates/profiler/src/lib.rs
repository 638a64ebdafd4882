//! Load-generating profiling client (spec section 1)
//!
//! Wires a request-rate/concurrency-scheduling load manager to a
//! measurement loop that searches a load axis for the point where a
//! latency threshold is met, mirroring the original's `perf_client`.

pub mod cli;
pub mod client;
pub mod input;
pub mod load_manager;
pub mod profiler;
pub mod rate;
pub mod search;
pub mod stats;

pub use client::{EchoClient, TargetClient};
pub use input::{fabricate_inputs, InputSource};
pub use load_manager::LoadManager;
pub use profiler::{InferenceProfiler, NullServerStats, ProfilerConfig, ServerStatsSource};
pub use rate::RateDistribution;
pub use search::{SearchMode, NO_LIMIT};
pub use stats::{ClientSideStats, PerfStatus, RequestTiming, ServerSideStats};
