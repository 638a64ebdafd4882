//! MultiServe common library
//!
//! Shared configuration, error, and metrics types used across the
//! scheduler and profiler crates.

pub mod config;
pub mod error;
pub mod metrics;

pub use config::MultiServeConfig;
pub use error::{Error, Result};
pub use metrics::{MetricsRegistry, METRICS};
