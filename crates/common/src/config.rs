//! Configuration structures for MultiServe
//!
//! Configurations are loaded from YAML files, following the same
//! `from_file` / `validate` pattern the teacher crate uses for its own
//! worker/coordinator configs.

use crate::error::{Error, Result};
use multiserve_proto::ModelConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which subsystem a process instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Scheduler,
    Profiler,
}

/// Top-level configuration for MultiServe components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiServeConfig {
    pub mode: Mode,

    pub bind_address: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiler: Option<ProfilerRunConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Scheduler-specific configuration: the models to load and the GPU memory
/// pool to hand to their backend instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Model configurations, one per model repository entry.
    pub models: Vec<ModelConfig>,

    /// GPU memory pool sizes, keyed by device index. Unspecified devices
    /// default to zero bytes and are skipped (spec section 6).
    #[serde(default)]
    pub gpu_pool: HashMap<i32, u64>,

    /// Maximum queue length per model before `Unavailable` is returned.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

/// Target for the profiler's load-generating client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerRunConfig {
    pub target_address: String,
    pub target_port: u16,

    /// Directory of input files, one per input tensor name (text file for
    /// string tensors). `None` means fabricate zero/random input.
    pub input_data_dir: Option<PathBuf>,
}

/// Observability configuration, shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9091
}

impl MultiServeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let config: MultiServeConfig = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration: the section matching `mode` must be present.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Scheduler => {
                if self.scheduler.is_none() {
                    return Err(Error::config("scheduler config required for scheduler mode"));
                }
            }
            Mode::Profiler => {
                if self.profiler.is_none() {
                    return Err(Error::config("profiler config required for profiler mode"));
                }
            }
        }
        Ok(())
    }

    pub fn metrics_port(&self) -> u16 {
        self.observability
            .as_ref()
            .map(|o| o.metrics_port)
            .unwrap_or_else(default_metrics_port)
    }
}

impl SchedulerConfig {
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl ProfilerRunConfig {
    pub fn target_endpoint(&self) -> String {
        format!("{}:{}", self.target_address, self.target_port)
    }
}

/// Convenience used when a caller needs a `Duration` from microseconds
/// stored in a model's `sequence_batching` block.
pub fn micros(us: u64) -> Duration {
    Duration::from_micros(us)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_model() -> ModelConfig {
        ModelConfig {
            name: "m".into(),
            platform: "mock".into(),
            max_batch_size: 8,
            input: vec![],
            output: vec![],
            dynamic_batching: None,
            sequence_batching: None,
            instance_group: vec![],
            ensemble_scheduling: None,
        }
    }

    #[test]
    fn validate_requires_scheduler_section_in_scheduler_mode() {
        let config = MultiServeConfig {
            mode: Mode::Scheduler,
            bind_address: "0.0.0.0".into(),
            port: 8001,
            scheduler: None,
            profiler: None,
            observability: None,
        };
        assert!(config.validate().is_err());

        let config = MultiServeConfig {
            scheduler: Some(SchedulerConfig {
                models: vec![minimal_model()],
                gpu_pool: HashMap::new(),
                queue_capacity: 1024,
            }),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn profiler_target_endpoint_joins_host_and_port() {
        let cfg = ProfilerRunConfig {
            target_address: "localhost".into(),
            target_port: 8001,
            input_data_dir: None,
        };
        assert_eq!(cfg.target_endpoint(), "localhost:8001");
    }
}
