//! Shared data-transfer types for MultiServe
//!
//! The wire protocol endpoint (request deserialization, the actual gRPC
//! service) is an external collaborator and out of scope here. This crate
//! only carries the shapes the scheduler and profiler crates need to agree
//! on: tensors, model identity, and model configuration options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tensor element type, as declared by a model's I/O metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Fp16,
    Fp32,
    Fp64,
    String,
}

/// A single named input or output tensor: raw bytes plus shape and dtype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorBytes {
    pub dtype: DataType,
    pub shape: Vec<i64>,
    pub bytes: Vec<u8>,
}

impl TensorBytes {
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Identifies a model and version, e.g. for stats aggregation across an
/// ensemble's composing models.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentifier {
    pub name: String,
    pub version: i64,
}

impl ModelIdentifier {
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// I/O tensor metadata declared by a model's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
    pub reshape: Option<Vec<i64>>,
}

/// `dynamic_batching` configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicBatchingConfig {
    pub preferred_batch_size: Vec<usize>,
    pub max_queue_delay_microseconds: u64,
}

/// `sequence_batching` configuration block. Presence marks a model stateful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceBatchingConfig {
    pub max_sequence_idle_microseconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceGroupConfig {
    pub kind: InstanceKind,
    pub count: usize,
    pub gpus: Vec<i32>,
}

/// The full set of recognized model configuration options (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub platform: String,
    pub max_batch_size: usize,
    pub input: Vec<IoSpec>,
    pub output: Vec<IoSpec>,
    pub dynamic_batching: Option<DynamicBatchingConfig>,
    pub sequence_batching: Option<SequenceBatchingConfig>,
    pub instance_group: Vec<InstanceGroupConfig>,
    pub ensemble_scheduling: Option<Vec<String>>,
}

impl ModelConfig {
    pub fn is_stateful(&self) -> bool {
        self.sequence_batching.is_some()
    }

    pub fn is_ensemble(&self) -> bool {
        self.ensemble_scheduling.is_some()
    }

    /// Preferred batch sizes, sorted ascending, deduped, filtered to those
    /// that fit within `max_batch_size`.
    pub fn preferred_batch_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .dynamic_batching
            .as_ref()
            .map(|b| {
                b.preferred_batch_size
                    .iter()
                    .copied()
                    .filter(|&b| self.max_batch_size == 0 || b <= self.max_batch_size)
                    .collect()
            })
            .unwrap_or_default();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    pub fn max_queue_delay(&self) -> std::time::Duration {
        self.dynamic_batching
            .as_ref()
            .map(|b| std::time::Duration::from_micros(b.max_queue_delay_microseconds))
            .unwrap_or_default()
    }
}

/// A decoded inference request's payload (everything but the completion
/// callback, which is runtime-specific and lives with the scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub model_name: String,
    pub model_version: i64,
    pub inputs: HashMap<String, TensorBytes>,
    pub correlation_id: Option<u64>,
    pub sequence_start: bool,
    pub sequence_end: bool,
}

/// A response batch slice returned to one caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub outputs: HashMap<String, TensorBytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_batch_sizes_are_sorted_deduped_and_filtered() {
        let cfg = ModelConfig {
            name: "m".into(),
            platform: "mock".into(),
            max_batch_size: 8,
            input: vec![],
            output: vec![],
            dynamic_batching: Some(DynamicBatchingConfig {
                preferred_batch_size: vec![8, 4, 4, 16],
                max_queue_delay_microseconds: 10_000,
            }),
            sequence_batching: None,
            instance_group: vec![],
            ensemble_scheduling: None,
        };

        assert_eq!(cfg.preferred_batch_sizes(), vec![4, 8]);
    }

    #[test]
    fn model_identifier_displays_name_and_version() {
        let id = ModelIdentifier::new("resnet50", 1);
        assert_eq!(id.to_string(), "resnet50:1");
    }
}
