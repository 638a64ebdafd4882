//! Backend interface consumed by the scheduler (spec section 6)
//!
//! A backend is one executable copy of a model on a device. Model loaders
//! and backend instances are polymorphic over `{Load, Run, Inputs, Outputs,
//! MaxBatchSize}` — variant behavior is expressed with a tag
//! (`BackendKind`) plus trait objects rather than an inheritance hierarchy
//! (spec section 9, "Polymorphism over backends").

use multiserve_common::error::{Error, Result};
use multiserve_proto::{IoSpec, ModelConfig, RequestPayload, ResponsePayload};
use std::fmt;

/// Distinguishes how a backend's declared I/O relates to what the model
/// actually exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The model's inputs/outputs are exactly the configured set.
    StaticIo,
    /// The model exposes a superset of potential I/O; configured I/O must
    /// be a subset (spec section 6, framework loader interface).
    PotentialIo,
    /// Dispatches to sub-models rather than executing directly.
    Ensemble,
}

/// One executable copy of a model, bound to a device.
///
/// `Run` is synchronous from the scheduler's perspective: the scheduler
/// hands a backend instance its own dedicated executor (a blocking task) and
/// waits for the call to return.
pub trait Backend: Send + Sync {
    /// 0 means batching is disabled; every dispatched batch then has size 1.
    fn max_batch_size(&self) -> usize;

    fn inputs(&self) -> &[IoSpec];
    fn outputs(&self) -> &[IoSpec];

    /// -1 for CPU.
    fn device_id(&self) -> i64;

    fn kind(&self) -> BackendKind;

    /// Execute a batch. The entire batch fails together on error; whether
    /// the error is fatal (instance should be removed) is reported via
    /// `is_fatal`.
    fn run(&self, batch: &[RequestPayload]) -> Result<Vec<ResponsePayload>>;
}

/// Marks an error from `Backend::run` as unrecoverable, causing the
/// scheduler to remove the owning instance instead of returning it to the
/// idle set (spec section 4.1, Failure semantics).
pub trait FatalError {
    fn is_fatal(&self) -> bool;
}

impl FatalError for Error {
    fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

/// Framework loader interface: `Load(path, ModelConfig) -> Backend|error`
/// (spec section 6).
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &str, config: &ModelConfig) -> Result<Box<dyn Backend>>;
}

/// Validates that `config`'s declared I/O is compatible with what the
/// model actually exposes.
///
/// For `PotentialIo` backends the model may declare a superset of I/O
/// larger than the config requires; per spec section 9's Open Question,
/// a dimension whose rank is unknown is skipped rather than rejected, but an
/// incompatible *known* rank is always a hard error. This deliberately
/// departs from the original loader, which swallowed all shape-comparison
/// failures with a bare `continue` (see DESIGN.md).
pub fn validate_io_compatibility(
    declared: &[IoSpec],
    exposed: &[IoSpec],
    kind: BackendKind,
) -> Result<()> {
    for io in declared {
        let found = exposed.iter().find(|e| e.name == io.name);
        let exposed_io = match found {
            Some(e) => e,
            None => {
                return Err(Error::invalid_argument(format!(
                    "input/output '{}' is not exposed by the model",
                    io.name
                )))
            }
        };

        if exposed_io.data_type != io.data_type {
            return Err(Error::invalid_argument(format!(
                "'{}' expects dtype {:?} but config declares {:?}",
                io.name, exposed_io.data_type, io.data_type
            )));
        }

        match kind {
            BackendKind::PotentialIo if exposed_io.dims.is_empty() => {
                // Rank unknown: tolerate, per the resolved Open Question.
                continue;
            }
            _ => {
                if !dims_compatible(&exposed_io.dims, &io.dims) {
                    return Err(Error::invalid_argument(format!(
                        "'{}' expects shape {:?} but config declares {:?}",
                        io.name, exposed_io.dims, io.dims
                    )));
                }
            }
        }
    }
    Ok(())
}

/// `-1` is a wildcard dimension that matches anything.
fn dims_compatible(model_dims: &[i64], config_dims: &[i64]) -> bool {
    if model_dims.len() != config_dims.len() {
        return false;
    }
    model_dims
        .iter()
        .zip(config_dims.iter())
        .all(|(&m, &c)| m == -1 || m == c)
}

/// A stand-in loader used when no real framework loader is wired in.
///
/// Framework loaders (the code that actually maps a model's on-disk
/// artifacts and a `ModelConfig` onto a runnable `Backend`) are an external
/// collaborator out of scope for this crate. `IdentityLoader` lets the
/// scheduler binary start up and run its dispatch loop end to end without
/// one: it produces a backend that copies each request's inputs straight to
/// its outputs, so the dynamic batching and sequencing logic can be
/// exercised against a real `ModelConfig` instead of only against tests.
pub struct IdentityLoader;

struct IdentityBackend {
    max_batch_size: usize,
    device_id: i64,
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
}

impl Backend for IdentityBackend {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[IoSpec] {
        &self.outputs
    }

    fn device_id(&self) -> i64 {
        self.device_id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::StaticIo
    }

    fn run(&self, batch: &[RequestPayload]) -> Result<Vec<ResponsePayload>> {
        Ok(batch
            .iter()
            .map(|r| ResponsePayload {
                outputs: r.inputs.clone(),
            })
            .collect())
    }
}

impl ModelLoader for IdentityLoader {
    fn load(&self, _path: &str, config: &ModelConfig) -> Result<Box<dyn Backend>> {
        validate_io_compatibility(&config.input, &config.input, BackendKind::StaticIo)?;
        Ok(Box::new(IdentityBackend {
            max_batch_size: config.max_batch_size,
            device_id: -1,
            inputs: config.input.clone(),
            outputs: config.output.clone(),
        }))
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backend(kind={:?}, device={}, max_batch={})",
            self.kind(),
            self.device_id(),
            self.max_batch_size()
        )
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// An in-memory backend used by scheduler tests: echoes inputs back as
    /// outputs and can be told to fail (optionally fatally).
    pub struct MockBackend {
        pub max_batch_size: usize,
        pub device_id: i64,
        pub inputs: Vec<IoSpec>,
        pub outputs: Vec<IoSpec>,
        pub fail_next: AtomicBool,
        pub fail_fatal: AtomicBool,
    }

    impl MockBackend {
        pub fn new(max_batch_size: usize) -> Self {
            Self {
                max_batch_size,
                device_id: -1,
                inputs: vec![],
                outputs: vec![],
                fail_next: AtomicBool::new(false),
                fail_fatal: AtomicBool::new(false),
            }
        }

        pub fn arm_failure(&self, fatal: bool) {
            self.fail_next.store(true, Ordering::SeqCst);
            self.fail_fatal.store(fatal, Ordering::SeqCst);
        }
    }

    impl Backend for MockBackend {
        fn max_batch_size(&self) -> usize {
            self.max_batch_size
        }

        fn inputs(&self) -> &[IoSpec] {
            &self.inputs
        }

        fn outputs(&self) -> &[IoSpec] {
            &self.outputs
        }

        fn device_id(&self) -> i64 {
            self.device_id
        }

        fn kind(&self) -> BackendKind {
            BackendKind::StaticIo
        }

        fn run(&self, batch: &[RequestPayload]) -> Result<Vec<ResponsePayload>> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                let msg = "backend run failed";
                return if self.fail_fatal.load(Ordering::SeqCst) {
                    Err(Error::internal(msg))
                } else {
                    Err(Error::unavailable(msg))
                };
            }

            Ok(batch
                .iter()
                .map(|r| ResponsePayload {
                    outputs: r.inputs.clone(),
                })
                .collect())
        }
    }

    #[test]
    fn dims_compatible_allows_wildcards() {
        assert!(dims_compatible(&[-1, 3], &[8, 3]));
        assert!(!dims_compatible(&[2, 3], &[8, 3]));
    }

    #[test]
    fn validate_io_compatibility_skips_unknown_rank_for_potential_io() {
        let declared = vec![IoSpec {
            name: "x".into(),
            data_type: multiserve_proto::DataType::Fp32,
            dims: vec![8],
            reshape: None,
        }];
        let exposed = vec![IoSpec {
            name: "x".into(),
            data_type: multiserve_proto::DataType::Fp32,
            dims: vec![],
            reshape: None,
        }];

        assert!(validate_io_compatibility(&declared, &exposed, BackendKind::PotentialIo).is_ok());
        assert!(validate_io_compatibility(&declared, &exposed, BackendKind::StaticIo).is_err());
    }

    #[test]
    fn validate_io_compatibility_rejects_known_incompatible_rank() {
        let declared = vec![IoSpec {
            name: "x".into(),
            data_type: multiserve_proto::DataType::Fp32,
            dims: vec![8],
            reshape: None,
        }];
        let exposed = vec![IoSpec {
            name: "x".into(),
            data_type: multiserve_proto::DataType::Fp32,
            dims: vec![4],
            reshape: None,
        }];

        assert!(validate_io_compatibility(&declared, &exposed, BackendKind::PotentialIo).is_err());
    }
}
