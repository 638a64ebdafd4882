//! MultiServe Scheduler
//!
//! Dynamic-batching request scheduler and backend lifecycle manager: a GPU
//! memory pool, per-model backend instance pools, a model scheduler per
//! model, and sequence routing for stateful models.

pub mod backend;
pub mod gpu_pool;
pub mod instance;
pub mod label;
pub mod scheduler;
pub mod sequence;

pub use backend::{Backend, BackendKind, IdentityLoader, ModelLoader};
pub use gpu_pool::GpuMemoryPool;
pub use instance::{BackendInstance, InstancePool, InstanceState};
pub use label::{FileLabelProvider, LabelProvider, LabelRegistry};
pub use scheduler::ModelScheduler;
pub use sequence::SequenceRouter;
