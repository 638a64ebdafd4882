//! Backend instance state machine (spec section 4.1)
//!
//! A `BackendInstance` wraps one loaded `Backend` together with the state
//! the scheduler needs to hand it work: `Idle -> Busy -> Idle`, or
//! `Busy -> Fatal` if the backend reports an unrecoverable error. A `Fatal`
//! instance never returns to the idle set.

use crate::backend::{Backend, FatalError};
use multiserve_common::{Error, Result};
use multiserve_proto::{RequestPayload, ResponsePayload};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Busy,
    Fatal,
}

/// One loaded backend, plus the bookkeeping the scheduler uses to pick
/// among instances and retire broken ones.
pub struct BackendInstance {
    pub id: u64,
    backend: Box<dyn Backend>,
    state: Mutex<InstanceState>,
    dispatch_count: AtomicU64,
}

impl BackendInstance {
    pub fn new(id: u64, backend: Box<dyn Backend>) -> Self {
        Self {
            id,
            backend,
            state: Mutex::new(InstanceState::Idle),
            dispatch_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn max_batch_size(&self) -> usize {
        self.backend.max_batch_size()
    }

    pub fn device_id(&self) -> i64 {
        self.backend.device_id()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    /// Attempts to move `Idle -> Busy`. Returns `false` if the instance was
    /// already busy or is fatal.
    pub fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if *state == InstanceState::Idle {
            *state = InstanceState::Busy;
            true
        } else {
            false
        }
    }

    /// Runs a batch on a claimed instance and settles its state: back to
    /// `Idle` on success or a non-fatal error, to `Fatal` on a fatal error.
    /// Panics if the instance was not claimed first, since that would mean
    /// the scheduler double-dispatched onto the same instance.
    pub fn run(&self, batch: &[RequestPayload]) -> Result<Vec<ResponsePayload>> {
        {
            let state = self.state.lock();
            assert_eq!(*state, InstanceState::Busy, "instance run without claim");
        }

        let result = self.backend.run(batch);
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        match &result {
            Ok(_) => *state = InstanceState::Idle,
            Err(e) if e.is_fatal() => *state = InstanceState::Fatal,
            Err(_) => *state = InstanceState::Idle,
        }
        result
    }
}

/// The set of instances loaded for a single model, grouped by device so the
/// scheduler can prefer locality when more than one instance is idle.
pub struct InstancePool {
    instances: Vec<Arc<BackendInstance>>,
}

impl InstancePool {
    pub fn new(instances: Vec<Arc<BackendInstance>>) -> Self {
        Self { instances }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns every non-fatal instance, idle ones first, claimed opportunistically.
    /// Removes instances observed as fatal from consideration for this call
    /// (the caller is responsible for pruning the pool separately).
    pub fn claim_any_idle(&self) -> Option<Arc<BackendInstance>> {
        self.instances
            .iter()
            .find(|inst| inst.try_claim())
            .cloned()
    }

    /// Claims the one instance bound to a sequence by ID. Unlike
    /// `claim_any_idle`, the caller already knows which instance it needs;
    /// this fails if that specific instance isn't idle (e.g. still running
    /// a previous member of the same sequence).
    pub fn claim_specific(&self, id: u64) -> Option<Arc<BackendInstance>> {
        self.instances
            .iter()
            .find(|inst| inst.id == id && inst.try_claim())
            .cloned()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.instances.iter().map(|i| i.id).collect()
    }

    pub fn non_fatal_ids(&self) -> Vec<u64> {
        self.instances
            .iter()
            .filter(|i| i.state() != InstanceState::Fatal)
            .map(|i| i.id)
            .collect()
    }

    /// Instances that are no longer usable.
    pub fn fatal_instances(&self) -> Vec<Arc<BackendInstance>> {
        self.instances
            .iter()
            .filter(|i| i.state() == InstanceState::Fatal)
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, id: u64) {
        self.instances.retain(|i| i.id != id);
    }

    pub fn all(&self) -> &[Arc<BackendInstance>] {
        &self.instances
    }

    pub fn is_fully_fatal(&self) -> bool {
        !self.instances.is_empty()
            && self.instances.iter().all(|i| i.state() == InstanceState::Fatal)
    }
}

pub fn no_instances_available_error(model: &str) -> Error {
    Error::unavailable(format!("no usable backend instance for model '{model}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::MockBackend;

    fn instance(id: u64, max_batch: usize) -> Arc<BackendInstance> {
        Arc::new(BackendInstance::new(id, Box::new(MockBackend::new(max_batch))))
    }

    #[test]
    fn claim_transitions_idle_to_busy_and_rejects_second_claim() {
        let inst = instance(1, 4);
        assert!(inst.try_claim());
        assert_eq!(inst.state(), InstanceState::Busy);
        assert!(!inst.try_claim());
    }

    #[test]
    fn run_returns_to_idle_on_success() {
        let inst = instance(1, 4);
        inst.try_claim();
        let batch = vec![RequestPayload {
            model_name: "m".into(),
            model_version: 1,
            inputs: Default::default(),
            correlation_id: None,
            sequence_start: true,
            sequence_end: true,
        }];
        inst.run(&batch).unwrap();
        assert_eq!(inst.state(), InstanceState::Idle);
        assert_eq!(inst.dispatch_count(), 1);
    }

    #[test]
    fn fatal_error_leaves_instance_fatal_permanently() {
        let backend = MockBackend::new(4);
        backend.arm_failure(true);
        let inst = Arc::new(BackendInstance::new(1, Box::new(backend)));
        inst.try_claim();
        let batch = vec![];
        assert!(inst.run(&batch).is_err());
        assert_eq!(inst.state(), InstanceState::Fatal);
        assert!(!inst.try_claim());
    }

    #[test]
    fn non_fatal_error_returns_to_idle() {
        let backend = MockBackend::new(4);
        backend.arm_failure(false);
        let inst = Arc::new(BackendInstance::new(1, Box::new(backend)));
        inst.try_claim();
        assert!(inst.run(&[]).is_err());
        assert_eq!(inst.state(), InstanceState::Idle);
    }

    #[test]
    fn pool_claims_only_idle_instances() {
        let a = instance(1, 4);
        let b = instance(2, 4);
        a.try_claim();
        let pool = InstancePool::new(vec![a.clone(), b.clone()]);
        let claimed = pool.claim_any_idle().unwrap();
        assert_eq!(claimed.id, 2);
    }

    #[test]
    fn pool_reports_fully_fatal() {
        let backend = MockBackend::new(4);
        backend.arm_failure(true);
        let inst = Arc::new(BackendInstance::new(1, Box::new(backend)));
        inst.try_claim();
        let _ = inst.run(&[]);
        let pool = InstancePool::new(vec![inst]);
        assert!(pool.is_fully_fatal());
    }
}
