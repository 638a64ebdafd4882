//! Sequence router for stateful models (spec section 4.2)
//!
//! Binds a correlation ID to the backend instance that is handling its
//! sequence, so every request in the sequence lands on the same instance.
//! A binding is created on a `sequence_start` request and released on
//! `sequence_end` or TTL expiry (`max_sequence_idle_microseconds`).

use multiserve_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Binding {
    instance_id: u64,
    last_active: Instant,
}

/// Routes correlation IDs to bound instances for one stateful model.
///
/// At any instant the binding is a function: a correlation ID maps to at
/// most one instance. Callers are expected to hold their own claim on the
/// named instance through `InstancePool`; this table only tracks the
/// assignment.
pub struct SequenceRouter {
    max_idle: Duration,
    bindings: Mutex<HashMap<u64, Binding>>,
}

impl SequenceRouter {
    pub fn new(max_idle: Duration) -> Self {
        Self {
            max_idle,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the instance bound to `correlation_id`, if any.
    pub fn lookup(&self, correlation_id: u64) -> Option<u64> {
        self.bindings
            .lock()
            .get(&correlation_id)
            .map(|b| b.instance_id)
    }

    /// Routes one request. `sequence_start` requests with no existing
    /// binding create one against `instance_id`; `sequence_start` requests
    /// that collide with a still-live binding are rejected, matching the
    /// dynamic sequence batcher's behavior of refusing to silently
    /// re-route an in-flight sequence. A request that is not a
    /// `sequence_start` and has no binding is rejected: a sequence can only
    /// be joined by starting it.
    pub fn route(
        &self,
        correlation_id: u64,
        sequence_start: bool,
        sequence_end: bool,
        assign_instance: impl FnOnce() -> Result<u64>,
    ) -> Result<u64> {
        let mut bindings = self.bindings.lock();

        if let Some(binding) = bindings.get_mut(&correlation_id) {
            binding.last_active = Instant::now();
            let instance_id = binding.instance_id;
            if sequence_end {
                bindings.remove(&correlation_id);
            }
            return Ok(instance_id);
        }

        if !sequence_start {
            return Err(Error::invalid_argument(format!(
                "correlation id {correlation_id} has no active sequence and is not a sequence start"
            )));
        }

        let instance_id = assign_instance()?;
        if !sequence_end {
            bindings.insert(
                correlation_id,
                Binding {
                    instance_id,
                    last_active: Instant::now(),
                },
            );
        }
        Ok(instance_id)
    }

    /// Drops bindings that have been idle longer than `max_idle`. Returns
    /// the correlation IDs evicted, so the caller can release their
    /// instance claims.
    pub fn evict_expired(&self) -> Vec<u64> {
        if self.max_idle.is_zero() {
            return Vec::new();
        }
        let mut bindings = self.bindings.lock();
        let now = Instant::now();
        let expired: Vec<u64> = bindings
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_active) > self.max_idle)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            bindings.remove(id);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Instance IDs currently reserved by a live binding.
    pub fn bound_instance_ids(&self) -> std::collections::HashSet<u64> {
        self.bindings.lock().values().map(|b| b.instance_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_creates_binding() {
        let router = SequenceRouter::new(Duration::from_secs(60));
        let instance = router.route(7, true, false, || Ok(42)).unwrap();
        assert_eq!(instance, 42);
        assert_eq!(router.lookup(7), Some(42));
    }

    #[test]
    fn subsequent_request_reuses_binding_without_reassigning() {
        let router = SequenceRouter::new(Duration::from_secs(60));
        router.route(7, true, false, || Ok(42)).unwrap();
        let instance = router.route(7, false, false, || panic!("should not reassign")).unwrap();
        assert_eq!(instance, 42);
    }

    #[test]
    fn sequence_end_releases_binding() {
        let router = SequenceRouter::new(Duration::from_secs(60));
        router.route(7, true, false, || Ok(42)).unwrap();
        router.route(7, false, true, || panic!("should not reassign")).unwrap();
        assert_eq!(router.lookup(7), None);
    }

    #[test]
    fn non_start_request_without_binding_is_rejected() {
        let router = SequenceRouter::new(Duration::from_secs(60));
        let err = router.route(7, false, false, || Ok(42)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn single_shot_sequence_does_not_persist_binding() {
        let router = SequenceRouter::new(Duration::from_secs(60));
        router.route(7, true, true, || Ok(42)).unwrap();
        assert_eq!(router.lookup(7), None);
    }

    #[test]
    fn expired_bindings_are_evicted() {
        let router = SequenceRouter::new(Duration::from_millis(1));
        router.route(7, true, false, || Ok(42)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let evicted = router.evict_expired();
        assert_eq!(evicted, vec![7]);
        assert_eq!(router.lookup(7), None);
    }
}
