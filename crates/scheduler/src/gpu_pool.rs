//! Process-wide GPU memory pool (spec section 4.3)
//!
//! Grounded on the original CUDA memory manager (`cnmemInit`, `cnmemMalloc`,
//! `cnmemFree`, `CNMEM_FLAGS_CANNOT_GROW`): one fixed-size arena per device,
//! created at most once for the life of the process, with the current CUDA
//! device saved and restored around every allocation so the pool never
//! leaves a caller's thread pointed at the wrong device.

use multiserve_common::{Error, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::OnceLock;

struct Arena {
    capacity: u64,
    used: u64,
}

impl Arena {
    fn alloc(&mut self, bytes: u64) -> Result<()> {
        let exhausted = self.used.checked_add(bytes).map_or(true, |total| total > self.capacity);
        if exhausted {
            return Err(Error::unavailable(format!(
                "gpu pool exhausted: requested {bytes} bytes, {} available",
                self.capacity - self.used
            )));
        }
        self.used += bytes;
        Ok(())
    }

    fn free(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// Fixed-size, non-growing memory pool spanning a set of devices.
///
/// Created once via [`GpuMemoryPool::create`]; every subsequent call to
/// `create` fails, matching `CNMEM_FLAGS_CANNOT_GROW` semantics applied to
/// the pool's own lifecycle rather than per-arena growth.
pub struct GpuMemoryPool {
    arenas: HashMap<i32, Mutex<Arena>>,
}

static INSTANCE: OnceLock<GpuMemoryPool> = OnceLock::new();

thread_local! {
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(-1) };
}

/// Restores the thread's current device on drop, including on an early
/// return via `?`. Mirrors the original's save/switch/restore pattern
/// around every `cudaMalloc`/`cudaFree` call.
struct DeviceGuard {
    previous: i32,
}

impl DeviceGuard {
    fn switch_to(device_id: i32) -> Self {
        let previous = CURRENT_DEVICE.with(|c| c.replace(device_id));
        Self { previous }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|c| c.set(self.previous));
    }
}

impl GpuMemoryPool {
    /// Creates the process-wide pool with one arena per `(device_id, bytes)`
    /// pair. Fails with `AlreadyExists` if a pool has already been created.
    pub fn create(per_device_bytes: HashMap<i32, u64>) -> Result<()> {
        let arenas = per_device_bytes
            .into_iter()
            .map(|(device, capacity)| (device, Mutex::new(Arena { capacity, used: 0 })))
            .collect();

        INSTANCE
            .set(GpuMemoryPool { arenas })
            .map_err(|_| Error::already_exists("gpu memory pool already created"))
    }

    /// Returns the process-wide pool, if `create` has been called.
    pub fn instance() -> Result<&'static GpuMemoryPool> {
        INSTANCE
            .get()
            .ok_or_else(|| Error::unavailable("gpu memory pool not initialized"))
    }

    /// Reserves `bytes` on `device_id`. Saves, switches to, and restores the
    /// calling thread's current device across the call, even on failure.
    pub fn alloc(&self, device_id: i32, bytes: u64) -> Result<()> {
        let _guard = DeviceGuard::switch_to(device_id);
        let arena = self
            .arenas
            .get(&device_id)
            .ok_or_else(|| Error::invalid_argument(format!("no gpu pool arena for device {device_id}")))?;
        arena.lock().alloc(bytes)
    }

    /// Releases `bytes` previously reserved on `device_id`.
    pub fn free(&self, device_id: i32, bytes: u64) {
        let _guard = DeviceGuard::switch_to(device_id);
        if let Some(arena) = self.arenas.get(&device_id) {
            arena.lock().free(bytes);
        }
    }

    pub fn capacity(&self, device_id: i32) -> Option<u64> {
        self.arenas.get(&device_id).map(|a| a.lock().capacity)
    }

    pub fn used(&self, device_id: i32) -> Option<u64> {
        self.arenas.get(&device_id).map(|a| a.lock().used)
    }
}

pub fn current_device() -> i32 {
    CURRENT_DEVICE.with(|c| c.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Tests share the process-wide OnceLock; initialize it exactly once
    // across this module's tests and assert only properties true for the
    // shared initial configuration.
    static INIT: Once = Once::new();

    fn ensure_pool() -> &'static GpuMemoryPool {
        INIT.call_once(|| {
            let mut devices = HashMap::new();
            devices.insert(0, 1024u64);
            devices.insert(1, 512u64);
            GpuMemoryPool::create(devices).unwrap();
        });
        GpuMemoryPool::instance().unwrap()
    }

    #[test]
    fn second_create_call_fails_with_already_exists() {
        let _pool = ensure_pool();
        let mut devices = HashMap::new();
        devices.insert(0, 1024u64);
        let err = GpuMemoryPool::create(devices).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn alloc_rejects_over_capacity_request() {
        let pool = ensure_pool();
        let before = pool.used(1).unwrap();
        assert!(pool.alloc(1, 10_000).is_err());
        assert_eq!(pool.used(1).unwrap(), before);
    }

    #[test]
    fn alloc_then_free_round_trips_usage() {
        let pool = ensure_pool();
        let before = pool.used(0).unwrap();
        pool.alloc(0, 64).unwrap();
        assert_eq!(pool.used(0).unwrap(), before + 64);
        pool.free(0, 64);
        assert_eq!(pool.used(0).unwrap(), before);
    }

    #[test]
    fn alloc_restores_current_device_on_failure() {
        let pool = ensure_pool();
        CURRENT_DEVICE.with(|c| c.set(7));
        let _ = pool.alloc(1, u64::MAX);
        assert_eq!(current_device(), 7);
    }

    #[test]
    fn unknown_device_is_invalid_argument() {
        let pool = ensure_pool();
        let err = pool.alloc(99, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
