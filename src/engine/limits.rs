// engine/limits.rs
//
// Concurrency limits: the per-disk mutex and the global transfer gate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Serialises backups per disk and gates concurrent transfer phases
/// globally. Jobs queue in `pending` while they wait on either.
pub struct ConcurrencyLimits {
    disk_locks: Mutex<HashMap<(String, i32), Arc<tokio::sync::Mutex<()>>>>,
    transfer_gate: Arc<Semaphore>,
}

impl ConcurrencyLimits {
    pub fn new(global_concurrency: usize) -> Self {
        Self {
            disk_locks: Mutex::new(HashMap::new()),
            transfer_gate: Arc::new(Semaphore::new(global_concurrency.max(1))),
        }
    }

    /// The mutex serialising backups of one disk.
    pub fn disk_lock(&self, context_id: &str, disk_ordinal: i32) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.disk_locks
                .lock()
                .entry((context_id.to_string(), disk_ordinal))
                .or_default(),
        )
    }

    /// The global transfer-phase gate.
    pub fn transfer_gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.transfer_gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_disk_serialises_different_disks_do_not() {
        let limits = ConcurrencyLimits::new(10);

        let lock_a1 = limits.disk_lock("ctx", 0);
        let lock_a2 = limits.disk_lock("ctx", 0);
        let lock_b = limits.disk_lock("ctx", 1);

        let guard = lock_a1.lock().await;
        assert!(lock_a2.try_lock().is_err(), "same disk must serialise");
        assert!(lock_b.try_lock().is_ok(), "other disks are independent");
        drop(guard);
        assert!(lock_a2.try_lock().is_ok());
    }

    #[tokio::test]
    async fn transfer_gate_bounds_concurrency() {
        let limits = ConcurrencyLimits::new(2);
        let gate = limits.transfer_gate();

        let first = gate.clone().acquire_owned().await.unwrap();
        let _second = gate.clone().acquire_owned().await.unwrap();
        assert_eq!(gate.available_permits(), 0);

        drop(first);
        assert_eq!(gate.available_permits(), 1);
    }
}
