use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks a cache mutex, recovering the guard if a previous holder panicked.
///
/// Memory-tier state stays structurally valid across a panic because every
/// mutation completes before the guard is released.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another task",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}
