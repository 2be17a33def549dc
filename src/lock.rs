use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
///
/// Every critical section in the crate is a short, synchronous state update, so a
/// poisoned lock still holds a usable value.
pub(crate) fn lock<'a, T>(
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
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another task",
                "Recovered from poisoned data-layer lock"
            );
            poisoned.into_inner()
        }
    }
}
