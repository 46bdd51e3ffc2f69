// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires the lock, recovering the guard if another thread panicked while holding it.
///
/// Operator state is only ever mutated in single steps, so a poisoned lock still guards
/// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
