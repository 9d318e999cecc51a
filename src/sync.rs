//! Lock helpers shared by the barrier and machine internals.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a panicking thread poisoned it.
///
/// Continuation panics are caught before they unwind through any engine lock,
/// so poisoning only happens when a collaborator callback panics mid-update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
