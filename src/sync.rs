//! Synchronization primitives that ignore lock poisoning.

use std::sync::MutexGuard;

/// A `std::sync::Mutex` that recovers the guard from a poisoned lock.
///
/// A panic while holding one of the pool locks leaves only plain old
/// data behind, which is still safe to observe.
#[derive(Debug, Default)]
pub(crate) struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(std::sync::Mutex::new(value))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|err| err.into_inner())
    }
}
