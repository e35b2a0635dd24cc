pub mod chat;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod errors;
pub mod health;
pub mod observers;
pub mod recovery;
pub mod requests;
pub mod services;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
/// Every critical section in the core leaves the data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
