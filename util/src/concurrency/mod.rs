//! Threading primitives shared by the processors: cooperative interruption,
//! a delayed job timer, and a growable worker pool

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod interrupt;
pub mod pool;
pub mod timer;

/// A job run by a pool or timer thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lock a mutex, recovering the guard if a panicking thread poisoned it
///
/// The state guarded by the workspace's mutexes is never left half-updated by
/// a panic, so the poison flag carries no information
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extract a printable message from a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
