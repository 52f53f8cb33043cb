//! Sandboxed snap execution.
//!
//! A host runs untrusted snaps in isolated sandboxes and talks to each one
//! over a handshaked, multiplexed message stream. Requests are admitted per
//! origin, routed to the snap's execution job, and served by the snap with
//! only the endowments its permission grant allows.

pub mod admission;
pub mod capability;
pub mod config;
pub mod error;
pub mod execution;
pub mod guest;
pub mod rpc;
pub mod runtime;
pub mod snap;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{ExecutionError, Result};

/// Locks a std mutex, ignoring poisoning. Guarded state stays consistent
/// across panics because no critical section is left half-done.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
