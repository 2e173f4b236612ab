//! BLE peripheral engine for the support-frame grip simulator.
//!
//! [`peripheral::Peripheral`] composes the connection tracker, the advertising state machine
//! and the notification scheduler on top of an abstract [`transport::Transport`].

pub mod advertising;
pub mod config;
pub mod error;
pub mod peripheral;
pub mod scheduler;
pub mod sim;
pub mod tracker;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Recovers the guard from a poisoned mutex; no critical section leaves state half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
