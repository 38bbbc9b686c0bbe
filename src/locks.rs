// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning.
//!
//! The status registry and the worker pool's tracking set are shared by
//! every worker. A panic inside one download job must not take the whole
//! manager down with it, so acquisition logs the poisoning and hands back
//! the guard anyway. The data behind these locks is plain bookkeeping
//! (progress counters, id sets) and stays usable after a panic.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modeldock::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking holder, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modeldock::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modeldock::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering"
            );
            poisoned.into_inner()
        }
    }
}
