// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! Every shared structure in reelpool (the pool membership, the content cache,
//! the download registry) sits behind a std lock. A panic inside one listener
//! or engine callback must not take the whole feed down with it, so these
//! helpers recover the guard from a poisoned lock and log the event instead of
//! propagating the panic.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use reelpool::locks::resilient_lock;
//!
//! let lock = Mutex::new(42);
//! let mut guard = resilient_lock(&lock);
//! *guard = 100;
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelpool::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking holder. Recovering data; \
                 state may be inconsistent."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelpool::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelpool::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_lock_normal() {
        let lock = Mutex::new(1);
        *resilient_lock(&lock) += 1;
        assert_eq!(*resilient_lock(&lock), 2);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        assert_eq!(*guard, 42);
        *guard = 7;
        drop(guard);
        assert_eq!(*resilient_lock(&lock), 7);
    }

    #[test]
    fn test_resilient_rwlock_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        *resilient_write(&lock) = 100;
        assert_eq!(*resilient_read(&lock), 100);
    }
}
