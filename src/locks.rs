// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant mutex access.
//!
//! Transfer snapshots and the supervisor's process slot are shared with
//! spawned tasks. A panicking holder is logged and the guard recovered.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "deskbridge::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking holder. Recovering data."
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
        let lock = Arc::new(Mutex::new(String::from("slot")));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        assert_eq!(resilient_lock(&lock).as_str(), "slot");
    }
}
