//! Poison-tolerant lock helpers.
//!
//! A panic while a guard is held poisons the lock. Every structure guarded
//! here is either an `Arc` pointer swapped in one step or state that is
//! valid between operations, so recovery takes the inner value, logs a
//! warning, and counts the event.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn record_poison(lock: &'static str) {
    tracing::warn!(lock, "Lock was poisoned, recovering");
    metrics::counter!("lock_poison_recovery_total", "lock" => lock).increment(1);
}

/// Acquires a mutex, recovering from poison.
pub fn acquire_lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            record_poison(name);
            poisoned.into_inner()
        },
    }
}

/// Tries to acquire a mutex without blocking.
///
/// Returns `None` only if another thread holds the lock.
pub fn try_acquire_lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> Option<MutexGuard<'a, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(std::sync::TryLockError::Poisoned(poisoned)) => {
            record_poison(name);
            Some(poisoned.into_inner())
        },
        Err(std::sync::TryLockError::WouldBlock) => None,
    }
}

/// Acquires a read guard, recovering from poison.
pub fn read_lock<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            record_poison(name);
            poisoned.into_inner()
        },
    }
}

/// Acquires a write guard, recovering from poison.
pub fn write_lock<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            record_poison(name);
            poisoned.into_inner()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    #[allow(clippy::panic)]
    fn test_acquire_recovers_poisoned_mutex() {
        let mutex = Arc::new(Mutex::new(7));
        let cloned = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*acquire_lock(&mutex, "test"), 7);
    }

    #[test]
    fn test_try_acquire_returns_none_when_held() {
        let mutex = Mutex::new(());
        let _held = mutex.lock().unwrap();
        assert!(try_acquire_lock(&mutex, "test").is_none());
    }

    #[test]
    fn test_rwlock_helpers() {
        let lock = RwLock::new(1);
        *write_lock(&lock, "test") += 1;
        assert_eq!(*read_lock(&lock, "test"), 2);
    }
}
