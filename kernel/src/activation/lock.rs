use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for the lock of `{store}`")]
    Timeout { store: String, waited: Duration },

    #[error("lock of `{0}` is not held")]
    NotHeld(String),
}

/// Mutual exclusion per store for version swaps.
///
/// In-memory locks use `Mutex` + `Condvar`; a deployment spanning several
/// controllers would back this with a leader lease.
pub trait StoreLock: Send + Sync {
    /// Acquire the store's lock, waiting at most `timeout`.
    fn acquire(&self, store: &str, timeout: Duration) -> Result<(), LockError>;

    fn release(&self, store: &str) -> Result<(), LockError>;
}

/// Holds a store lock until dropped.
pub struct StoreLease<'a> {
    lock: &'a dyn StoreLock,
    store: String,
}

impl<'a> StoreLease<'a> {
    pub fn acquire(lock: &'a dyn StoreLock, store: &str, timeout: Duration) -> Result<Self, LockError> {
        lock.acquire(store, timeout)?;
        Ok(Self {
            lock,
            store: store.to_string(),
        })
    }
}

impl Drop for StoreLease<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release(&self.store);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStoreLock {
    held: Mutex<HashSet<String>>,
    wake: Condvar,
}

impl InMemoryStoreLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreLock for InMemoryStoreLock {
    fn acquire(&self, store: &str, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while held.contains(store) {
            if self.wake.wait_until(&mut held, deadline).timed_out() && held.contains(store) {
                return Err(LockError::Timeout {
                    store: store.to_string(),
                    waited: timeout,
                });
            }
        }
        held.insert(store.to_string());
        Ok(())
    }

    fn release(&self, store: &str) -> Result<(), LockError> {
        if !self.held.lock().remove(store) {
            return Err(LockError::NotHeld(store.to_string()));
        }
        self.wake.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lease_releases_on_drop() {
        let lock = InMemoryStoreLock::new();
        {
            let _lease = StoreLease::acquire(&lock, "features", Duration::from_millis(10)).unwrap();
            let err = lock.acquire("features", Duration::from_millis(10)).unwrap_err();
            assert!(matches!(err, LockError::Timeout { .. }));
        }
        assert!(lock.acquire("features", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn stores_lock_independently() {
        let lock = InMemoryStoreLock::new();
        lock.acquire("a", Duration::from_millis(10)).unwrap();
        assert!(lock.acquire("b", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let lock = Arc::new(InMemoryStoreLock::new());
        lock.acquire("features", Duration::from_millis(10)).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire("features", Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        lock.release("features").unwrap();

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn releasing_unheld_lock_fails() {
        let lock = InMemoryStoreLock::new();
        assert_eq!(
            lock.release("features"),
            Err(LockError::NotHeld("features".into()))
        );
    }
}
