use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, warn};

use crate::errors::Error;

/// Process-wide mutual exclusion with a watchdog: holding the lock past
/// the timeout logs an error naming the holder so a wedged external
/// command surfaces in the logs instead of silently stalling every tick.
pub struct TimeoutLock {
    inner: Mutex<()>,
    timeout: Duration,
    label: &'static str,
}

impl TimeoutLock {
    pub const fn new(timeout: Duration, label: &'static str) -> Self {
        Self {
            inner: Mutex::new(()),
            timeout,
            label,
        }
    }

    pub fn lock(&self) -> TimeoutGuard<'_> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let released = Arc::new(AtomicBool::new(false));
        let watchdog = released.clone();
        let timeout = self.timeout;
        let label = self.label;
        thread::spawn(move || {
            thread::sleep(timeout);
            if !watchdog.load(Ordering::SeqCst) {
                error!(
                    label,
                    timeout_secs = timeout.as_secs(),
                    "lock: Lock held past watchdog timeout",
                );
            }
        });

        TimeoutGuard {
            _guard: guard,
            released,
        }
    }
}

pub struct TimeoutGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    released: Arc<AtomicBool>,
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Keyed mutual exclusion with expiry. A second acquire for a key that
/// is already held is rejected; a holder past the timeout is treated as
/// abandoned and stolen with a warning.
pub struct MultiTimeoutLock {
    held: Mutex<BTreeMap<String, Instant>>,
    timeout: Duration,
}

impl MultiTimeoutLock {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(BTreeMap::new()),
            timeout,
        }
    }

    pub fn try_lock(&self, key: &str) -> Result<MultiTimeoutGuard<'_>> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(since) = held.get(key) {
            if since.elapsed() < self.timeout {
                return Err(Error::Request(format!("lock: '{}' already held", key)).into());
            }
            warn!(key, "lock: Stealing expired lock");
        }

        held.insert(key.to_string(), Instant::now());
        Ok(MultiTimeoutGuard {
            lock: self,
            key: key.to_string(),
        })
    }
}

pub struct MultiTimeoutGuard<'a> {
    lock: &'a MultiTimeoutLock,
    key: String,
}

impl Drop for MultiTimeoutGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .lock
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_lock_reacquire() {
        let lock = TimeoutLock::new(Duration::from_secs(60), "test");
        drop(lock.lock());
        drop(lock.lock());
    }

    #[test]
    fn test_multi_lock_rejects_same_key() {
        let lock = MultiTimeoutLock::new(Duration::from_secs(60));
        let guard = lock.try_lock("store-a").unwrap();
        assert!(lock.try_lock("store-a").is_err());
        drop(guard);
        assert!(lock.try_lock("store-a").is_ok());
    }

    #[test]
    fn test_multi_lock_different_keys() {
        let lock = MultiTimeoutLock::new(Duration::from_secs(60));
        let _a = lock.try_lock("store-a").unwrap();
        let _b = lock.try_lock("store-b").unwrap();
    }

    #[test]
    fn test_multi_lock_steals_expired() {
        let lock = MultiTimeoutLock::new(Duration::from_millis(10));
        let _stale = lock.try_lock("store-a").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(lock.try_lock("store-a").is_ok());
    }
}
