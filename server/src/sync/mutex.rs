//! Named TTL Mutex
//!
//! Advisory, TTL-bounded locks used to serialize shared-counter mutation and
//! to keep overlapping runs of the same logical job from doing double work.
//! Failing to acquire is an ordinary outcome: the caller assumes someone else
//! is already handling the job and skips.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

struct LockEntry {
    expires_at: Instant,
    token: u64,
}

#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
    next_token: Arc<AtomicU64>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the named lock. `None` means another holder owns it and
    /// its TTL has not yet elapsed.
    pub fn acquire(&self, name: &str, ttl: Duration) -> Option<LockHandle> {
        let mut locks = self.inner.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = locks.get(name) {
            if entry.expires_at > now {
                return None;
            }
        }

        let token = self.next_token.fetch_add(1, Relaxed);
        locks.insert(
            name.to_string(),
            LockEntry {
                expires_at: now + ttl,
                token,
            },
        );

        Some(LockHandle {
            registry: self.clone(),
            name: name.to_string(),
            token,
        })
    }

    /// Poll for the lock with a short sleep, up to `max_wait`.
    pub async fn acquire_wait(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Option<LockHandle> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(handle) = self.acquire(name, ttl) {
                return Some(handle);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        let locks = self.inner.lock().unwrap();
        locks
            .get(name)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn release(&self, name: &str, token: u64) {
        let mut locks = self.inner.lock().unwrap();
        // Only the handle that took the lock may drop it; after a TTL expiry
        // the name may already belong to someone else.
        if let Some(entry) = locks.get(name) {
            if entry.token == token {
                locks.remove(name);
            }
        }
    }
}

/// Releases the named lock on drop.
pub struct LockHandle {
    registry: LockRegistry,
    name: String,
    token: u64,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.token);
    }
}
