//! Per-path mutual exclusion.
//!
//! Every read-modify-write sequence touching a path goes through [`PathLock::with_lock`].
//! Acquisition is non-blocking with a bounded number of retries; when the budget runs out
//! the caller gets `None` and should skip the operation rather than treat it as an error.
//! The lock is released by [`LockGuard`]'s `Drop`, so it is freed on every exit path,
//! including panics and dropped futures.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Retry budget for acquiring a path lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Set of currently held path keys. Cloning shares the same set.
#[derive(Clone, Default)]
pub struct PathLock {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Held lock on one key; releases on drop.
pub struct LockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

fn normalize_key(key: &str) -> String {
    key.trim_matches('/').to_string()
}

impl PathLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        let key = normalize_key(key);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(LockGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    /// Acquire with retries. Returns `None` once the retry budget is exhausted.
    pub async fn acquire(&self, key: &str, options: LockOptions) -> Option<LockGuard> {
        let mut attempt = 0;
        loop {
            if let Some(guard) = self.try_acquire(key) {
                return Some(guard);
            }
            if attempt >= options.max_retries {
                debug!("Lock on {} still held after {} retries, giving up", key, attempt);
                return None;
            }
            attempt += 1;
            tokio::time::sleep(options.retry_interval).await;
        }
    }

    /// Run `task` while holding the lock on `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, options: LockOptions, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key, options).await?;
        Some(task().await)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&normalize_key(key))
    }
}
