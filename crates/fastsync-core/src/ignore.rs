//! Transient path sets that keep self-inflicted writes from being re-synced.
//!
//! [`IgnoreSet`] holds paths the engine is writing right now; the live watcher drops events
//! for them. [`RecentlyDeleted`] remembers remote deletes for a short TTL so a racing local
//! delete detection doesn't report the same deletion back to the server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Paths currently being written by the sync engine itself.
#[derive(Clone, Default)]
pub struct IgnoreSet {
    paths: Arc<Mutex<HashSet<String>>>,
}

/// Marks a path ignored for as long as it is held.
pub struct IgnoreGuard {
    paths: Arc<Mutex<HashSet<String>>>,
    path: String,
    owned: bool,
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        if self.owned {
            self.paths
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.path);
        }
    }
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` ignored until the guard drops. A path that was already marked stays
    /// marked until its original holder lets go.
    pub fn mark(&self, path: &str) -> IgnoreGuard {
        let owned = self
            .paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
        IgnoreGuard {
            paths: Arc::clone(&self.paths),
            path: path.to_string(),
            owned,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Paths deleted on behalf of the server, remembered for `ttl`.
#[derive(Clone)]
pub struct RecentlyDeleted {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl RecentlyDeleted {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn insert(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, at| at.elapsed() < self.ttl);
        entries.insert(path.to_string(), Instant::now());
    }

    /// True while the entry is younger than the TTL.
    pub fn contains(&self, path: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(path)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn remove(&self, path: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }
}
