//! Durable path ledgers.
//!
//! [`HashStore`] maps a path to the last fingerprint the engine pushed or applied
//! (for folders the fingerprint of the path itself serves as an existence marker).
//! [`FolderSnapshot`] maps a folder to the virtual mtime used for incremental cutoffs.
//!
//! Both keep the whole map in memory. Mutations only mark the map dirty; `flush` writes
//! it through the [`KvStore`] in one piece, so a burst of changes costs one serialization.
//! Storage keys carry the workspace id so several vaults can share one store.

use crate::kv::KvStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Which ledger a store holds. Selects the storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Config,
    Folder,
    FolderSnapshot,
}

impl StoreKind {
    fn key_prefix(self) -> &'static str {
        match self {
            StoreKind::File => "fastsync-file-hashes",
            StoreKind::Config => "fastsync-config-hashes",
            StoreKind::Folder => "fastsync-folder-hashes",
            StoreKind::FolderSnapshot => "fastsync-folder-snapshot",
        }
    }

    pub fn storage_key(self, workspace: &str) -> String {
        format!("{}-{}", self.key_prefix(), workspace)
    }
}

/// Last known state of one path.
///
/// `hash` and `synced_mtime` live in the same entry so they are always replaced together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedHash {
    pub hash: String,
    /// Server mtime of the last applied remote update, if the entry came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_mtime: Option<i64>,
}

impl TrackedHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            synced_mtime: None,
        }
    }

    pub fn synced(hash: impl Into<String>, mtime: i64) -> Self {
        Self {
            hash: hash.into(),
            synced_mtime: Some(mtime),
        }
    }
}

struct PersistentMap<V> {
    storage_key: String,
    kv: Arc<dyn KvStore>,
    entries: Mutex<HashMap<String, V>>,
    ready: AtomicBool,
    dirty: AtomicBool,
}

impl<V: Clone + Serialize + DeserializeOwned> PersistentMap<V> {
    fn new(storage_key: String, kv: Arc<dyn KvStore>) -> Self {
        Self {
            storage_key,
            kv,
            entries: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, V>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self) -> bool {
        let raw = match self.kv.get(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failed to read {}: {}", self.storage_key, e);
                return false;
            }
        };
        match serde_json::from_str::<HashMap<String, V>>(&raw) {
            Ok(map) => {
                debug!("Loaded {} entries from {}", map.len(), self.storage_key);
                *self.lock() = map;
                self.ready.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("Discarding corrupt {}: {}", self.storage_key, e);
                false
            }
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Write the map through the store if it changed since the last flush.
    fn flush(&self) -> bool {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return false;
        }
        let json = serde_json::to_string(&*self.lock()).map_err(crate::kv::KvError::from);
        let result = json.and_then(|json| self.kv.set(&self.storage_key, &json));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist {}: {}", self.storage_key, e);
                self.mark_dirty();
                false
            }
        }
    }

    fn get(&self, path: &str) -> Option<V> {
        self.lock().get(path).cloned()
    }

    fn insert(&self, path: &str, value: V) {
        let mut entries = self.lock();
        entries.insert(path.to_string(), value);
        self.mark_dirty();
    }

    fn remove(&self, path: &str) -> Option<V> {
        let mut entries = self.lock();
        let removed = entries.remove(path);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    fn rename(&self, from: &str, to: &str) -> bool {
        let mut entries = self.lock();
        match entries.remove(from) {
            Some(value) => {
                entries.insert(to.to_string(), value);
                self.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Re-key every entry at or below `from` to the same position under `to`.
    fn rename_prefix(&self, from: &str, to: &str) -> usize {
        let mut entries = self.lock();
        let prefix = format!("{}/", from);
        let moved: Vec<String> = entries
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in &moved {
            if let Some(value) = entries.remove(old) {
                let new_key = format!("{}{}", to, &old[from.len()..]);
                entries.insert(new_key, value);
            }
        }
        if !moved.is_empty() {
            self.mark_dirty();
        }
        moved.len()
    }

    fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn replace_all(&self, map: HashMap<String, V>) {
        let mut entries = self.lock();
        *entries = map;
        self.mark_dirty();
        self.ready.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.mark_dirty();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Persistent `path -> fingerprint` ledger.
pub struct HashStore {
    kind: StoreKind,
    map: PersistentMap<TrackedHash>,
}

impl HashStore {
    pub fn new(kind: StoreKind, workspace: &str, kv: Arc<dyn KvStore>) -> Self {
        Self {
            kind,
            map: PersistentMap::new(kind.storage_key(workspace), kv),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Load from durable storage. Returns false when nothing usable was stored,
    /// in which case the caller seeds the store with [`HashStore::rebuild`].
    pub fn load(&self) -> bool {
        self.map.load()
    }

    pub fn is_ready(&self) -> bool {
        self.map.ready.load(Ordering::SeqCst)
    }

    pub fn get(&self, path: &str) -> Option<TrackedHash> {
        self.map.get(path)
    }

    pub fn get_hash(&self, path: &str) -> Option<String> {
        self.map.get(path).map(|t| t.hash)
    }

    /// Record a locally pushed fingerprint.
    pub fn set_hash(&self, path: &str, hash: &str) {
        self.map.insert(path, TrackedHash::new(hash));
    }

    /// Record a remotely applied fingerprint together with its server mtime.
    pub fn record_synced(&self, path: &str, hash: &str, mtime: i64) {
        self.map.insert(path, TrackedHash::synced(hash, mtime));
    }

    /// Update only the synced mtime of an existing entry.
    pub fn set_synced_mtime(&self, path: &str, mtime: i64) -> bool {
        let mut entries = self.map.lock();
        let Some(entry) = entries.get_mut(path) else {
            return false;
        };
        entry.synced_mtime = Some(mtime);
        self.map.mark_dirty();
        true
    }

    pub fn remove_hash(&self, path: &str) {
        self.map.remove(path);
    }

    /// Move an entry to a new key. Returns false when `from` was untracked.
    pub fn rename(&self, from: &str, to: &str) -> bool {
        self.map.rename(from, to)
    }

    /// Move a folder's entries along with it. Returns how many entries moved.
    pub fn rename_prefix(&self, from: &str, to: &str) -> usize {
        self.map.rename_prefix(from, to)
    }

    pub fn get_all_paths(&self) -> Vec<String> {
        self.map.keys()
    }

    /// Replace every entry (initial seed or user-triggered repair) and mark ready.
    pub fn rebuild(&self, entries: impl IntoIterator<Item = (String, TrackedHash)>) {
        self.map.replace_all(entries.into_iter().collect());
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending changes. Returns true when something was written.
    pub fn flush(&self) -> bool {
        self.map.flush()
    }
}

/// Persistent `folder -> virtual mtime` map.
pub struct FolderSnapshot {
    map: PersistentMap<i64>,
}

impl FolderSnapshot {
    pub fn new(workspace: &str, kv: Arc<dyn KvStore>) -> Self {
        Self {
            map: PersistentMap::new(StoreKind::FolderSnapshot.storage_key(workspace), kv),
        }
    }

    pub fn load(&self) -> bool {
        self.map.load()
    }

    pub fn is_ready(&self) -> bool {
        self.map.ready.load(Ordering::SeqCst)
    }

    pub fn get_mtime(&self, path: &str) -> Option<i64> {
        self.map.get(path)
    }

    pub fn set_mtime(&self, path: &str, mtime: i64) {
        self.map.insert(path, mtime);
    }

    pub fn remove(&self, path: &str) {
        self.map.remove(path);
    }

    /// Move a folder and its descendants, stamping the folder itself with `mtime`.
    pub fn rename(&self, from: &str, to: &str, mtime: i64) {
        self.map.rename_prefix(from, to);
        self.map.insert(to, mtime);
    }

    pub fn rebuild(&self, entries: impl IntoIterator<Item = (String, i64)>) {
        self.map.replace_all(entries.into_iter().collect());
    }

    pub fn get_all_paths(&self) -> Vec<String> {
        self.map.keys()
    }

    pub fn flush(&self) -> bool {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn kv() -> Arc<MemoryKv> {
        Arc::new(MemoryKv::new())
    }

    /// Counts writes reaching the underlying store.
    #[derive(Default)]
    struct CountingKv {
        inner: MemoryKv,
        writes: std::sync::atomic::AtomicUsize,
    }

    impl KvStore for CountingKv {
        fn get(&self, key: &str) -> crate::kv::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> crate::kv::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> crate::kv::Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_storage_keys_are_scoped_by_workspace() {
        assert_ne!(
            StoreKind::File.storage_key("vault-a"),
            StoreKind::File.storage_key("vault-b")
        );
        assert_ne!(
            StoreKind::File.storage_key("vault-a"),
            StoreKind::Config.storage_key("vault-a")
        );
    }

    #[test]
    fn test_not_ready_until_loaded_or_rebuilt() {
        let store = HashStore::new(StoreKind::File, "ws", kv());
        assert!(!store.is_ready());
        assert!(!store.load());
        assert!(!store.is_ready());

        store.rebuild(vec![("a.md".to_string(), TrackedHash::new("1"))]);
        assert!(store.is_ready());
        assert_eq!(store.get_hash("a.md").as_deref(), Some("1"));
    }

    #[test]
    fn test_survives_reload() {
        let kv = kv();
        {
            let store = HashStore::new(StoreKind::File, "ws", kv.clone());
            store.rebuild(Vec::new());
            store.set_hash("a.md", "111");
            store.record_synced("b.png", "222", 1000);
            assert!(store.flush());
        }

        let store = HashStore::new(StoreKind::File, "ws", kv.clone());
        assert!(store.load());
        assert!(store.is_ready());
        assert_eq!(store.get_hash("a.md").as_deref(), Some("111"));
        assert_eq!(store.get("b.png"), Some(TrackedHash::synced("222", 1000)));

        let other = HashStore::new(StoreKind::File, "other", kv);
        assert!(!other.load());
    }

    #[test]
    fn test_mutations_are_written_once_per_flush() {
        let kv = Arc::new(CountingKv::default());
        let store = HashStore::new(StoreKind::File, "ws", kv.clone());
        for i in 0..1000 {
            store.set_hash(&format!("note-{}.md", i), "h");
        }
        store.remove_hash("note-0.md");
        store.rename_prefix("note-1.md", "moved.md");
        assert_eq!(kv.writes.load(Ordering::SeqCst), 0);

        assert!(store.flush());
        assert_eq!(kv.writes.load(Ordering::SeqCst), 1);
        assert!(!store.flush());
        assert_eq!(kv.writes.load(Ordering::SeqCst), 1);

        let reloaded = HashStore::new(StoreKind::File, "ws", kv.clone());
        assert!(reloaded.load());
        assert_eq!(reloaded.len(), 999);
        assert_eq!(reloaded.get_hash("moved.md").as_deref(), Some("h"));
    }

    #[test]
    fn test_rename_migrates_entry() {
        let store = HashStore::new(StoreKind::File, "ws", kv());
        store.set_hash("old.md", "5");

        assert!(store.rename("old.md", "new.md"));
        assert_eq!(store.get_hash("old.md"), None);
        assert_eq!(store.get_hash("new.md").as_deref(), Some("5"));
        assert!(!store.rename("missing.md", "x.md"));
    }

    #[test]
    fn test_rename_prefix_moves_descendants_only() {
        let store = HashStore::new(StoreKind::File, "ws", kv());
        store.set_hash("Projects/a.md", "1");
        store.set_hash("Projects/sub/b.md", "2");
        store.set_hash("ProjectsX/c.md", "3");

        assert_eq!(store.rename_prefix("Projects", "Archive"), 2);
        assert_eq!(store.get_hash("Archive/a.md").as_deref(), Some("1"));
        assert_eq!(store.get_hash("Archive/sub/b.md").as_deref(), Some("2"));
        assert_eq!(store.get_hash("ProjectsX/c.md").as_deref(), Some("3"));
    }

    #[test]
    fn test_set_synced_mtime_requires_entry() {
        let store = HashStore::new(StoreKind::File, "ws", kv());
        assert!(!store.set_synced_mtime("a.md", 10));
        store.set_hash("a.md", "1");
        assert!(store.set_synced_mtime("a.md", 10));
        assert_eq!(store.get("a.md"), Some(TrackedHash::synced("1", 10)));
    }

    #[test]
    fn test_corrupt_storage_is_ignored() {
        let kv = kv();
        kv.set(&StoreKind::Config.storage_key("ws"), "not json").unwrap();
        let store = HashStore::new(StoreKind::Config, "ws", kv);
        assert!(!store.load());
        assert!(store.is_empty());
    }

    #[test]
    fn test_folder_snapshot_roundtrip() {
        let kv = kv();
        let snapshot = FolderSnapshot::new("ws", kv.clone());
        snapshot.set_mtime("Projects", 42);
        snapshot.rename("Projects", "Archive", 50);
        assert!(snapshot.flush());

        let reloaded = FolderSnapshot::new("ws", kv);
        assert!(reloaded.load());
        assert_eq!(reloaded.get_mtime("Projects"), None);
        assert_eq!(reloaded.get_mtime("Archive"), Some(50));
    }
}
