//! Key-value persistence in a JSON file.
//!
//! Values live in `.fastsync/state.json` within the vault directory. Changes stay in
//! memory until [`KvStore::flush`], which rewrites the whole map through a temp file and
//! a rename.

use fastsync_core::kv::{KvError, KvStore, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const STATE_FILE: &str = "state.json";

pub struct JsonFileKv {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    dirty: AtomicBool,
    /// Held while the file is rewritten
    writer: Mutex<()>,
}

impl JsonFileKv {
    /// Open the store under `<vault>/.fastsync`, loading existing values.
    pub fn open(vault_path: &Path) -> Self {
        let path = vault_path.join(fastsync_core::entity::STATE_DIR).join(STATE_FILE);
        let values = match Self::load(&path) {
            Ok(values) => values,
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
            dirty: AtomicBool::new(false),
            writer: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(path).map_err(|e| KvError::Storage(e.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| KvError::Storage(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|e| KvError::Storage(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| KvError::Storage(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for JsonFileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let contents = {
            let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*values)
        };
        let result = contents.map_err(KvError::from).and_then(|contents| self.save(&contents));
        match result {
            Ok(()) => {
                debug!("Wrote {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let kv = JsonFileKv::open(dir.path());
        kv.set("ws:epochs", "{\"note\":5}").unwrap();
        kv.set("ws:gone", "1").unwrap();
        kv.remove("ws:gone").unwrap();
        kv.flush().unwrap();

        let reopened = JsonFileKv::open(dir.path());
        assert_eq!(reopened.get("ws:epochs").unwrap().as_deref(), Some("{\"note\":5}"));
        assert_eq!(reopened.get("ws:gone").unwrap(), None);
        assert!(reopened.path().ends_with(".fastsync/state.json"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join(".fastsync");
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join(STATE_FILE), "not json").unwrap();

        let kv = JsonFileKv::open(dir.path());
        assert_eq!(kv.get("anything").unwrap(), None);
        kv.set("k", "v").unwrap();
        kv.flush().unwrap();
        assert_eq!(JsonFileKv::open(dir.path()).get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_changes_reach_disk_only_on_flush() {
        let dir = TempDir::new().unwrap();
        let kv = JsonFileKv::open(dir.path());
        for i in 0..500 {
            kv.set(&format!("k{}", i), "v").unwrap();
        }
        assert!(!kv.path().exists());
        assert_eq!(kv.get("k499").unwrap().as_deref(), Some("v"));

        kv.flush().unwrap();
        let written = fs::metadata(kv.path()).unwrap().modified().unwrap();
        kv.flush().unwrap();
        assert_eq!(fs::metadata(kv.path()).unwrap().modified().unwrap(), written);
        assert_eq!(JsonFileKv::open(dir.path()).get("k0").unwrap().as_deref(), Some("v"));
    }
}
