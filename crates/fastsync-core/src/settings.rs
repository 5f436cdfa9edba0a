//! Sync configuration and engine tuning.

use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Device class; constrained devices get fewer upload workers and longer yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

/// User-facing sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Websocket base URL, e.g. `wss://sync.example.com`
    pub server_url: String,
    pub api_token: String,
    /// Remote vault identifier
    pub vault: String,
    /// Namespace for local persistence; defaults to `vault` when empty
    pub workspace_id: String,
    pub sync_enabled: bool,
    pub config_sync_enabled: bool,
    /// Report paths that vanished while offline as deletions
    pub offline_delete_sync: bool,
    /// Attachments stay on the server; the file domain is not mirrored
    pub cloud_preview: bool,
    pub startup_delay_ms: u64,
    pub config_dir: String,
    pub config_exclude: Vec<String>,
    pub sync_exclude: Vec<String>,
    pub sync_exclude_extensions: Vec<String>,
    /// Extra directories under the config dir synced recursively
    pub config_sync_dirs: Vec<String>,
    pub client_name: String,
    pub device: DeviceClass,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_token: String::new(),
            vault: "defaultVault".to_string(),
            workspace_id: String::new(),
            sync_enabled: true,
            config_sync_enabled: false,
            offline_delete_sync: false,
            cloud_preview: false,
            startup_delay_ms: 500,
            config_dir: ".obsidian".to_string(),
            config_exclude: Vec::new(),
            sync_exclude: Vec::new(),
            sync_exclude_extensions: Vec::new(),
            config_sync_dirs: Vec::new(),
            client_name: String::new(),
            device: DeviceClass::Desktop,
        }
    }
}

impl SyncSettings {
    pub fn workspace(&self) -> &str {
        if self.workspace_id.is_empty() {
            &self.vault
        } else {
            &self.workspace_id
        }
    }

    /// Parse a newline separated exclusion list as typed into a settings text box.
    pub fn parse_rule_list(raw: &str) -> Vec<String> {
        raw.lines()
            .map(|l| l.trim().trim_matches('/'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Timeouts, limits and poll intervals.
#[derive(Debug, Clone)]
pub struct EngineTimings {
    pub lock_retries: u32,
    pub lock_retry_interval: Duration,
    pub completion_poll: Duration,
    pub backpressure_threshold: usize,
    pub backpressure_poll: Duration,
    pub download_buffer_ceiling: usize,
    pub download_buffer_poll: Duration,
    pub folder_empty_timeout: Duration,
    pub folder_empty_poll: Duration,
    pub store_ready_timeout: Duration,
    /// Longest a ledger change stays in memory only
    pub store_flush_interval: Duration,
    pub session_idle_timeout: Duration,
    pub recently_deleted_ttl: Duration,
    pub inline_message_yield: Duration,
    pub default_chunk_size: usize,
    pub upload_workers: usize,
    pub chunk_yield: Duration,
}

impl EngineTimings {
    pub fn for_device(device: DeviceClass) -> Self {
        let (upload_workers, chunk_yield) = match device {
            DeviceClass::Desktop => (3, Duration::ZERO),
            DeviceClass::Mobile => (1, Duration::from_millis(20)),
        };
        Self {
            lock_retries: 10,
            lock_retry_interval: Duration::from_millis(50),
            completion_poll: Duration::from_millis(100),
            backpressure_threshold: 5 * 1024 * 1024,
            backpressure_poll: Duration::from_millis(50),
            download_buffer_ceiling: 20 * 1024 * 1024,
            download_buffer_poll: Duration::from_millis(50),
            folder_empty_timeout: Duration::from_secs(10),
            folder_empty_poll: Duration::from_millis(100),
            store_ready_timeout: Duration::from_secs(30),
            store_flush_interval: Duration::from_secs(2),
            session_idle_timeout: Duration::from_secs(60),
            recently_deleted_ttl: Duration::from_secs(5),
            inline_message_yield: Duration::from_millis(1),
            default_chunk_size: 1024 * 1024,
            upload_workers,
            chunk_yield,
        }
    }
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self::for_device(DeviceClass::Desktop)
    }
}

/// The four sync streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Note,
    File,
    Config,
    Folder,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Note, Domain::File, Domain::Config, Domain::Folder];
}

/// Server epochs (`lastTime`) per domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncEpochs {
    pub note: i64,
    pub file: i64,
    pub config: i64,
    pub folder: i64,
}

impl SyncEpochs {
    pub fn get(&self, domain: Domain) -> i64 {
        match domain {
            Domain::Note => self.note,
            Domain::File => self.file,
            Domain::Config => self.config,
            Domain::Folder => self.folder,
        }
    }

    fn slot(&mut self, domain: Domain) -> &mut i64 {
        match domain {
            Domain::Note => &mut self.note,
            Domain::File => &mut self.file,
            Domain::Config => &mut self.config,
            Domain::Folder => &mut self.folder,
        }
    }
}

/// Epochs kept in memory and mirrored to the key-value store.
pub struct EpochStore {
    key: String,
    kv: Arc<dyn KvStore>,
    epochs: Mutex<SyncEpochs>,
}

impl EpochStore {
    pub fn load(workspace: &str, kv: Arc<dyn KvStore>) -> Self {
        let key = format!("fastsync-sync-epochs-{}", workspace);
        let epochs = match kv.get(&key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring unreadable sync epochs: {}", e);
                SyncEpochs::default()
            }),
            Ok(None) => SyncEpochs::default(),
            Err(e) => {
                warn!("Failed to read sync epochs: {}", e);
                SyncEpochs::default()
            }
        };
        Self {
            key,
            kv,
            epochs: Mutex::new(epochs),
        }
    }

    pub fn snapshot(&self) -> SyncEpochs {
        *self.epochs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, domain: Domain) -> i64 {
        self.snapshot().get(domain)
    }

    /// Move the epoch forward; older values are ignored.
    pub fn advance(&self, domain: Domain, epoch: i64) {
        let mut epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        let slot = epochs.slot(domain);
        if epoch > *slot {
            *slot = epoch;
            self.persist(&epochs);
        }
    }

    /// Overwrite the epoch (end-of-cycle commit or remote wipe).
    pub fn set(&self, domain: Domain, epoch: i64) {
        let mut epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        *epochs.slot(domain) = epoch;
        self.persist(&epochs);
    }

    fn persist(&self, epochs: &SyncEpochs) {
        let result = serde_json::to_string(epochs)
            .map_err(crate::kv::KvError::from)
            .and_then(|json| self.kv.set(&self.key, &json));
        if let Err(e) = result {
            warn!("Failed to persist sync epochs: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: SyncSettings =
            serde_json::from_str(r#"{"serverUrl":"ws://localhost:9000","apiToken":"t"}"#).unwrap();
        assert_eq!(settings.vault, "defaultVault");
        assert_eq!(settings.startup_delay_ms, 500);
        assert_eq!(settings.config_dir, ".obsidian");
        assert_eq!(settings.workspace(), "defaultVault");
        assert!(settings.sync_enabled);
    }

    #[test]
    fn test_parse_rule_list() {
        let rules = SyncSettings::parse_rule_list("plugins/big\n\n  /themes/  \nhotkeys.json");
        assert_eq!(rules, vec!["plugins/big", "themes", "hotkeys.json"]);
    }

    #[test]
    fn test_mobile_timings_are_stricter() {
        let mobile = EngineTimings::for_device(DeviceClass::Mobile);
        let desktop = EngineTimings::for_device(DeviceClass::Desktop);
        assert!(mobile.upload_workers < desktop.upload_workers);
        assert!(mobile.chunk_yield > desktop.chunk_yield);
    }

    #[test]
    fn test_epochs_advance_only_forward_and_persist() {
        let kv = Arc::new(MemoryKv::new());
        let epochs = EpochStore::load("ws", kv.clone());
        epochs.advance(Domain::Note, 100);
        epochs.advance(Domain::Note, 50);
        assert_eq!(epochs.get(Domain::Note), 100);

        epochs.set(Domain::Config, 0);
        let reloaded = EpochStore::load("ws", kv);
        assert_eq!(reloaded.get(Domain::Note), 100);
        assert_eq!(reloaded.get(Domain::File), 0);
    }
}
