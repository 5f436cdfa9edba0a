//! Client settings file.
//!
//! `SyncSettings` is read from `<vault>/.fastsync/settings.json` unless another path is
//! given. Missing files yield defaults; command-line values override file values.

use anyhow::{Context, Result, bail};
use fastsync_core::SyncSettings;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.json";

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub api_token: Option<String>,
    pub vault: Option<String>,
}

pub fn default_settings_path(vault_path: &Path) -> PathBuf {
    vault_path.join(fastsync_core::entity::STATE_DIR).join(SETTINGS_FILE)
}

pub fn load_settings(path: &Path, overrides: Overrides) -> Result<SyncSettings> {
    let mut settings = if path.exists() {
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
    } else {
        SyncSettings::default()
    };

    if let Some(url) = overrides.server_url {
        settings.server_url = url;
    }
    if let Some(token) = overrides.api_token {
        settings.api_token = token;
    }
    if let Some(vault) = overrides.vault {
        settings.vault = vault;
    }
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &SyncSettings) -> Result<()> {
    if settings.server_url.is_empty() {
        bail!("serverUrl is not set");
    }
    if !(settings.server_url.starts_with("ws://") || settings.server_url.starts_with("wss://")) {
        bail!("serverUrl must start with ws:// or wss://, got {}", settings.server_url);
    }
    if settings.api_token.is_empty() {
        bail!("apiToken is not set");
    }
    Ok(())
}

/// Websocket endpoint for the `attempt`-th connection.
pub fn sync_url(server_url: &str, attempt: u32) -> String {
    format!("{}/api/user/sync?count={}", server_url.trim_end_matches('/'), attempt)
}
