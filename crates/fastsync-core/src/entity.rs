//! Classification of synchronizable units.
//!
//! A path is classified once, when an event or scan first sees it, and the resulting
//! [`Entity`] is carried through operators instead of re-sniffing the string.

use crate::settings::{Domain, SyncSettings};

/// Key prefix for host key-value items synced as configuration.
pub const VIRTUAL_PREFIX: &str = "_localStorage/";

/// Directory holding the client's own state inside the vault. Never synced.
pub const STATE_DIR: &str = ".fastsync";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    /// Markdown note, vault-relative path
    Note(String),
    /// Any other vault file
    Attachment(String),
    Folder(String),
    /// File inside the config directory, keyed relative to it
    ConfigFile(String),
    /// Host key-value item, keyed with [`VIRTUAL_PREFIX`]
    VirtualConfigItem(String),
}

impl Entity {
    /// Classify a vault-relative path. Returns `None` for the client state directory.
    pub fn classify(path: &str, is_dir: bool, config_dir: &str) -> Option<Entity> {
        let path = path.trim_matches('/');
        if path.is_empty() || path == STATE_DIR || path.starts_with(&format!("{}/", STATE_DIR)) {
            return None;
        }
        if path.starts_with(VIRTUAL_PREFIX) {
            return Some(Entity::VirtualConfigItem(path.to_string()));
        }
        if let Some(rel) = path.strip_prefix(config_dir).and_then(|r| r.strip_prefix('/')) {
            return (!is_dir).then(|| Entity::ConfigFile(rel.to_string()));
        }
        if path == config_dir {
            return None;
        }
        Some(if is_dir {
            Entity::Folder(path.to_string())
        } else if path.ends_with(".md") {
            Entity::Note(path.to_string())
        } else {
            Entity::Attachment(path.to_string())
        })
    }

    /// Classify a config key as it appears on the wire.
    pub fn config(key: &str) -> Entity {
        if key.starts_with(VIRTUAL_PREFIX) {
            Entity::VirtualConfigItem(key.to_string())
        } else {
            Entity::ConfigFile(key.trim_matches('/').to_string())
        }
    }

    /// Classify a vault file by name alone.
    pub fn file(path: &str) -> Entity {
        if path.ends_with(".md") {
            Entity::Note(path.to_string())
        } else {
            Entity::Attachment(path.to_string())
        }
    }

    /// Path used in protocol messages and ledger keys.
    pub fn path(&self) -> &str {
        match self {
            Entity::Note(p)
            | Entity::Attachment(p)
            | Entity::Folder(p)
            | Entity::ConfigFile(p)
            | Entity::VirtualConfigItem(p) => p,
        }
    }

    /// Location in the document store, if the entity lives there.
    pub fn storage_path(&self, config_dir: &str) -> Option<String> {
        match self {
            Entity::ConfigFile(rel) => Some(format!("{}/{}", config_dir, rel)),
            Entity::VirtualConfigItem(_) => None,
            other => Some(other.path().to_string()),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Entity::Note(_) => Domain::Note,
            Entity::Attachment(_) => Domain::File,
            Entity::Folder(_) => Domain::Folder,
            Entity::ConfigFile(_) | Entity::VirtualConfigItem(_) => Domain::Config,
        }
    }

    pub fn is_note(&self) -> bool {
        matches!(self, Entity::Note(_))
    }
}

/// Path prefix and extension exclusions.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    prefixes: Vec<String>,
    extensions: Vec<String>,
}

impl ExclusionRules {
    pub fn new(prefixes: &[String], extensions: &[String]) -> Self {
        Self {
            prefixes: prefixes
                .iter()
                .map(|p| p.trim().trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            extensions: extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Rules for vault entities (notes, attachments, folders).
    pub fn for_vault(settings: &SyncSettings) -> Self {
        Self::new(&settings.sync_exclude, &settings.sync_exclude_extensions)
    }

    /// Rules for config keys.
    pub fn for_config(settings: &SyncSettings) -> Self {
        Self::new(&settings.config_exclude, &[])
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        let by_prefix = self
            .prefixes
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p)));
        if by_prefix {
            return true;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((_, ext)) if !self.extensions.is_empty() => {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }
}
