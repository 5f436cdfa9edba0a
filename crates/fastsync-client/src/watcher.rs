//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini, which reports paths without an event kind; the kind is
//! recovered from whether the path still exists.

use anyhow::Result;
use fastsync_core::LocalEvent;
use fastsync_core::entity::STATE_DIR;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File watcher that monitors the vault directory.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

/// Vault-relative, `/`-separated form of `path`.
fn relative(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Map one debounced path to an engine event.
///
/// The state dir is skipped. Config-dir paths become `Raw` so the config operator
/// decides what they are; other paths become `Created` when present and `Deleted` when gone.
pub fn classify_event(base: &Path, config_dir: &str, path: &Path, exists: bool, is_dir: bool) -> Option<LocalEvent> {
    let rel = relative(base, path)?;
    if rel == STATE_DIR || rel.starts_with(&format!("{}/", STATE_DIR)) {
        return None;
    }
    if rel == config_dir || rel.starts_with(&format!("{}/", config_dir)) {
        return Some(LocalEvent::Raw { path: rel });
    }
    Some(if exists {
        LocalEvent::Created { path: rel, is_dir }
    } else {
        LocalEvent::Deleted { path: rel }
    })
}

impl FileWatcher {
    /// Create a new file watcher for the vault.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(vault_path: PathBuf, config_dir: String) -> Result<Self> {
        // FSEvents reports canonical paths, so strip against the canonical root.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let base = vault_path.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let exists = event.path.exists();
                        let is_dir = event.path.is_dir();
                        let Some(local) = classify_event(&base, &config_dir, &event.path, exists, is_dir) else {
                            continue;
                        };
                        debug!("File event: {:?}", local);
                        if event_tx.send(local).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/vault")
    }

    #[test]
    fn test_existing_paths_are_created() {
        let event = classify_event(&base(), ".obsidian", Path::new("/vault/a/b.md"), true, false);
        assert_eq!(
            event,
            Some(LocalEvent::Created {
                path: "a/b.md".into(),
                is_dir: false
            })
        );
        let event = classify_event(&base(), ".obsidian", Path::new("/vault/dir"), true, true);
        assert_eq!(
            event,
            Some(LocalEvent::Created {
                path: "dir".into(),
                is_dir: true
            })
        );
    }

    #[test]
    fn test_missing_paths_are_deleted() {
        let event = classify_event(&base(), ".obsidian", Path::new("/vault/gone.png"), false, false);
        assert_eq!(event, Some(LocalEvent::Deleted { path: "gone.png".into() }));
    }

    #[test]
    fn test_config_paths_are_raw() {
        let event = classify_event(&base(), ".obsidian", Path::new("/vault/.obsidian/app.json"), true, false);
        assert_eq!(
            event,
            Some(LocalEvent::Raw {
                path: ".obsidian/app.json".into()
            })
        );
    }

    #[test]
    fn test_state_dir_and_root_are_skipped() {
        assert_eq!(
            classify_event(&base(), ".obsidian", Path::new("/vault/.fastsync/state.json"), true, false),
            None
        );
        assert_eq!(classify_event(&base(), ".obsidian", Path::new("/vault"), true, true), None);
        assert_eq!(classify_event(&base(), ".obsidian", Path::new("/elsewhere/x.md"), true, false), None);
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), ".obsidian".into()).unwrap();
        std::fs::write(watcher.vault_path().join("new.md"), "hi").unwrap();

        let expected = LocalEvent::Created {
            path: "new.md".into(),
            is_dir: false,
        };
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = watcher.event_rx().recv().await {
                if event == expected {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(found);
    }
}
