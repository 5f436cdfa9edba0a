//! Sync log persisted to `.fastsync/sync.log`.

use fastsync_core::sync_log::LogAppender;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub const LOG_FILE: &str = "sync.log";

/// Appends formatted log lines to a file, opening it lazily.
pub struct FileAppender {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileAppender {
    pub fn new(vault_path: &Path) -> Self {
        Self {
            path: vault_path.join(fastsync_core::entity::STATE_DIR).join(LOG_FILE),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl LogAppender for FileAppender {
    fn append(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if file.is_none() {
            match self.open() {
                Ok(opened) => *file = Some(opened),
                Err(e) => {
                    warn!("Cannot open {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(line.as_bytes()) {
                warn!("Cannot append to {}: {}", self.path.display(), e);
                *file = None;
            }
        }
    }

    fn clear(&self) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *file = None;
        if let Err(e) = File::create(&self.path) {
            warn!("Cannot truncate {}: {}", self.path.display(), e);
        }
    }
}
