//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use fastsync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result, WriteTimes};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

/// Vault rooted at a local directory.
pub struct NativeFs {
    base_path: PathBuf,
}

fn map_io(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        ErrorKind::NotADirectory => FsError::NotDirectory(path.to_string()),
        ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

fn millis(time: std::io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn system_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            path.split('/').fold(self.base_path.clone(), |acc, part| acc.join(part))
        }
    }

    /// Only the modification time is applied; creation time is left to the platform.
    async fn apply_times(&self, path: &str, times: WriteTimes) -> Result<()> {
        let full_path = self.full_path(path);
        let owned = path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::options().write(true).open(&full_path)?;
            file.set_modified(system_time(times.mtime_millis))
        })
        .await
        .map_err(|e| FsError::Io(e.to_string()))?
        .map_err(|e| map_io(&owned, e))
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path)).await.map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8], times: Option<WriteTimes>) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io(path, e))?;
        }

        fs::write(&full_path, content).await.map_err(|e| map_io(path, e))?;
        match times {
            Some(times) => self.apply_times(path, times).await,
            None => Ok(()),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path)).await.map_err(|e| map_io(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .map_err(|e| map_io(path, e))?;
            entries.push(FileEntry { name, is_dir });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path).await.map_err(|e| map_io(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).await.map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&full_path).await.map_err(|e| map_io(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path)).await.map_err(|e| map_io(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path)).await.map_err(|e| map_io(path, e))?;

        Ok(FileStat {
            mtime_millis: millis(metadata.modified()).unwrap_or(0),
            ctime_millis: millis(metadata.created()),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path)).await.map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full_path(to);
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io(to, e))?;
        }
        fs::rename(self.full_path(from), target).await.map_err(|e| map_io(from, e))
    }

    async fn set_times(&self, path: &str, times: WriteTimes) -> Result<()> {
        self.apply_times(path, times).await
    }
}
