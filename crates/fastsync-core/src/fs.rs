//! FileSystem trait abstraction over the host document store.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in fastsync-client) - Uses tokio::fs
//!
//! Paths are vault-relative with `/` separators. Timestamps are milliseconds since epoch.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid UTF-8 in {0}")]
    InvalidText(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: i64,
    /// Creation time, when the platform exposes one
    pub ctime_millis: Option<i64>,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Timestamps to apply to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTimes {
    pub mtime_millis: i64,
    pub ctime_millis: Option<i64>,
}

impl WriteTimes {
    pub fn new(mtime_millis: i64, ctime_millis: i64) -> Self {
        Self {
            mtime_millis,
            ctime_millis: (ctime_millis > 0).then_some(ctime_millis),
        }
    }
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read file contents as UTF-8 text
    async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|_| FsError::InvalidText(path.to_string()))
    }

    /// Write file contents (creates parent directories if needed), applying `times` when given
    async fn write(&self, path: &str, content: &[u8], times: Option<WriteTimes>) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file or directory. Fails if `to` already exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Apply timestamps to an existing file without touching its content
    async fn set_times(&self, path: &str, times: WriteTimes) -> Result<()>;
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Parent directory of a normalized path (`""` for top-level entries).
pub fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        None
    } else {
        match normalized.rfind('/') {
            Some(pos) => Some(normalized[..pos].to_string()),
            None => Some(String::new()),
        }
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    content: Vec<u8>,
    mtime: i64,
    ctime: i64,
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, MemFile>>,
    dirs: RwLock<HashSet<String>>,
    writes: AtomicUsize,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            writes: AtomicUsize::new(0),
        }
    }

    /// Set a specific mtime without counting a write
    pub fn set_mtime(&self, path: &str, mtime: i64) {
        let path = normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = files.get_mut(&path) {
            file.mtime = mtime;
        }
    }

    /// Number of `write` calls served so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn mkdir_all(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        let mut current = normalize_path(path);
        while !current.is_empty() {
            let parent = parent_path(&current).unwrap_or_default();
            dirs.insert(current);
            current = parent;
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        files.keys().any(|p| p.starts_with(&prefix)) || dirs.iter().any(|p| p.starts_with(&prefix))
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .map(|f| f.content.clone())
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8], times: Option<WriteTimes>) -> Result<()> {
        let path = normalize_path(path);
        if self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        if let Some(parent) = parent_path(&path) {
            self.mkdir_all(&parent);
        }

        let now = now_millis();
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let ctime = files.get(&path).map(|f| f.ctime).unwrap_or(now);
        let file = MemFile {
            content: content.to_vec(),
            mtime: times.map(|t| t.mtime_millis).unwrap_or(now),
            ctime: times.and_then(|t| t.ctime_millis).unwrap_or(ctime),
        };
        files.insert(path, file);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<FileEntry> = files
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|name| FileEntry {
                name: name.to_string(),
                is_dir: false,
            })
            .collect();
        entries.extend(
            dirs.iter()
                .filter(|d| !d.is_empty())
                .filter_map(|d| d.strip_prefix(&prefix))
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(|name| FileEntry {
                    name: name.to_string(),
                    is_dir: true,
                }),
        );
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);

        if self
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
            .is_some()
        {
            return Ok(());
        }

        if path.is_empty() || !self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Err(FsError::NotFound(path));
        }
        if self.has_children(&path) {
            return Err(FsError::NotEmpty(path));
        }
        self.dirs.write().unwrap_or_else(|e| e.into_inner()).remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let in_files = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&path);
        Ok(in_files || self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize_path(path);

        if let Some(file) = self.files.read().unwrap_or_else(|e| e.into_inner()).get(&path) {
            return Ok(FileStat {
                mtime_millis: file.mtime,
                ctime_millis: Some(file.ctime),
                size: file.content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                ctime_millis: None,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        if self.files.read().unwrap_or_else(|e| e.into_inner()).contains_key(&path) {
            return Err(FsError::NotDirectory(path));
        }
        self.mkdir_all(&path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        if self.exists(&to).await? {
            return Err(FsError::AlreadyExists(to));
        }
        if let Some(parent) = parent_path(&to) {
            self.mkdir_all(&parent);
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = files.remove(&from) {
            files.insert(to, file);
            return Ok(());
        }

        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        if !dirs.remove(&from) {
            return Err(FsError::NotFound(from));
        }
        let prefix = format!("{}/", from);
        let moved_files: Vec<String> = files.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
        for old in moved_files {
            if let Some(file) = files.remove(&old) {
                files.insert(format!("{}/{}", to, &old[prefix.len()..]), file);
            }
        }
        let moved_dirs: Vec<String> = dirs.iter().filter(|p| p.starts_with(&prefix)).cloned().collect();
        for old in moved_dirs {
            dirs.remove(&old);
            dirs.insert(format!("{}/{}", to, &old[prefix.len()..]));
        }
        dirs.insert(to);
        Ok(())
    }

    async fn set_times(&self, path: &str, times: WriteTimes) -> Result<()> {
        let path = normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let file = files.get_mut(&path).ok_or_else(|| FsError::NotFound(path.clone()))?;
        file.mtime = times.mtime_millis;
        if let Some(ctime) = times.ctime_millis {
            file.ctime = ctime;
        }
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows tests to keep a handle on the same filesystem the engine writes to
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8], times: Option<WriteTimes>) -> Result<()> {
        (**self).write(path, content, times).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn set_times(&self, path: &str, times: WriteTimes) -> Result<()> {
        (**self).set_times(path, times).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.txt", b"hello world", None).await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");
        assert_eq!(fs.read_text("test.txt").await.unwrap(), "hello world");

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
        assert_eq!(fs.write_count(), 1);
    }

    #[tokio::test]
    async fn test_write_applies_times() {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"x", Some(WriteTimes::new(1000, 500))).await.unwrap();

        let stat = fs.stat("a.md").await.unwrap();
        assert_eq!(stat.mtime_millis, 1000);
        assert_eq!(stat.ctime_millis, Some(500));
        assert_eq!(stat.size, 1);
    }

    #[tokio::test]
    async fn test_set_times_keeps_content() {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"x", None).await.unwrap();
        fs.set_times("a.md", WriteTimes::new(2000, 0)).await.unwrap();

        assert_eq!(fs.stat("a.md").await.unwrap().mtime_millis, 2000);
        assert_eq!(fs.read("a.md").await.unwrap(), b"x");
        assert_eq!(fs.write_count(), 1);
        assert!(matches!(fs.set_times("gone.md", WriteTimes::new(1, 0)).await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("a/b/c.txt", b"content", None).await.unwrap();
        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.txt");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty_dir() {
        let fs = InMemoryFs::new();
        fs.write("dir/file.md", b"x", None).await.unwrap();

        assert!(matches!(fs.delete("dir").await, Err(FsError::NotEmpty(_))));
        fs.delete("dir/file.md").await.unwrap();
        fs.delete("dir").await.unwrap();
        assert!(!fs.exists("dir").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_file_and_directory() {
        let fs = InMemoryFs::new();
        fs.write("old/a.md", b"a", None).await.unwrap();
        fs.write("old/sub/b.md", b"b", None).await.unwrap();

        fs.rename("old/a.md", "top.md").await.unwrap();
        assert_eq!(fs.read("top.md").await.unwrap(), b"a");

        fs.rename("old", "new").await.unwrap();
        assert!(!fs.exists("old").await.unwrap());
        assert_eq!(fs.read("new/sub/b.md").await.unwrap(), b"b");

        assert!(matches!(fs.rename("top.md", "new/sub/b.md").await, Err(FsError::AlreadyExists(_))));
    }
}
