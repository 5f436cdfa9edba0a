//! Bounded in-memory sync log with an append-only persisted tail.
//!
//! Entries are keyed by id so a transfer can be logged as pending and later updated in
//! place. Only new non-pending entries and pending -> terminal transitions reach the
//! [`LogAppender`]; progress updates stay in memory.

use crate::fs::now_millis;
use chrono::{Local, TimeZone};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Send,
    Receive,
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Note,
    Attachment,
    Config,
    Folder,
    Other,
}

impl LogCategory {
    pub fn for_action(action: &str) -> Self {
        if action.starts_with("Note") {
            LogCategory::Note
        } else if action.starts_with("File") {
            LogCategory::Attachment
        } else if action.starts_with("Setting") {
            LogCategory::Config
        } else if action.starts_with("Folder") {
            LogCategory::Folder
        } else {
            LogCategory::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: String,
    /// Milliseconds since epoch, fixed when the entry is first added
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: LogType,
    pub category: LogCategory,
    pub status: LogStatus,
    pub action: String,
    pub path: Option<String>,
    pub message: Option<String>,
    /// Transfer progress, 0-100
    pub progress: Option<u8>,
}

impl LogEntry {
    pub fn new(kind: LogType, action: impl Into<String>, status: LogStatus) -> Self {
        let action = action.into();
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            kind,
            category: LogCategory::for_action(&action),
            status,
            action,
            path: None,
            message: None,
            progress: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    /// One line of the persisted log, newline included.
    pub fn format_line(&self) -> String {
        let time = Local
            .timestamp_millis_opt(self.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let kind = format!("{:?}", self.kind).to_uppercase();
        let category = format!("{:?}", self.category).to_uppercase();
        let status = format!("{:?}", self.status).to_uppercase();
        let path = self
            .path
            .as_deref()
            .map(|p| format!(" [Path: {}]", p))
            .unwrap_or_default();
        let message = self
            .message
            .as_deref()
            .map(|m| format!(" [Msg: {}]", m.replace('\n', " ")))
            .unwrap_or_default();
        format!(
            "[{}] [{:<7}] [{:<12}] [{:<8}] {:<25}{}{}\n",
            time, kind, category, status, self.action, path, message
        )
    }
}

/// Destination of persisted log lines.
pub trait LogAppender: Send + Sync {
    fn append(&self, line: &str);

    /// Truncate the persisted log.
    fn clear(&self) {}
}

/// Discards everything.
pub struct NullAppender;

impl LogAppender for NullAppender {
    fn append(&self, _line: &str) {}
}

pub struct SyncLog {
    entries: Mutex<VecDeque<LogEntry>>,
    appender: Arc<dyn LogAppender>,
}

impl SyncLog {
    pub fn new(appender: Arc<dyn LogAppender>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            appender,
        }
    }

    /// Insert a new entry or update the one with the same id.
    pub fn add_or_update(&self, entry: LogEntry) {
        let persisted = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => {
                    let mut status = entry.status;
                    if existing.status != LogStatus::Pending && status == LogStatus::Pending {
                        status = existing.status;
                    }
                    let changed = existing.status != status;
                    let progress = match (existing.progress, entry.progress) {
                        (Some(old), Some(new)) => Some(old.max(new)),
                        (old, new) => new.or(old),
                    };
                    existing.kind = entry.kind;
                    existing.category = entry.category;
                    existing.action = entry.action;
                    existing.status = status;
                    existing.progress = progress;
                    if entry.path.is_some() {
                        existing.path = entry.path;
                    }
                    if entry.message.is_some() {
                        existing.message = entry.message;
                    }
                    (changed && status != LogStatus::Pending).then(|| existing.clone())
                }
                None => {
                    let persist = (entry.status != LogStatus::Pending).then(|| entry.clone());
                    entries.push_front(entry);
                    entries.truncate(MAX_ENTRIES);
                    persist
                }
            }
        };
        if let Some(entry) = persisted {
            self.appender.append(&entry.format_line());
        }
    }

    pub fn add(&self, kind: LogType, action: &str, status: LogStatus, path: Option<&str>, message: Option<&str>) {
        let mut entry = LogEntry::new(kind, action, status);
        entry.path = path.map(str::to_string);
        entry.message = message.map(str::to_string);
        self.add_or_update(entry);
    }

    /// Newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.appender.clear();
    }
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new(Arc::new(NullAppender))
    }
}
