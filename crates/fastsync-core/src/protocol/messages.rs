//! Typed payloads for the JSON half of the protocol.
//!
//! Outbound structs skip optional fields when unset; inbound structs default every
//! field so older servers that omit one still parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity sent right after authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub offline_sync_strategy: String,
}

/// One entity in a domain snapshot or a push.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapEntry {
    pub path: String,
    pub path_hash: String,
    pub content_hash: String,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_hash_missing: Option<bool>,
}

impl SnapEntry {
    /// Attach the last known fingerprint: present and different goes out as `baseHash`,
    /// absent goes out as `baseHashMissing: true`, equal is left off.
    pub fn with_base(mut self, base: Option<String>) -> Self {
        match base {
            Some(base) if base != self.content_hash => self.base_hash = Some(base),
            Some(_) => {}
            None => self.base_hash_missing = Some(true),
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathRef {
    pub path: String,
    pub path_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderEntry {
    pub path: String,
    pub path_hash: String,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoteSyncRequest {
    pub vault: String,
    pub last_time: i64,
    pub notes: Vec<SnapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_notes: Option<Vec<PathRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_notes: Option<Vec<PathRef>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileSyncRequest {
    pub vault: String,
    pub last_time: i64,
    pub files: Vec<SnapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_files: Option<Vec<PathRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_files: Option<Vec<PathRef>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingSyncRequest {
    pub vault: String,
    pub last_time: i64,
    pub settings: Vec<SnapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_settings: Option<Vec<PathRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_settings: Option<Vec<PathRef>>,
    /// No prior config epoch: the server should overwrite rather than merge
    pub cover: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderSyncRequest {
    pub vault: String,
    pub last_time: i64,
    pub folders: Vec<FolderEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_folders: Option<Vec<PathRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_folders: Option<Vec<PathRef>>,
}

/// `NoteModify` / `SettingModify`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModifyMessage {
    pub vault: String,
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub ctime: i64,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_hash_missing: Option<bool>,
}

/// `FileUploadCheck`: metadata only, bytes follow once the server opens a session.
impl ModifyMessage {
    /// Same base-hash rules as [`SnapEntry::with_base`].
    pub fn with_base(mut self, base: Option<String>) -> Self {
        match base {
            Some(base) if base != self.content_hash => self.base_hash = Some(base),
            Some(_) => {}
            None => self.base_hash_missing = Some(true),
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadCheckMessage {
    pub vault: String,
    #[serde(flatten)]
    pub entry: SnapEntry,
}

/// Delete, RePush and chunk-download requests: vault plus path identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathMessage {
    pub vault: String,
    pub path: String,
    pub path_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenameMessage {
    pub vault: String,
    pub path: String,
    pub path_hash: String,
    pub old_path: String,
    pub old_path_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderModifyMessage {
    pub vault: String,
    pub path: String,
    pub path_hash: String,
    pub ctime: i64,
    pub mtime: i64,
}

// ==================== Inbound ====================

/// `NoteSyncModify` / `SettingSyncModify`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteModify {
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
}

/// Delete and ask-to-push instructions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemotePath {
    pub path: String,
    pub path_hash: String,
    pub last_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteMtime {
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteRename {
    pub path: String,
    pub path_hash: String,
    pub old_path: String,
    pub old_path_hash: String,
    pub content_hash: String,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
}

/// `FileSyncUpdate`: a newer attachment exists on the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUpdate {
    pub path: String,
    pub path_hash: String,
    pub content_hash: String,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
}

/// `FileUpload`: the server opened an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSession {
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub session_id: String,
    pub chunk_size: usize,
}

/// `FileSyncChunkDownload`: chunk layout of an announced download.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkDownloadMeta {
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub session_id: String,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteFolder {
    pub path: String,
    pub path_hash: String,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
}

/// Instruction inlined into an end-of-domain summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineMessage {
    pub action: String,
    pub data: Value,
}

/// `*SyncEnd`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncEnd {
    pub last_time: i64,
    pub need_upload_count: u64,
    pub need_modify_count: u64,
    pub need_sync_mtime_count: u64,
    pub need_delete_count: u64,
    pub messages: Vec<InlineMessage>,
}

impl SyncEnd {
    pub fn total_tasks(&self) -> u64 {
        self.need_upload_count + self.need_modify_count + self.need_sync_mtime_count + self.need_delete_count
    }
}
