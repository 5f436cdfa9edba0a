//! Attachments: upload checks, chunked uploads and chunked downloads.

use super::{
    DomainOperator, SyncContext, already_applied, apply_remote_delete, apply_remote_mtime, apply_remote_rename,
};
use crate::chunk::{ChunkOutcome, CompletedDownload};
use crate::entity::Entity;
use crate::fingerprint::{fingerprint_bytes, path_hash};
use crate::fs::WriteTimes;
use crate::protocol::messages::{
    ChunkDownloadMeta, FileUpdate, RemoteMtime, RemotePath, RemoteRename, RenameMessage, SnapEntry, UploadCheckMessage,
    UploadSession,
};
use crate::protocol::{Action, ChunkFrame};
use crate::settings::Domain;
use crate::sync_log::{LogEntry, LogStatus, LogType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FileOperator;

#[async_trait]
impl DomainOperator for FileOperator {
    fn domain(&self) -> Domain {
        Domain::File
    }

    /// Ask the server whether it needs the bytes; it answers with `FileUpload` when it does.
    async fn local_change(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping upload check of {}: path busy", path);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            debug!("{} vanished before upload check", path);
            return;
        };
        let hash = fingerprint_bytes(&local.bytes);
        let base = ctx.file_hashes.get_hash(path);
        if event_sourced && base.as_deref() == Some(hash.as_str()) {
            debug!("{} unchanged since last sync", path);
            return;
        }
        let msg = UploadCheckMessage {
            vault: ctx.vault().to_string(),
            entry: SnapEntry {
                path: path.to_string(),
                path_hash: path_hash(path),
                content_hash: hash.clone(),
                mtime: local.mtime,
                ctime: local.ctime,
                size: local.size,
                ..Default::default()
            }
            .with_base(base),
        };
        if ctx.send(Action::FileUploadCheck, &msg, Some(path)).await.is_ok() {
            ctx.file_hashes.set_hash(path, &hash);
        }
    }

    /// Deleting a file mid-upload only cancels the upload.
    async fn local_delete(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if ctx.uploads.tracker().cancel(path) {
            info!("Cancelled upload of deleted {}", path);
            ctx.file_hashes.remove_hash(path);
            return;
        }
        if ctx.recently_deleted.contains(path) {
            debug!("{} was deleted by the server", path);
            ctx.file_hashes.remove_hash(path);
            return;
        }
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping delete of {}: path busy", path);
            return;
        };
        if ctx.send(Action::FileDelete, &ctx.path_message(path), Some(path)).await.is_ok() {
            ctx.file_hashes.remove_hash(path);
        }
    }

    /// Renaming mid-upload cancels the upload and pushes the file under its new name.
    async fn local_rename(&self, ctx: &SyncContext, old_path: &str, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if ctx.uploads.tracker().cancel(old_path) {
            info!("Cancelled upload of {}, re-pushing as {}", old_path, path);
            ctx.file_hashes.remove_hash(old_path);
            self.local_change(ctx, entity, false).await;
            return;
        }
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping rename of {}: path busy", path);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            debug!("{} vanished before rename", path);
            return;
        };
        let hash = fingerprint_bytes(&local.bytes);
        let msg = RenameMessage {
            vault: ctx.vault().to_string(),
            path: path.to_string(),
            path_hash: path_hash(path),
            old_path: old_path.to_string(),
            old_path_hash: path_hash(old_path),
            content_hash: Some(hash.clone()),
            ctime: local.ctime,
            mtime: local.mtime,
            size: local.size,
        };
        if ctx.send(Action::FileRename, &msg, Some(path)).await.is_ok() {
            ctx.file_hashes.rename(old_path, path);
            ctx.file_hashes.set_hash(path, &hash);
        }
    }
}

impl FileOperator {
    /// The server opened an upload session.
    pub fn start_upload(&self, ctx: &SyncContext, msg: &UploadSession) {
        let entity = Entity::Attachment(msg.path.clone());
        if !ctx.admits_remote(&entity) {
            return;
        }
        ctx.uploads.enqueue(&msg.path, &msg.path, &msg.session_id, msg.chunk_size);
    }

    pub async fn need_upload(&self, ctx: &SyncContext, msg: &RemotePath) {
        let entity = Entity::Attachment(msg.path.clone());
        if ctx.exists(&msg.path).await {
            self.local_change(ctx, &entity, false).await;
        } else {
            debug!("Server asked for {}, which no longer exists", msg.path);
        }
    }

    /// A newer version exists remotely. Registers the download before anything awaits,
    /// then requests the chunks once the receive buffer has room.
    pub fn announce_update(&self, ctx: &Arc<SyncContext>, msg: &FileUpdate) {
        let entity = Entity::Attachment(msg.path.clone());
        if !ctx.admits_remote(&entity) || already_applied(&ctx.file_hashes, &msg.path, &msg.content_hash, msg.mtime) {
            debug!("No download needed for {}", msg.path);
            ctx.cycle.complete_task(Domain::File);
            return;
        }
        ctx.downloads.announce(msg);
        let ctx = Arc::clone(ctx);
        let path = msg.path.clone();
        tokio::spawn(async move {
            ctx.downloads
                .wait_for_buffer_room(ctx.timings.download_buffer_ceiling, ctx.timings.download_buffer_poll)
                .await;
            let request = ctx.path_message(&path);
            if ctx.send(Action::FileChunkDownload, &request, Some(&path)).await.is_err() {
                debug!("Chunk request for {} not sent", path);
            }
        });
    }

    /// Chunk metadata for a download.
    pub async fn begin_download(&self, ctx: &SyncContext, msg: &ChunkDownloadMeta) {
        match ctx.downloads.promote(msg) {
            ChunkOutcome::Stored { total, .. } => {
                ctx.cycle.transfers.add_download(total as u64);
                ctx.log.add_or_update(
                    LogEntry::new(LogType::Receive, Action::FileSyncUpdate.as_str(), LogStatus::Pending)
                        .with_id(&msg.session_id)
                        .with_path(&msg.path)
                        .with_progress(0),
                );
            }
            ChunkOutcome::Complete(done) => self.finish_download(ctx, &msg.session_id, done).await,
            ChunkOutcome::Failed { path, reason } => self.fail_download(ctx, &msg.session_id, &path, &reason),
            ChunkOutcome::UnknownSession | ChunkOutcome::Ignored => {}
        }
    }

    /// One binary chunk frame (dispatch prefix already stripped).
    pub async fn accept_chunk(&self, ctx: &SyncContext, payload: &[u8]) {
        let frame = match ChunkFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed chunk frame: {}", e);
                return;
            }
        };
        let session_id = frame.session_id.to_string();
        match ctx.downloads.accept_chunk(frame.session_id, frame.index, frame.data) {
            ChunkOutcome::UnknownSession => debug!("Chunk for unknown session {}", session_id),
            ChunkOutcome::Ignored => {}
            ChunkOutcome::Stored { received, total } => {
                ctx.cycle.transfers.chunk_received();
                ctx.log.add_or_update(
                    LogEntry::new(LogType::Receive, Action::FileSyncUpdate.as_str(), LogStatus::Pending)
                        .with_id(&session_id)
                        .with_progress((received * 100 / total.max(1)) as u8),
                );
            }
            ChunkOutcome::Complete(done) => {
                ctx.cycle.transfers.chunk_received();
                self.finish_download(ctx, &session_id, done).await;
            }
            ChunkOutcome::Failed { path, reason } => {
                ctx.cycle.transfers.chunk_received();
                self.fail_download(ctx, &session_id, &path, &reason);
            }
        }
    }

    async fn finish_download(&self, ctx: &SyncContext, session_id: &str, done: CompletedDownload) {
        let written = self.write_download(ctx, &done).await;
        ctx.downloads.finish(&done);
        ctx.cycle.complete_task(Domain::File);
        let mut entry = LogEntry::new(LogType::Receive, Action::FileSyncUpdate.as_str(), LogStatus::Success)
            .with_id(session_id)
            .with_path(&done.path);
        if written {
            ctx.advance_epoch(Domain::File, done.last_time);
            info!("Downloaded {} ({} bytes)", done.path, done.content.len());
            entry = entry.with_progress(100);
        } else {
            entry.status = LogStatus::Error;
        }
        ctx.log.add_or_update(entry);
    }

    async fn write_download(&self, ctx: &SyncContext, done: &CompletedDownload) -> bool {
        let Some(_guard) = ctx.locks.acquire(&done.path, ctx.lock_options()).await else {
            warn!("Dropping download of {}: path busy", done.path);
            return false;
        };
        let _ignore = ctx.ignored.mark(&done.path);
        ctx.ensure_parent(&done.path).await;
        let times = WriteTimes::new(done.mtime, done.ctime);
        if let Err(e) = ctx.fs.write(&done.path, &done.content, Some(times)).await {
            warn!("Cannot write {}: {}", done.path, e);
            return false;
        }
        ctx.file_hashes
            .record_synced(&done.path, &fingerprint_bytes(&done.content), done.mtime);
        ctx.recently_deleted.remove(&done.path);
        true
    }

    fn fail_download(&self, ctx: &SyncContext, session_id: &str, path: &str, reason: &str) {
        warn!("Download of {} failed: {}", path, reason);
        ctx.cycle.complete_task(Domain::File);
        ctx.log.add_or_update(
            LogEntry::new(LogType::Receive, Action::FileSyncUpdate.as_str(), LogStatus::Error)
                .with_id(session_id)
                .with_path(path)
                .with_message(reason),
        );
    }

    pub async fn apply_delete(&self, ctx: &SyncContext, msg: &RemotePath) {
        if ctx.uploads.tracker().cancel(&msg.path) {
            info!("Cancelled upload of remotely deleted {}", msg.path);
        }
        apply_remote_delete(ctx, &Entity::Attachment(msg.path.clone()), msg).await;
    }

    pub async fn apply_mtime(&self, ctx: &SyncContext, msg: &RemoteMtime) {
        apply_remote_mtime(ctx, &Entity::Attachment(msg.path.clone()), msg).await;
    }

    pub async fn apply_rename(&self, ctx: &SyncContext, msg: &RemoteRename) {
        ctx.uploads.tracker().cancel(&msg.old_path);
        let old = Entity::Attachment(msg.old_path.clone());
        let new = Entity::Attachment(msg.path.clone());
        apply_remote_rename(ctx, &old, &new, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use crate::chunk::provisional_key;
    use crate::fs::FileSystem;
    use serde_json::json;
    use std::time::Duration;

    const SESSION: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn chunk(index: u32, data: &[u8]) -> Vec<u8> {
        let frame = ChunkFrame {
            session_id: SESSION,
            index,
            data,
        };
        frame.encode().unwrap()[2..].to_vec()
    }

    fn meta(path: &str, total_chunks: u32, size: u64) -> ChunkDownloadMeta {
        ChunkDownloadMeta {
            path: path.into(),
            session_id: SESSION.into(),
            chunk_size: 2,
            total_chunks,
            size,
            mtime: 4000,
            ctime: 3000,
        }
    }

    #[tokio::test]
    async fn test_change_sends_upload_check() {
        let h = harness();
        h.fs.write("img.png", &[1, 2, 3], None).await.unwrap();
        FileOperator.local_change(&h.ctx, &Entity::file("img.png"), false).await;

        let sent = h.conn.payloads(Action::FileUploadCheck);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["vault"], json!("v"));
        assert_eq!(sent[0]["size"], json!(3));
        assert_eq!(sent[0]["contentHash"], json!(fingerprint_bytes(&[1, 2, 3])));
    }

    #[tokio::test]
    async fn test_download_reassembles_and_writes_with_times() {
        let h = harness();
        h.ctx.cycle.begin(vec![Domain::File], false);
        FileOperator.announce_update(
            &h.ctx,
            &FileUpdate {
                path: "a/img.png".into(),
                last_time: 50,
                ..Default::default()
            },
        );
        assert!(h.ctx.downloads.contains(&provisional_key("a/img.png")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.conn.actions(), vec!["FileChunkDownload"]);

        FileOperator.begin_download(&h.ctx, &meta("a/img.png", 2, 4)).await;
        FileOperator.accept_chunk(&h.ctx, &chunk(1, b"cd")).await;
        assert!(!h.fs.exists("a/img.png").await.unwrap());
        FileOperator.accept_chunk(&h.ctx, &chunk(0, b"ab")).await;

        assert_eq!(h.fs.read("a/img.png").await.unwrap(), b"abcd");
        assert_eq!(h.fs.stat("a/img.png").await.unwrap().mtime_millis, 4000);
        assert_eq!(h.ctx.file_hashes.get("a/img.png").unwrap().synced_mtime, Some(4000));
        assert_eq!(h.ctx.downloads.active(), 0);
        assert_eq!(h.ctx.cycle.tasks(Domain::File).completed, 1);
        assert_eq!(h.ctx.cycle.transfers.snapshot().download_received, 2);
    }

    #[tokio::test]
    async fn test_size_mismatch_leaves_no_file() {
        let h = harness();
        FileOperator.begin_download(&h.ctx, &meta("img.png", 1, 10)).await;
        FileOperator.accept_chunk(&h.ctx, &chunk(0, b"ab")).await;
        assert!(!h.fs.exists("img.png").await.unwrap());
        assert!(h.ctx.downloads.is_empty());
    }

    #[tokio::test]
    async fn test_already_synced_update_is_not_downloaded() {
        let h = harness();
        h.ctx.file_hashes.record_synced("img.png", "h1", 10);
        FileOperator.announce_update(
            &h.ctx,
            &FileUpdate {
                path: "img.png".into(),
                content_hash: "h1".into(),
                mtime: 10,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.ctx.downloads.is_empty());
        assert!(h.conn.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_upload_cancels_without_delete_message() {
        let h = harness();
        h.fs.write("big.bin", &[0u8; 64], None).await.unwrap();
        h.conn.stall_after_binaries(1, usize::MAX);

        FileOperator.start_upload(
            &h.ctx,
            &UploadSession {
                path: "big.bin".into(),
                session_id: SESSION.into(),
                chunk_size: 8,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.conn.binaries().len(), 1);

        FileOperator.local_delete(&h.ctx, &Entity::file("big.bin"), false).await;
        h.conn.set_buffered(0);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.conn.binaries().len(), 1);
        assert!(!h.conn.actions().contains(&"FileDelete".to_string()));
        assert_eq!(h.ctx.uploads.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_during_upload_re_pushes_new_path() {
        let h = harness();
        h.fs.write("a.bin", &[0u8; 64], None).await.unwrap();
        h.conn.stall_after_binaries(1, usize::MAX);
        FileOperator.start_upload(
            &h.ctx,
            &UploadSession {
                path: "a.bin".into(),
                session_id: SESSION.into(),
                chunk_size: 8,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.fs.rename("a.bin", "b.bin").await.unwrap();
        h.conn.set_buffered(0);
        FileOperator.local_rename(&h.ctx, "a.bin", &Entity::file("b.bin"), false).await;

        let actions = h.conn.actions();
        assert!(!actions.contains(&"FileRename".to_string()));
        let checks = h.conn.payloads(Action::FileUploadCheck);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["path"], json!("b.bin"));
    }
}
