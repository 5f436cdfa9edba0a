//! Markdown notes, pushed and applied as full text.

use super::{DomainOperator, SyncContext, apply_remote_delete, apply_remote_mtime, apply_remote_rename, apply_remote_text};
use crate::entity::Entity;
use crate::fingerprint::{fingerprint_text, path_hash};
use crate::protocol::Action;
use crate::protocol::messages::{ModifyMessage, RemoteModify, RemoteMtime, RemotePath, RemoteRename, RenameMessage};
use crate::settings::Domain;
use async_trait::async_trait;
use tracing::{debug, warn};

pub struct NoteOperator;

#[async_trait]
impl DomainOperator for NoteOperator {
    fn domain(&self) -> Domain {
        Domain::Note
    }

    async fn local_change(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping push of {}: path busy", path);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            debug!("{} vanished before push", path);
            return;
        };
        let content = local.text();
        let hash = fingerprint_text(&content);
        let base = ctx.file_hashes.get_hash(path);
        if event_sourced && base.as_deref() == Some(hash.as_str()) {
            debug!("{} unchanged since last sync", path);
            return;
        }

        let msg = ModifyMessage {
            vault: ctx.vault().to_string(),
            path: path.to_string(),
            path_hash: path_hash(path),
            content,
            content_hash: hash.clone(),
            ctime: local.ctime,
            mtime: local.mtime,
            ..Default::default()
        }
        .with_base(base);
        if ctx.send(Action::NoteModify, &msg, Some(path)).await.is_ok() {
            ctx.file_hashes.set_hash(path, &hash);
        }
    }

    async fn local_delete(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if ctx.recently_deleted.contains(path) {
            debug!("{} was deleted by the server", path);
            ctx.file_hashes.remove_hash(path);
            return;
        }
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping delete of {}: path busy", path);
            return;
        };
        if ctx.send(Action::NoteDelete, &ctx.path_message(path), Some(path)).await.is_ok() {
            ctx.file_hashes.remove_hash(path);
        }
    }

    async fn local_rename(&self, ctx: &SyncContext, old_path: &str, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping rename of {}: path busy", path);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            debug!("{} vanished before rename", path);
            return;
        };
        let hash = fingerprint_text(&local.text());
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
        if ctx.send(Action::NoteRename, &msg, Some(path)).await.is_ok() {
            ctx.file_hashes.rename(old_path, path);
            ctx.file_hashes.set_hash(path, &hash);
        }
    }
}

impl NoteOperator {
    pub async fn apply_modify(&self, ctx: &SyncContext, msg: &RemoteModify) {
        let entity = Entity::Note(msg.path.clone());
        if apply_remote_text(ctx, &entity, msg).await.applied() {
            ctx.advance_epoch(Domain::Note, msg.last_time);
        }
    }

    /// Server lacks the note or holds an older version: push it if it still exists.
    pub async fn need_push(&self, ctx: &SyncContext, msg: &RemotePath) {
        let entity = Entity::Note(msg.path.clone());
        if ctx.exists(&msg.path).await {
            self.local_change(ctx, &entity, false).await;
        } else {
            debug!("Server asked for {}, which no longer exists", msg.path);
        }
    }

    pub async fn apply_mtime(&self, ctx: &SyncContext, msg: &RemoteMtime) {
        apply_remote_mtime(ctx, &Entity::Note(msg.path.clone()), msg).await;
    }

    pub async fn apply_delete(&self, ctx: &SyncContext, msg: &RemotePath) {
        apply_remote_delete(ctx, &Entity::Note(msg.path.clone()), msg).await;
    }

    pub async fn apply_rename(&self, ctx: &SyncContext, msg: &RemoteRename) {
        let old = Entity::Note(msg.old_path.clone());
        let new = Entity::Note(msg.path.clone());
        apply_remote_rename(ctx, &old, &new, msg).await;
    }
}
