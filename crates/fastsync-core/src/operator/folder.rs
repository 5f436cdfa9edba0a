//! Folders. A folder's ledger hash is its path hash; its mtime is virtual and lives in
//! the folder snapshot.

use super::{DomainOperator, SyncContext};
use crate::entity::Entity;
use crate::fingerprint::path_hash;
use crate::fs::{FsError, now_millis};
use crate::protocol::Action;
use crate::protocol::messages::{FolderModifyMessage, RemoteFolder, RemoteMtime, RemotePath, RemoteRename, RenameMessage};
use crate::settings::Domain;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct FolderOperator;

/// Re-key a folder, its descendant folders and the files below it.
fn move_entries(ctx: &SyncContext, from: &str, to: &str, mtime: i64) {
    ctx.folder_hashes.rename_prefix(from, to);
    let prefix = format!("{}/", to);
    for path in ctx.folder_hashes.get_all_paths() {
        if path == to || path.starts_with(&prefix) {
            ctx.folder_hashes.set_hash(&path, &path_hash(&path));
        }
    }
    ctx.folder_hashes.set_hash(to, &path_hash(to));
    ctx.folder_snapshot.rename(from, to, mtime);
    ctx.file_hashes.rename_prefix(from, to);
}

fn track(ctx: &SyncContext, path: &str, mtime: i64) {
    ctx.folder_hashes.set_hash(path, &path_hash(path));
    ctx.folder_snapshot.set_mtime(path, mtime);
}

fn untrack(ctx: &SyncContext, path: &str) {
    ctx.folder_hashes.remove_hash(path);
    ctx.folder_snapshot.remove(path);
}

#[async_trait]
impl DomainOperator for FolderOperator {
    fn domain(&self) -> Domain {
        Domain::Folder
    }

    async fn local_change(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if event_sourced && ctx.folder_hashes.get_hash(path).is_some() {
            // Directory mtimes move whenever a child changes.
            return;
        }
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping push of folder {}: path busy", path);
            return;
        };
        if !ctx.exists(path).await {
            return;
        }
        let mtime = now_millis();
        let msg = FolderModifyMessage {
            vault: ctx.vault().to_string(),
            path: path.to_string(),
            path_hash: path_hash(path),
            ctime: 0,
            mtime,
        };
        if ctx.send(Action::FolderModify, &msg, Some(path)).await.is_ok() {
            track(ctx, path, mtime);
        }
    }

    async fn local_delete(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if ctx.recently_deleted.contains(path) {
            untrack(ctx, path);
            return;
        }
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping delete of folder {}: path busy", path);
            return;
        };
        if ctx.send(Action::FolderDelete, &ctx.path_message(path), Some(path)).await.is_ok() {
            untrack(ctx, path);
        }
    }

    async fn local_rename(&self, ctx: &SyncContext, old_path: &str, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        let Some(_guard) = ctx.locks.acquire(path, ctx.lock_options()).await else {
            warn!("Skipping rename of folder {}: path busy", path);
            return;
        };
        let mtime = now_millis();
        let msg = RenameMessage {
            vault: ctx.vault().to_string(),
            path: path.to_string(),
            path_hash: path_hash(path),
            old_path: old_path.to_string(),
            old_path_hash: path_hash(old_path),
            content_hash: None,
            ctime: 0,
            mtime,
            size: 0,
        };
        if ctx.send(Action::FolderRename, &msg, Some(path)).await.is_ok() {
            move_entries(ctx, old_path, path, mtime);
        }
    }
}

impl FolderOperator {
    pub async fn apply_modify(&self, ctx: &SyncContext, msg: &RemoteFolder) {
        let entity = Entity::Folder(msg.path.clone());
        if !ctx.admits_remote(&entity) {
            return;
        }
        let Some(_guard) = ctx.locks.acquire(&msg.path, ctx.lock_options()).await else {
            warn!("Skipping remote folder {}: path busy", msg.path);
            return;
        };
        let _ignore = ctx.ignored.mark(&msg.path);
        if !ctx.exists(&msg.path).await {
            if let Err(e) = ctx.fs.mkdir(&msg.path).await {
                warn!("Cannot create folder {}: {}", msg.path, e);
                return;
            }
        }
        track(ctx, &msg.path, msg.mtime);
        ctx.recently_deleted.remove(&msg.path);
        ctx.advance_epoch(Domain::Folder, msg.last_time);
    }

    pub async fn apply_mtime(&self, ctx: &SyncContext, msg: &RemoteMtime) {
        if !ctx.admits_remote(&Entity::Folder(msg.path.clone())) {
            return;
        }
        ctx.folder_snapshot.set_mtime(&msg.path, msg.mtime);
        ctx.advance_epoch(Domain::Folder, msg.last_time);
    }

    pub async fn apply_rename(&self, ctx: &SyncContext, msg: &RemoteRename) {
        if !ctx.admits_remote(&Entity::Folder(msg.path.clone())) {
            return;
        }
        let (old, new) = (msg.old_path.as_str(), msg.path.as_str());
        let options = ctx.lock_options();
        let Some(_new_guard) = ctx.locks.acquire(new, options).await else {
            warn!("Skipping remote folder rename to {}: path busy", new);
            return;
        };
        let Some(_old_guard) = ctx.locks.acquire(old, options).await else {
            warn!("Skipping remote folder rename from {}: path busy", old);
            return;
        };
        let _ignore_new = ctx.ignored.mark(new);
        let _ignore_old = ctx.ignored.mark(old);
        ctx.recently_deleted.insert(old);

        if ctx.exists(old).await {
            if ctx.exists(new).await {
                if let Err(e) = ctx.fs.delete(new).await {
                    warn!("Cannot replace folder {}: {}", new, e);
                    return;
                }
            }
            if let Err(e) = ctx.fs.rename(old, new).await {
                warn!("Cannot rename folder {} to {}: {}", old, new, e);
                return;
            }
            move_entries(ctx, old, new, msg.mtime);
        } else {
            if !ctx.exists(new).await {
                if let Err(e) = ctx.fs.mkdir(new).await {
                    warn!("Cannot create folder {}: {}", new, e);
                    return;
                }
            }
            untrack(ctx, old);
            track(ctx, new, msg.mtime);
        }
        ctx.advance_epoch(Domain::Folder, msg.last_time);
    }

    /// Deletes once the folder is empty, since the deletes of its children may still be
    /// arriving. Gives up after the configured timeout and leaves the folder in place.
    pub fn apply_delete(&self, ctx: &Arc<SyncContext>, msg: &RemotePath) {
        if !ctx.admits_remote(&Entity::Folder(msg.path.clone())) {
            return;
        }
        let deferred = ctx.defer();
        let ctx = Arc::clone(ctx);
        let msg = msg.clone();
        tokio::spawn(async move {
            let _deferred = deferred;
            if !wait_until_empty(&ctx, &msg.path).await {
                return;
            }
            let Some(_guard) = ctx.locks.acquire(&msg.path, ctx.lock_options()).await else {
                warn!("Skipping remote delete of folder {}: path busy", msg.path);
                return;
            };
            let _ignore = ctx.ignored.mark(&msg.path);
            ctx.recently_deleted.insert(&msg.path);
            match ctx.fs.delete(&msg.path).await {
                Ok(()) | Err(FsError::NotFound(_)) => {
                    untrack(&ctx, &msg.path);
                    ctx.advance_epoch(Domain::Folder, msg.last_time);
                }
                Err(e) => warn!("Cannot delete folder {}: {}", msg.path, e),
            }
        });
    }
}

/// True once `path` is empty or gone; false on timeout.
async fn wait_until_empty(ctx: &SyncContext, path: &str) -> bool {
    let started = Instant::now();
    loop {
        match ctx.fs.list(path).await {
            Ok(entries) if entries.is_empty() => return true,
            Ok(_) => {}
            Err(FsError::NotFound(_)) => return true,
            Err(e) => {
                warn!("Cannot list folder {}: {}", path, e);
                return false;
            }
        }
        if started.elapsed() >= ctx.timings.folder_empty_timeout {
            info!("Folder {} still has children, not deleting", path);
            return false;
        }
        debug!("Waiting for {} to empty", path);
        tokio::time::sleep(ctx.timings.folder_empty_poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use crate::fs::FileSystem;
    use std::time::Duration;

    fn remote_path(path: &str) -> RemotePath {
        RemotePath {
            path: path.into(),
            path_hash: path_hash(path),
            last_time: 5,
        }
    }

    #[tokio::test]
    async fn test_remote_folder_is_created_and_tracked() {
        let h = harness();
        FolderOperator
            .apply_modify(
                &h.ctx,
                &RemoteFolder {
                    path: "Projects/2024".into(),
                    mtime: 1234,
                    ..Default::default()
                },
            )
            .await;
        assert!(h.fs.stat("Projects/2024").await.unwrap().is_dir);
        assert_eq!(h.ctx.folder_hashes.get_hash("Projects/2024"), Some(path_hash("Projects/2024")));
        assert_eq!(h.ctx.folder_snapshot.get_mtime("Projects/2024"), Some(1234));
    }

    #[tokio::test]
    async fn test_local_folder_push_and_echo() {
        let h = harness();
        h.fs.mkdir("Inbox").await.unwrap();
        FolderOperator.local_change(&h.ctx, &Entity::Folder("Inbox".into()), true).await;
        FolderOperator.local_change(&h.ctx, &Entity::Folder("Inbox".into()), true).await;

        assert_eq!(h.conn.actions(), vec!["FolderModify"]);
        assert!(h.ctx.folder_snapshot.get_mtime("Inbox").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_for_children() {
        let h = harness();
        h.fs.write("Old/a.md", b"x", None).await.unwrap();
        h.ctx.folder_hashes.set_hash("Old", &path_hash("Old"));

        FolderOperator.apply_delete(&h.ctx, &remote_path("Old"));
        assert_eq!(h.ctx.deferred(), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.fs.exists("Old").await.unwrap());

        h.fs.delete("Old/a.md").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.fs.exists("Old").await.unwrap());
        assert_eq!(h.ctx.folder_hashes.get_hash("Old"), None);
        assert_eq!(h.ctx.deferred(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_gives_up_on_non_empty_folder() {
        let h = harness();
        h.fs.write("Keep/a.md", b"x", None).await.unwrap();

        FolderOperator.apply_delete(&h.ctx, &remote_path("Keep"));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(h.fs.exists("Keep/a.md").await.unwrap());
        assert_eq!(h.ctx.deferred(), 0);
    }

    #[tokio::test]
    async fn test_remote_rename_moves_children_and_ledger() {
        let h = harness();
        h.fs.write("A/sub/n.md", b"x", None).await.unwrap();
        h.ctx.folder_hashes.set_hash("A", &path_hash("A"));
        h.ctx.folder_hashes.set_hash("A/sub", &path_hash("A/sub"));
        h.ctx.file_hashes.set_hash("A/sub/n.md", "1");

        FolderOperator
            .apply_rename(
                &h.ctx,
                &RemoteRename {
                    path: "B".into(),
                    old_path: "A".into(),
                    mtime: 9,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(h.fs.read("B/sub/n.md").await.unwrap(), b"x");
        assert_eq!(h.ctx.folder_hashes.get_hash("B/sub"), Some(path_hash("B/sub")));
        assert_eq!(h.ctx.folder_hashes.get_hash("A"), None);
        assert_eq!(h.ctx.file_hashes.get_hash("B/sub/n.md").as_deref(), Some("1"));
        assert_eq!(h.ctx.folder_snapshot.get_mtime("B"), Some(9));
    }

    #[tokio::test]
    async fn test_remote_rename_of_missing_folder_creates_target() {
        let h = harness();
        FolderOperator
            .apply_rename(
                &h.ctx,
                &RemoteRename {
                    path: "New".into(),
                    old_path: "Gone".into(),
                    ..Default::default()
                },
            )
            .await;
        assert!(h.fs.exists("New").await.unwrap());
        assert!(h.conn.texts().is_empty());
    }
}
