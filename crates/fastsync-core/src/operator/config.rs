//! Configuration files under the config directory, plus host virtual items.

use super::{
    DomainOperator, RemoteWrite, SyncContext, already_applied, apply_remote_delete, apply_remote_mtime,
    apply_remote_rename, apply_remote_text,
};
use crate::entity::Entity;
use crate::events::SyncEvent;
use crate::fingerprint::{fingerprint_text, path_hash};
use crate::fs::join_path;
use crate::protocol::Action;
use crate::protocol::messages::{ModifyMessage, RemoteModify, RemoteMtime, RemotePath, RemoteRename, RenameMessage};
use crate::settings::Domain;
use crate::virtual_items::{virtual_key, virtual_path};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Config subdirectories whose empty children are pruned after remote deletes.
const PRUNED_DIRS: [&str; 2] = ["plugins", "themes"];

pub struct ConfigOperator;

#[async_trait]
impl DomainOperator for ConfigOperator {
    fn domain(&self) -> Domain {
        Domain::Config
    }

    async fn local_change(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let key = ctx.lock_key(entity);
        let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
            warn!("Skipping push of {}: path busy", key);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            debug!("{} missing, nothing to push", key);
            return;
        };
        let path = entity.path();
        let content = local.text();
        let hash = fingerprint_text(&content);
        let base = ctx.config_hashes.get_hash(path);
        if event_sourced && base.as_deref() == Some(hash.as_str()) {
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
        if ctx.send(Action::SettingModify, &msg, Some(path)).await.is_ok() {
            ctx.config_hashes.set_hash(path, &hash);
        }
    }

    async fn local_delete(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let path = entity.path();
        if ctx.recently_deleted.contains(path) {
            ctx.config_hashes.remove_hash(path);
            return;
        }
        let key = ctx.lock_key(entity);
        let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
            warn!("Skipping delete of {}: path busy", key);
            return;
        };
        if ctx.send(Action::SettingDelete, &ctx.path_message(path), Some(path)).await.is_ok() {
            ctx.config_hashes.remove_hash(path);
        }
    }

    async fn local_rename(&self, ctx: &SyncContext, old_path: &str, entity: &Entity, event_sourced: bool) {
        if !ctx.admits_local(entity, event_sourced) {
            return;
        }
        let key = ctx.lock_key(entity);
        let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
            warn!("Skipping rename of {}: path busy", key);
            return;
        };
        let Some(local) = ctx.read_local(entity).await else {
            return;
        };
        let path = entity.path();
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
        if ctx.send(Action::SettingRename, &msg, Some(path)).await.is_ok() {
            ctx.config_hashes.rename(old_path, path);
            ctx.config_hashes.set_hash(path, &hash);
        }
    }
}

impl ConfigOperator {
    /// Remote config content. Emits [`SyncEvent::ConfigChanged`] when something was written.
    pub async fn apply_modify(&self, ctx: &SyncContext, msg: &RemoteModify) {
        let entity = Entity::config(&msg.path);
        let outcome = match &entity {
            Entity::VirtualConfigItem(path) => self.apply_virtual(ctx, path, msg),
            _ => apply_remote_text(ctx, &entity, msg).await,
        };
        if outcome == RemoteWrite::Written {
            info!("Config {} updated from server", msg.path);
            ctx.events.emit(SyncEvent::ConfigChanged {
                path: msg.path.clone(),
            });
        }
        if outcome.applied() {
            ctx.advance_epoch(Domain::Config, msg.last_time);
        }
    }

    fn apply_virtual(&self, ctx: &SyncContext, path: &str, msg: &RemoteModify) -> RemoteWrite {
        let entity = Entity::VirtualConfigItem(path.to_string());
        let (Some(items), Some(key)) = (ctx.virtual_items.as_ref(), virtual_key(path)) else {
            return RemoteWrite::Skipped;
        };
        if !ctx.admits_remote(&entity) {
            return RemoteWrite::Skipped;
        }
        if items.get(key).is_some() && already_applied(&ctx.config_hashes, path, &msg.content_hash, msg.mtime) {
            return RemoteWrite::Unchanged;
        }
        let _ignore = ctx.ignored.mark(path);
        items.set(key, &msg.content);
        ctx.config_hashes
            .record_synced(path, &fingerprint_text(&msg.content), msg.mtime);
        RemoteWrite::Written
    }

    pub async fn need_upload(&self, ctx: &SyncContext, msg: &RemotePath) {
        let entity = Entity::config(&msg.path);
        self.local_change(ctx, &entity, false).await;
    }

    pub async fn apply_mtime(&self, ctx: &SyncContext, msg: &RemoteMtime) {
        match Entity::config(&msg.path) {
            Entity::VirtualConfigItem(path) => {
                ctx.config_hashes.set_synced_mtime(&path, msg.mtime);
                ctx.advance_epoch(Domain::Config, msg.last_time);
            }
            entity => apply_remote_mtime(ctx, &entity, msg).await,
        }
    }

    pub async fn apply_delete(&self, ctx: &SyncContext, msg: &RemotePath) {
        match Entity::config(&msg.path) {
            Entity::VirtualConfigItem(path) => {
                if let (Some(items), Some(key)) = (ctx.virtual_items.as_ref(), virtual_key(&path)) {
                    ctx.recently_deleted.insert(&path);
                    items.remove(key);
                }
                ctx.config_hashes.remove_hash(&path);
                ctx.advance_epoch(Domain::Config, msg.last_time);
            }
            entity => {
                apply_remote_delete(ctx, &entity, msg).await;
                self.prune_empty_dirs(ctx).await;
            }
        }
    }

    pub async fn apply_rename(&self, ctx: &SyncContext, msg: &RemoteRename) {
        let old = Entity::config(&msg.old_path);
        let new = Entity::config(&msg.path);
        match (&old, &new) {
            (Entity::ConfigFile(_), Entity::ConfigFile(_)) => apply_remote_rename(ctx, &old, &new, msg).await,
            _ => {
                if let (Some(items), Some(from), Some(to)) =
                    (ctx.virtual_items.as_ref(), virtual_key(&msg.old_path), virtual_key(&msg.path))
                {
                    if let Some(value) = items.get(from) {
                        items.set(to, &value);
                        items.remove(from);
                    }
                }
                ctx.config_hashes.rename(&msg.old_path, &msg.path);
                ctx.advance_epoch(Domain::Config, msg.last_time);
            }
        }
    }

    /// Server reset its config store: forget what was synced.
    pub fn apply_clear(&self, ctx: &SyncContext) {
        info!("Server cleared config, resetting local config ledger");
        ctx.config_hashes.clear();
        ctx.epochs.set(Domain::Config, 0);
    }

    /// Remove plugin and theme directories left empty.
    pub async fn prune_empty_dirs(&self, ctx: &SyncContext) {
        for dir in PRUNED_DIRS {
            let base = join_path(ctx.config_dir(), dir);
            let Ok(entries) = ctx.fs.list(&base).await else {
                continue;
            };
            for entry in entries.into_iter().filter(|e| e.is_dir) {
                let sub = join_path(&base, &entry.name);
                let empty = ctx.fs.list(&sub).await.map(|c| c.is_empty()).unwrap_or(false);
                if empty {
                    match ctx.fs.delete(&sub).await {
                        Ok(()) => debug!("Removed empty {}", sub),
                        Err(e) => warn!("Cannot remove {}: {}", sub, e),
                    }
                }
            }
        }
    }

    /// Push virtual items whose value drifted from the ledger and report removed ones.
    pub async fn poll_virtual_items(&self, ctx: &SyncContext) {
        if !ctx.settings.config_sync_enabled || !ctx.watch_enabled() || !ctx.outbox.is_authenticated() {
            return;
        }
        let Some(items) = ctx.virtual_items.as_ref() else {
            return;
        };
        let keys = items.keys();
        for key in &keys {
            let path = virtual_path(key);
            let Some(value) = items.get(key) else {
                continue;
            };
            if ctx.config_hashes.get_hash(&path) != Some(fingerprint_text(&value)) {
                self.local_change(ctx, &Entity::VirtualConfigItem(path), false).await;
            }
        }
        let removed: Vec<String> = ctx
            .config_hashes
            .get_all_paths()
            .into_iter()
            .filter(|p| virtual_key(p).is_some_and(|k| !keys.iter().any(|known| known == k)))
            .collect();
        for path in removed {
            self.local_delete(ctx, &Entity::VirtualConfigItem(path), false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use crate::events::SyncEvent;
    use crate::fs::{FileSystem, WriteTimes};
    use crate::virtual_items::VirtualItemStore;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn remote(path: &str, content: &str) -> RemoteModify {
        RemoteModify {
            path: path.into(),
            path_hash: path_hash(path),
            content: content.into(),
            content_hash: fingerprint_text(content),
            mtime: 2000,
            last_time: 12,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_uses_config_relative_path() {
        let h = harness();
        h.fs.write(".obsidian/app.json", b"{}", Some(WriteTimes::new(10, 0))).await.unwrap();

        ConfigOperator
            .local_change(&h.ctx, &Entity::ConfigFile("app.json".into()), false)
            .await;

        let sent = h.conn.payloads(Action::SettingModify);
        assert_eq!(sent[0]["path"], json!("app.json"));
        assert_eq!(sent[0]["contentHash"], json!(fingerprint_text("{}")));
        assert_eq!(h.ctx.config_hashes.get_hash("app.json"), Some(fingerprint_text("{}")));
    }

    #[tokio::test]
    async fn test_untracked_config_file_is_ignored() {
        let h = harness();
        h.fs.write(".obsidian/workspace.json", b"{}", None).await.unwrap();
        ConfigOperator
            .local_change(&h.ctx, &Entity::ConfigFile("workspace.json".into()), false)
            .await;
        assert!(h.conn.texts().is_empty());
    }

    #[tokio::test]
    async fn test_remote_write_emits_config_changed_once() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            h.ctx.events.subscribe(move |e| {
                if let SyncEvent::ConfigChanged { path } = e {
                    seen.lock().unwrap().push(path.clone());
                }
            })
        };

        let msg = remote("plugins/p/data.json", "{\"a\":1}");
        ConfigOperator.apply_modify(&h.ctx, &msg).await;
        ConfigOperator.apply_modify(&h.ctx, &msg).await;

        assert_eq!(h.fs.read_text(".obsidian/plugins/p/data.json").await.unwrap(), "{\"a\":1}");
        assert_eq!(*seen.lock().unwrap(), vec!["plugins/p/data.json".to_string()]);
        assert_eq!(h.ctx.epochs.get(Domain::Config), 12);
    }

    #[tokio::test]
    async fn test_virtual_item_round_trip() {
        let h = harness();
        ConfigOperator.apply_modify(&h.ctx, &remote("_localStorage/theme", "dark")).await;
        assert_eq!(h.items.get("theme").as_deref(), Some("dark"));

        ConfigOperator
            .apply_delete(
                &h.ctx,
                &RemotePath {
                    path: "_localStorage/theme".into(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(h.items.get("theme"), None);
        assert_eq!(h.ctx.config_hashes.get_hash("_localStorage/theme"), None);
    }

    #[tokio::test]
    async fn test_poll_pushes_changed_and_deleted_items() {
        let h = harness();
        h.items.set("theme", "dark");
        ConfigOperator.poll_virtual_items(&h.ctx).await;
        ConfigOperator.poll_virtual_items(&h.ctx).await;
        assert_eq!(h.conn.actions(), vec!["SettingModify"]);

        h.items.remove("theme");
        ConfigOperator.poll_virtual_items(&h.ctx).await;
        assert_eq!(h.conn.actions(), vec!["SettingModify", "SettingDelete"]);
        assert_eq!(h.conn.payloads(Action::SettingDelete)[0]["path"], json!("_localStorage/theme"));
    }

    #[tokio::test]
    async fn test_remote_delete_prunes_empty_plugin_dir() {
        let h = harness();
        h.fs.write(".obsidian/plugins/p/main.js", b"x", None).await.unwrap();
        h.fs.write(".obsidian/plugins/q/main.js", b"y", None).await.unwrap();

        ConfigOperator
            .apply_delete(
                &h.ctx,
                &RemotePath {
                    path: "plugins/p/main.js".into(),
                    ..Default::default()
                },
            )
            .await;

        assert!(!h.fs.exists(".obsidian/plugins/p").await.unwrap());
        assert!(h.fs.exists(".obsidian/plugins/q/main.js").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_resets_ledger_and_epoch() {
        let h = harness();
        h.ctx.config_hashes.set_hash("app.json", "1");
        h.ctx.epochs.set(Domain::Config, 99);
        ConfigOperator.apply_clear(&h.ctx);
        assert!(h.ctx.config_hashes.is_empty());
        assert_eq!(h.ctx.epochs.get(Domain::Config), 0);
    }
}
