//! Per-domain operators and the state they share.
//!
//! Local changes are pushed while holding the path lock. Remote instructions are applied
//! under the same lock with the path marked ignored, so the watcher does not report the
//! engine's own writes back to the server.

mod config;
mod file;
mod folder;
mod note;

pub use config::ConfigOperator;
pub use file::FileOperator;
pub use folder::FolderOperator;
pub use note::NoteOperator;

use crate::chunk::{ChunkUploader, DownloadSessions, UploadQueue, UploadTracker};
use crate::entity::{Entity, ExclusionRules};
use crate::events::{EventBus, SyncEvent};
use crate::fingerprint::{fingerprint_text, path_hash};
use crate::fs::{FileSystem, FsError, WriteTimes, now_millis, parent_path};
use crate::hash_store::{FolderSnapshot, HashStore, StoreKind};
use crate::ignore::{IgnoreSet, RecentlyDeleted};
use crate::kv::KvStore;
use crate::lock::{LockOptions, PathLock};
use crate::progress::CycleTracker;
use crate::protocol::Action;
use crate::protocol::messages::{PathMessage, RemoteModify, RemoteMtime, RemotePath, RemoteRename};
use crate::scan::{ConfigRoot, config_roots, content_hash, is_tracked_config};
use crate::settings::{Domain, EngineTimings, EpochStore, SyncSettings};
use crate::sync_log::{LogStatus, LogType, SyncLog};
use crate::transport::{self, Connection, Outbox};
use crate::virtual_items::{VirtualItemStore, virtual_key};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Local side of a domain: pushing creates, modifies, deletes and renames.
#[async_trait]
pub trait DomainOperator: Send + Sync {
    fn domain(&self) -> Domain;

    /// Push a created or modified entity. `event_sourced` is true when the call comes
    /// from the live watcher rather than from the engine itself.
    async fn local_change(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool);

    async fn local_delete(&self, ctx: &SyncContext, entity: &Entity, event_sourced: bool);

    async fn local_rename(&self, ctx: &SyncContext, old_path: &str, entity: &Entity, event_sourced: bool);
}

static NOTE: NoteOperator = NoteOperator;
static FILE: FileOperator = FileOperator;
static FOLDER: FolderOperator = FolderOperator;
static CONFIG: ConfigOperator = ConfigOperator;

/// Operator responsible for `domain`.
pub fn operator_for(domain: Domain) -> &'static dyn DomainOperator {
    match domain {
        Domain::Note => &NOTE,
        Domain::File => &FILE,
        Domain::Folder => &FOLDER,
        Domain::Config => &CONFIG,
    }
}

/// Contents and timestamps of a local entity.
#[derive(Debug, Clone)]
pub struct LocalContent {
    pub bytes: Vec<u8>,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

impl LocalContent {
    /// Contents as text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Decrements the deferred-task count when dropped.
pub struct DeferredGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything the operators and the orchestrator share.
pub struct SyncContext {
    pub settings: SyncSettings,
    pub timings: EngineTimings,
    pub fs: Arc<dyn FileSystem>,
    pub outbox: Outbox,
    pub locks: PathLock,
    pub ignored: IgnoreSet,
    pub recently_deleted: RecentlyDeleted,
    /// Notes and attachments
    pub file_hashes: HashStore,
    pub config_hashes: HashStore,
    pub folder_hashes: HashStore,
    pub folder_snapshot: FolderSnapshot,
    pub epochs: EpochStore,
    pub cycle: Arc<CycleTracker>,
    pub uploads: UploadQueue,
    pub downloads: DownloadSessions,
    pub events: Arc<EventBus>,
    pub log: Arc<SyncLog>,
    pub virtual_items: Option<Arc<dyn VirtualItemStore>>,
    kv: Arc<dyn KvStore>,
    vault_rules: ExclusionRules,
    config_rules: ExclusionRules,
    config_roots: Vec<ConfigRoot>,
    watch_enabled: AtomicBool,
    deferred: Arc<AtomicUsize>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SyncSettings,
        timings: EngineTimings,
        fs: Arc<dyn FileSystem>,
        kv: Arc<dyn KvStore>,
        conn: Arc<dyn Connection>,
        events: Arc<EventBus>,
        log: Arc<SyncLog>,
        virtual_items: Option<Arc<dyn VirtualItemStore>>,
    ) -> Self {
        let workspace = settings.workspace().to_string();
        let outbox = Outbox::new(conn, timings.backpressure_threshold, timings.backpressure_poll);
        let cycle = Arc::new(CycleTracker::new());
        let uploader = ChunkUploader {
            fs: fs.clone(),
            outbox: outbox.clone(),
            tracker: UploadTracker::new(),
            cycle: cycle.clone(),
            log: log.clone(),
            default_chunk_size: timings.default_chunk_size,
            chunk_yield: timings.chunk_yield,
        };
        Self {
            vault_rules: ExclusionRules::for_vault(&settings),
            config_rules: ExclusionRules::for_config(&settings),
            config_roots: config_roots(&settings),
            file_hashes: HashStore::new(StoreKind::File, &workspace, kv.clone()),
            config_hashes: HashStore::new(StoreKind::Config, &workspace, kv.clone()),
            folder_hashes: HashStore::new(StoreKind::Folder, &workspace, kv.clone()),
            folder_snapshot: FolderSnapshot::new(&workspace, kv.clone()),
            epochs: EpochStore::load(&workspace, kv.clone()),
            kv,
            recently_deleted: RecentlyDeleted::new(timings.recently_deleted_ttl),
            uploads: UploadQueue::new(uploader, timings.upload_workers),
            downloads: DownloadSessions::new(),
            locks: PathLock::new(),
            ignored: IgnoreSet::new(),
            watch_enabled: AtomicBool::new(true),
            deferred: Arc::new(AtomicUsize::new(0)),
            settings,
            timings,
            fs,
            outbox,
            cycle,
            events,
            log,
            virtual_items,
        }
    }

    pub fn vault(&self) -> &str {
        &self.settings.vault
    }

    pub fn config_dir(&self) -> &str {
        &self.settings.config_dir
    }

    pub fn vault_rules(&self) -> &ExclusionRules {
        &self.vault_rules
    }

    pub fn config_rules(&self) -> &ExclusionRules {
        &self.config_rules
    }

    pub fn config_roots(&self) -> &[ConfigRoot] {
        &self.config_roots
    }

    /// Write every dirty ledger, then flush the backing store. Blocks on I/O.
    pub fn flush_stores(&self) {
        let written = [
            self.file_hashes.flush(),
            self.config_hashes.flush(),
            self.folder_hashes.flush(),
            self.folder_snapshot.flush(),
        ];
        if let Err(e) = self.kv.flush() {
            warn!("Failed to flush sync state: {}", e);
            return;
        }
        debug!(
            "Flushed {} ledgers",
            written.iter().filter(|w| **w).count()
        );
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            max_retries: self.timings.lock_retries,
            retry_interval: self.timings.lock_retry_interval,
        }
    }

    /// Whether live watcher events are acted on. Off while a cycle runs.
    pub fn watch_enabled(&self) -> bool {
        self.watch_enabled.load(Ordering::SeqCst)
    }

    pub fn set_watch_enabled(&self, enabled: bool) {
        self.watch_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Count a remote instruction that keeps running after its handler returned.
    pub fn defer(&self) -> DeferredGuard {
        self.deferred.fetch_add(1, Ordering::SeqCst);
        DeferredGuard {
            count: self.deferred.clone(),
        }
    }

    pub fn deferred(&self) -> usize {
        self.deferred.load(Ordering::SeqCst)
    }

    /// Advance a domain's epoch for an applied live instruction. While the domain is part
    /// of a running cycle the epoch is committed only when the cycle completes.
    pub fn advance_epoch(&self, domain: Domain, last_time: i64) {
        if !self.cycle.is_active(domain) {
            self.epochs.advance(domain, last_time);
        }
    }

    pub fn store_for(&self, domain: Domain) -> &HashStore {
        match domain {
            Domain::Note | Domain::File => &self.file_hashes,
            Domain::Config => &self.config_hashes,
            Domain::Folder => &self.folder_hashes,
        }
    }

    pub fn domain_enabled(&self, domain: Domain) -> bool {
        match domain {
            Domain::Config => self.settings.config_sync_enabled,
            _ => self.settings.sync_enabled,
        }
    }

    /// Exclusion check in the entity's own rule set.
    pub fn is_excluded(&self, entity: &Entity) -> bool {
        match entity {
            Entity::Note(p) | Entity::Attachment(p) | Entity::Folder(p) => self.vault_rules.is_excluded(p),
            Entity::ConfigFile(rel) => !is_tracked_config(rel, &self.config_roots, &self.config_rules),
            Entity::VirtualConfigItem(p) => self.config_rules.is_excluded(p),
        }
    }

    /// Document-store path of a config entity, or the entity path for virtual items.
    /// Locks and ignore marks are keyed by this.
    pub fn lock_key(&self, entity: &Entity) -> String {
        entity
            .storage_path(&self.settings.config_dir)
            .unwrap_or_else(|| entity.path().to_string())
    }

    /// Gate shared by every local push.
    pub fn admits_local(&self, entity: &Entity, event_sourced: bool) -> bool {
        let domain = entity.domain();
        if !self.domain_enabled(domain) || self.is_excluded(entity) {
            return false;
        }
        if event_sourced {
            if !self.watch_enabled() {
                debug!("Dropping watcher event for {} during sync", entity.path());
                return false;
            }
            if self.ignored.contains(&self.lock_key(entity)) {
                return false;
            }
            if !self.store_for(domain).is_ready() {
                debug!("Dropping watcher event for {}: hashes not loaded", entity.path());
                return false;
            }
        }
        true
    }

    /// Gate shared by every remote instruction.
    pub fn admits_remote(&self, entity: &Entity) -> bool {
        self.domain_enabled(entity.domain()) && !self.is_excluded(entity)
    }

    /// Read an entity's contents and timestamps. `None` when it does not exist.
    pub async fn read_local(&self, entity: &Entity) -> Option<LocalContent> {
        if let Entity::VirtualConfigItem(path) = entity {
            let value = self.virtual_items.as_ref()?.get(virtual_key(path)?)?;
            return Some(LocalContent {
                size: value.len() as u64,
                bytes: value.into_bytes(),
                mtime: now_millis(),
                ctime: 0,
            });
        }
        let storage = entity.storage_path(&self.settings.config_dir)?;
        let stat = match self.fs.stat(&storage).await {
            Ok(stat) if !stat.is_dir => stat,
            Ok(_) | Err(FsError::NotFound(_)) => return None,
            Err(e) => {
                warn!("Cannot stat {}: {}", storage, e);
                return None;
            }
        };
        match self.fs.read(&storage).await {
            Ok(bytes) => Some(LocalContent {
                bytes,
                mtime: stat.mtime_millis,
                ctime: stat.ctime_millis.unwrap_or(stat.mtime_millis),
                size: stat.size,
            }),
            Err(FsError::NotFound(_)) => None,
            Err(e) => {
                warn!("Cannot read {}: {}", storage, e);
                None
            }
        }
    }

    pub async fn exists(&self, storage: &str) -> bool {
        self.fs.exists(storage).await.unwrap_or(false)
    }

    /// Create the parent directory of `storage` when missing.
    pub async fn ensure_parent(&self, storage: &str) {
        let Some(parent) = parent_path(storage) else {
            return;
        };
        if parent.is_empty() || self.exists(&parent).await {
            return;
        }
        if let Err(e) = self.fs.mkdir(&parent).await {
            warn!("Cannot create {}: {}", parent, e);
        }
    }

    /// Send a payload, logging the outcome under `path`.
    pub async fn send<T: Serialize + Sync>(&self, action: Action, payload: &T, path: Option<&str>) -> transport::Result<()> {
        match self.outbox.send(action, payload).await {
            Ok(size) => {
                self.events.emit(SyncEvent::MessageSent {
                    message_type: action.as_str().to_string(),
                    size,
                });
                if is_logged(action) {
                    self.log.add(LogType::Send, action.as_str(), LogStatus::Success, path, None);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send {} for {}: {}", action, path.unwrap_or("-"), e);
                self.log
                    .add(LogType::Send, action.as_str(), LogStatus::Error, path, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    pub fn path_message(&self, path: &str) -> PathMessage {
        PathMessage {
            vault: self.settings.vault.clone(),
            path: path.to_string(),
            path_hash: path_hash(path),
        }
    }
}

/// Handshake and transfer chatter stays out of the user-facing log.
fn is_logged(action: Action) -> bool {
    !matches!(
        action,
        Action::Authorization | Action::ClientInfo | Action::FileUploadCheck | Action::FileChunkDownload
    )
}

fn re_push_action(domain: Domain) -> Option<Action> {
    match domain {
        Domain::Note => Some(Action::NoteRePush),
        Domain::File => Some(Action::FileRePush),
        Domain::Config => Some(Action::SettingRePush),
        Domain::Folder => None,
    }
}

/// True when the ledger already records this exact content at this mtime.
fn already_applied(store: &HashStore, path: &str, content_hash: &str, mtime: i64) -> bool {
    store
        .get(path)
        .is_some_and(|t| t.hash == content_hash && t.synced_mtime == Some(mtime))
}

// ==================== Shared remote application ====================

/// What happened to a remote content write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteWrite {
    /// Excluded, busy, or failed
    Skipped,
    /// Local copy already matched
    Unchanged,
    Written,
}

impl RemoteWrite {
    pub(crate) fn applied(self) -> bool {
        self != RemoteWrite::Skipped
    }
}

/// Write remote text content for a note or config file.
pub(crate) async fn apply_remote_text(ctx: &SyncContext, entity: &Entity, msg: &RemoteModify) -> RemoteWrite {
    if !ctx.admits_remote(entity) {
        return RemoteWrite::Skipped;
    }
    let key = ctx.lock_key(entity);
    if ctx.ignored.contains(&key) {
        debug!("Skipping remote modify of {}: write already in progress", key);
        return RemoteWrite::Skipped;
    }
    let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
        warn!("Skipping remote modify of {}: path busy", key);
        return RemoteWrite::Skipped;
    };
    let _ignore = ctx.ignored.mark(&key);
    let store = ctx.store_for(entity.domain());

    if ctx.exists(&key).await && already_applied(store, entity.path(), &msg.content_hash, msg.mtime) {
        debug!("{} already matches remote content", key);
        return RemoteWrite::Unchanged;
    }
    ctx.ensure_parent(&key).await;
    let times = WriteTimes::new(msg.mtime, msg.ctime);
    if let Err(e) = ctx.fs.write(&key, msg.content.as_bytes(), Some(times)).await {
        warn!("Cannot write {}: {}", key, e);
        return RemoteWrite::Skipped;
    }
    store.record_synced(entity.path(), &fingerprint_text(&msg.content), msg.mtime);
    ctx.recently_deleted.remove(entity.path());
    RemoteWrite::Written
}

/// Delete an entity the server reports as deleted.
pub(crate) async fn apply_remote_delete(ctx: &SyncContext, entity: &Entity, msg: &RemotePath) {
    if !ctx.admits_remote(entity) {
        return;
    }
    let key = ctx.lock_key(entity);
    let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
        warn!("Skipping remote delete of {}: path busy", key);
        return;
    };
    let _ignore = ctx.ignored.mark(&key);
    ctx.recently_deleted.insert(entity.path());
    match ctx.fs.delete(&key).await {
        Ok(()) | Err(FsError::NotFound(_)) => {}
        Err(e) => warn!("Cannot delete {}: {}", key, e),
    }
    ctx.store_for(entity.domain()).remove_hash(entity.path());
    ctx.advance_epoch(entity.domain(), msg.last_time);
}

/// Apply remote timestamps without rewriting content.
pub(crate) async fn apply_remote_mtime(ctx: &SyncContext, entity: &Entity, msg: &RemoteMtime) {
    if !ctx.admits_remote(entity) {
        return;
    }
    let key = ctx.lock_key(entity);
    let Some(_guard) = ctx.locks.acquire(&key, ctx.lock_options()).await else {
        warn!("Skipping remote mtime of {}: path busy", key);
        return;
    };
    let _ignore = ctx.ignored.mark(&key);
    match ctx.fs.set_times(&key, WriteTimes::new(msg.mtime, msg.ctime)).await {
        Ok(()) => {
            ctx.store_for(entity.domain()).set_synced_mtime(entity.path(), msg.mtime);
        }
        Err(FsError::NotFound(_)) => debug!("Remote mtime for missing {}", key),
        Err(e) => warn!("Cannot set times on {}: {}", key, e),
    }
    ctx.advance_epoch(entity.domain(), msg.last_time);
}

/// Rename in place, or repair by asking for a re-push when the old path is gone.
pub(crate) async fn apply_remote_rename(ctx: &SyncContext, old: &Entity, new: &Entity, msg: &RemoteRename) {
    if !ctx.admits_remote(new) {
        return;
    }
    let domain = new.domain();
    let store = ctx.store_for(domain);
    let old_key = ctx.lock_key(old);
    let new_key = ctx.lock_key(new);
    let options = ctx.lock_options();
    let Some(_new_guard) = ctx.locks.acquire(&new_key, options).await else {
        warn!("Skipping remote rename to {}: path busy", new_key);
        return;
    };
    let Some(_old_guard) = ctx.locks.acquire(&old_key, options).await else {
        warn!("Skipping remote rename from {}: path busy", old_key);
        return;
    };
    let _ignore_new = ctx.ignored.mark(&new_key);
    let _ignore_old = ctx.ignored.mark(&old_key);
    ctx.recently_deleted.insert(old.path());

    if ctx.exists(&old_key).await {
        if ctx.exists(&new_key).await {
            if let Err(e) = ctx.fs.delete(&new_key).await {
                warn!("Cannot replace {}: {}", new_key, e);
                return;
            }
        }
        ctx.ensure_parent(&new_key).await;
        if let Err(e) = ctx.fs.rename(&old_key, &new_key).await {
            warn!("Cannot rename {} to {}: {}", old_key, new_key, e);
            return;
        }
        if let Err(e) = ctx.fs.set_times(&new_key, WriteTimes::new(msg.mtime, msg.ctime)).await {
            debug!("Cannot restore times on {}: {}", new_key, e);
        }
        let tracked = store.get(old.path()).map(|t| t.hash);
        store.rename(old.path(), new.path());
        let hash = if msg.content_hash.is_empty() {
            tracked
        } else {
            Some(msg.content_hash.clone())
        };
        if let Some(hash) = hash {
            store.record_synced(new.path(), &hash, msg.mtime);
        }
        ctx.advance_epoch(domain, msg.last_time);
        return;
    }

    let matches_target = ctx
        .read_local(new)
        .await
        .is_some_and(|local| local.size == msg.size && content_hash(new, &local.bytes) == msg.content_hash);
    if matches_target {
        debug!("{} already holds the renamed content", new_key);
        store.remove_hash(old.path());
        store.record_synced(new.path(), &msg.content_hash, msg.mtime);
        ctx.advance_epoch(domain, msg.last_time);
        return;
    }

    store.remove_hash(old.path());
    let Some(action) = re_push_action(domain) else {
        return;
    };
    debug!("{} missing locally, requesting {}", old_key, action);
    if ctx.send(action, &ctx.path_message(new.path()), Some(new.path())).await.is_ok() {
        ctx.advance_epoch(domain, msg.last_time);
    }
}
