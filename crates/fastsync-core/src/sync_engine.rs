//! SyncEngine: drives sync cycles and routes server messages to the domain operators.
//!
//! A cycle runs as follows:
//!
//! 1. `handle_sync` turns the watcher off, snapshots every active domain and sends one
//!    request per domain, folders first so notes and attachments land in existing dirs
//! 2. The server answers with reconciliation instructions and a `*SyncEnd` summary per
//!    domain. Instructions go through the same handler table whether they arrive on
//!    their own or inlined in the summary
//! 3. A poller checks the completion gate. Once every domain ended and all transfers
//!    drained it commits the epochs and turns the watcher back on
//!
//! Outside a cycle the same handler table applies live instructions, and local watcher
//! events are pushed through [`SyncEngine::on_local_event`].

use crate::entity::Entity;
use crate::events::{EventBus, SyncEvent};
use crate::fingerprint::{fingerprint_text, path_hash};
use crate::fs::{FileSystem, FsError, now_millis};
use crate::hash_store::TrackedHash;
use crate::kv::{KvError, KvStore};
use crate::operator::{
    ConfigOperator, DomainOperator, FileOperator, FolderOperator, NoteOperator, SyncContext, operator_for,
};
use crate::progress::{CyclePhase, GateInput, is_cycle_complete};
use crate::protocol::messages::{
    ChunkDownloadMeta, ClientInfo, FileSyncRequest, FileUpdate, FolderEntry, FolderSyncRequest, NoteSyncRequest,
    PathRef, RemoteFolder, RemoteModify, RemoteMtime, RemotePath, RemoteRename, SettingSyncRequest, SnapEntry,
    SyncEnd, UploadSession,
};
use crate::protocol::{Action, CHUNK_PREFIX, Envelope, ProtocolError, split_binary, split_text};
use crate::scan::{LocalItem, VaultListing, content_hash, cooperative_yield, hash_items, scan_config, scan_vault};
use crate::settings::{Domain, EngineTimings, SyncSettings};
use crate::sync_log::{LogStatus, LogType, SyncLog};
use crate::transport::{Connection, TransportError};
use crate::virtual_items::{VirtualItemStore, virtual_path};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Storage error: {0}")]
    Kv(#[from] KvError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Which domains a manual sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Every enabled domain
    #[default]
    Auto,
    /// Notes, attachments and folders
    Note,
    Config,
}

/// Result of asking for a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStartOutcome {
    Started,
    NotConnected,
    /// The previous cycle has not drained yet
    PreviousSyncPending,
    /// No domain is enabled for the mode
    NothingToSync,
    /// The local scan or a request send failed; the cycle was abandoned
    Failed,
}

/// Change reported by the host's watcher. Paths are vault-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created { path: String, is_dir: bool },
    Modified { path: String },
    Deleted { path: String },
    Renamed { from: String, to: String, is_dir: bool },
    /// Low-level change inside the config directory
    Raw { path: String },
}

/// Inbound actions that stay out of the user-facing log.
fn is_receive_logged(action: Action) -> bool {
    !matches!(
        action,
        Action::FileSyncUpdate | Action::FileSyncChunkDownload | Action::NoteSyncNeedPush
    )
}

fn decode<T: DeserializeOwned>(action: Action, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Malformed {} payload: {}", action, e);
            None
        }
    }
}

/// Tracked paths that vanished locally, reported either as deletions or as repair
/// requests. A full sync without offline delete tracking reports neither.
fn split_vanished(
    gone: Vec<String>,
    offline_delete: bool,
    incremental: bool,
) -> (Option<Vec<PathRef>>, Option<Vec<PathRef>>) {
    if gone.is_empty() {
        return (None, None);
    }
    let refs: Vec<PathRef> = gone
        .into_iter()
        .map(|path| PathRef {
            path_hash: path_hash(&path),
            path,
        })
        .collect();
    if offline_delete {
        (Some(refs), None)
    } else if incremental {
        (None, Some(refs))
    } else {
        (None, None)
    }
}

pub struct SyncEngineBuilder {
    settings: SyncSettings,
    timings: Option<EngineTimings>,
    fs: Arc<dyn FileSystem>,
    kv: Arc<dyn KvStore>,
    conn: Arc<dyn Connection>,
    events: Option<Arc<EventBus>>,
    log: Option<Arc<SyncLog>>,
    virtual_items: Option<Arc<dyn VirtualItemStore>>,
}

impl SyncEngineBuilder {
    /// Override the device defaults.
    pub fn timings(mut self, timings: EngineTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn log(mut self, log: Arc<SyncLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn virtual_items(mut self, items: Arc<dyn VirtualItemStore>) -> Self {
        self.virtual_items = Some(items);
        self
    }

    pub fn build(self) -> SyncEngine {
        let timings = self
            .timings
            .unwrap_or_else(|| EngineTimings::for_device(self.settings.device));
        let ctx = SyncContext::new(
            self.settings,
            timings,
            self.fs,
            self.kv,
            self.conn,
            self.events.unwrap_or_default(),
            self.log.unwrap_or_default(),
            self.virtual_items,
        );
        SyncEngine { ctx: Arc::new(ctx) }
    }
}

/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
}

impl SyncEngine {
    pub fn builder(
        settings: SyncSettings,
        fs: Arc<dyn FileSystem>,
        kv: Arc<dyn KvStore>,
        conn: Arc<dyn Connection>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            settings,
            timings: None,
            fs,
            kv,
            conn,
            events: None,
            log: None,
            virtual_items: None,
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.ctx.events
    }

    pub fn log(&self) -> &Arc<SyncLog> {
        &self.ctx.log
    }

    // ==================== Hash stores ====================

    /// Load persisted ledgers, seeding any that are missing from a local scan.
    pub async fn initialize_stores(&self) -> Result<()> {
        let ctx = &self.ctx;
        let files_loaded = ctx.file_hashes.load();
        let folders_loaded = ctx.folder_hashes.load();
        let snapshot_loaded = ctx.folder_snapshot.load();
        let config_loaded = ctx.config_hashes.load();
        if files_loaded && folders_loaded && snapshot_loaded && config_loaded {
            return Ok(());
        }
        info!("Seeding hash stores from a local scan");
        let listing = scan_vault(ctx.fs.as_ref(), ctx.config_dir(), ctx.vault_rules()).await?;
        if !files_loaded {
            self.seed_files(&listing).await;
        }
        if !folders_loaded || !snapshot_loaded {
            self.seed_folders(&listing);
        }
        if !config_loaded {
            self.seed_config().await;
        }
        self.flush().await;
        Ok(())
    }

    /// Discard every ledger and rebuild them from what is on disk now.
    pub async fn rebuild_hash_map(&self) -> Result<()> {
        let ctx = &self.ctx;
        let listing = scan_vault(ctx.fs.as_ref(), ctx.config_dir(), ctx.vault_rules()).await?;
        self.seed_files(&listing).await;
        self.seed_folders(&listing);
        self.seed_config().await;
        info!(
            "Rebuilt hash stores: {} files, {} folders, {} config",
            ctx.file_hashes.len(),
            ctx.folder_hashes.len(),
            ctx.config_hashes.len()
        );
        self.flush().await;
        Ok(())
    }

    /// Persist ledger changes made since the last flush, off the async workers.
    pub async fn flush(&self) {
        let ctx = Arc::clone(&self.ctx);
        if let Err(e) = tokio::task::spawn_blocking(move || ctx.flush_stores()).await {
            warn!("Store flush task failed: {}", e);
        }
    }

    async fn seed_files(&self, listing: &VaultListing) {
        let ctx = &self.ctx;
        let hashes = hash_items(ctx.fs.as_ref(), ctx.config_dir(), &listing.files).await;
        ctx.file_hashes.rebuild(hashes);
    }

    fn seed_folders(&self, listing: &VaultListing) {
        let ctx = &self.ctx;
        let now = now_millis();
        ctx.folder_hashes.rebuild(listing.folders.iter().map(|item| {
            let path = item.entity.path();
            (path.to_string(), TrackedHash::new(path_hash(path)))
        }));
        ctx.folder_snapshot.rebuild(
            listing
                .folders
                .iter()
                .map(|item| (item.entity.path().to_string(), now)),
        );
    }

    async fn seed_config(&self) {
        let ctx = &self.ctx;
        let items = scan_config(ctx.fs.as_ref(), ctx.config_dir(), ctx.config_roots(), ctx.config_rules()).await;
        let mut hashes = hash_items(ctx.fs.as_ref(), ctx.config_dir(), &items).await;
        if let Some(store) = ctx.virtual_items.as_ref() {
            for key in store.keys() {
                if let Some(value) = store.get(&key) {
                    hashes.push((virtual_path(&key), TrackedHash::new(fingerprint_text(&value))));
                }
            }
        }
        ctx.config_hashes.rebuild(hashes);
    }

    // ==================== Session lifecycle ====================

    /// Authorization accepted: identify ourselves, then run the startup sync.
    pub async fn on_authenticated(&self) {
        let ctx = &self.ctx;
        let info = ClientInfo {
            name: if ctx.settings.client_name.is_empty() {
                "fastsync".to_string()
            } else {
                ctx.settings.client_name.clone()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            offline_sync_strategy: if ctx.settings.offline_delete_sync {
                "delete".to_string()
            } else {
                "repair".to_string()
            },
        };
        if ctx.send(Action::ClientInfo, &info, None).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(ctx.settings.startup_delay_ms)).await;
        if !self.wait_for_stores().await {
            warn!(
                "File hashes not ready after {:?}, syncing anyway",
                ctx.timings.store_ready_timeout
            );
        }
        let incremental = ctx.epochs.get(Domain::Note) > 0;
        self.handle_sync(incremental, SyncMode::Auto).await;
    }

    async fn wait_for_stores(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.ctx.timings.store_ready_timeout;
        while !self.ctx.file_hashes.is_ready() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    /// The connection dropped. The running cycle can never finish, so it is abandoned.
    pub fn on_disconnected(&self) {
        let ctx = &self.ctx;
        let was_running = ctx.cycle.is_running();
        ctx.uploads.clear();
        ctx.downloads.clear();
        ctx.cycle.abandon();
        ctx.set_watch_enabled(true);
        let engine = self.clone();
        tokio::spawn(async move { engine.flush().await });
        if was_running {
            warn!("Connection lost during sync, cycle abandoned");
            ctx.events.emit(SyncEvent::warning("Disconnected from server, sync interrupted"));
        } else {
            ctx.events.emit(SyncEvent::warning("Disconnected from server"));
        }
    }

    // ==================== Sync cycle ====================

    fn domains_for(&self, mode: SyncMode) -> Vec<Domain> {
        let settings = &self.ctx.settings;
        let vault = settings.sync_enabled && matches!(mode, SyncMode::Auto | SyncMode::Note);
        let config = settings.config_sync_enabled && matches!(mode, SyncMode::Auto | SyncMode::Config);
        let mut domains = Vec::new();
        if vault {
            domains.push(Domain::Folder);
            domains.push(Domain::Note);
            if !settings.cloud_preview {
                domains.push(Domain::File);
            }
        }
        if config {
            domains.push(Domain::Config);
        }
        domains
    }

    /// Start a full or incremental cycle.
    pub async fn handle_sync(&self, incremental: bool, mode: SyncMode) -> SyncStartOutcome {
        let ctx = &self.ctx;
        if !ctx.outbox.is_authenticated() {
            ctx.events.emit(SyncEvent::warning("Not connected to the sync server"));
            return SyncStartOutcome::NotConnected;
        }
        if ctx.cycle.is_running() || !ctx.watch_enabled() {
            ctx.events
                .emit(SyncEvent::warning("Previous sync not yet complete, please wait"));
            return SyncStartOutcome::PreviousSyncPending;
        }
        let domains = self.domains_for(mode);
        if domains.is_empty() {
            info!("Nothing enabled to sync for {:?}", mode);
            return SyncStartOutcome::NothingToSync;
        }

        ctx.set_watch_enabled(false);
        let generation = ctx.cycle.begin(domains.clone(), incremental);
        ctx.events.emit(SyncEvent::SyncStarted { incremental });
        ctx.events.emit(SyncEvent::info("Sync started"));
        info!(
            "Starting {} sync of {:?}",
            if incremental { "incremental" } else { "full" },
            domains
        );

        match self.send_requests(&domains, incremental).await {
            Ok(()) => {
                if ctx.cycle.phase() == CyclePhase::RequestsSent {
                    ctx.cycle.set_phase(CyclePhase::AwaitingDomainEnds);
                }
                self.spawn_completion_poller(generation);
                SyncStartOutcome::Started
            }
            Err(e) => {
                error!("Sync could not start: {}", e);
                ctx.cycle.abandon();
                ctx.set_watch_enabled(true);
                ctx.events.emit(SyncEvent::error(format!("Sync failed: {}", e)));
                SyncStartOutcome::Failed
            }
        }
    }

    async fn send_requests(&self, domains: &[Domain], incremental: bool) -> Result<()> {
        let ctx = &self.ctx;
        let listing = if domains.iter().any(|d| *d != Domain::Config) {
            scan_vault(ctx.fs.as_ref(), ctx.config_dir(), ctx.vault_rules()).await?
        } else {
            VaultListing::default()
        };
        ctx.cycle.set_phase(CyclePhase::RequestsSent);

        for domain in [Domain::Folder, Domain::Note, Domain::File, Domain::Config] {
            if !domains.contains(&domain) {
                continue;
            }
            let cutoff = if incremental { ctx.epochs.get(domain) } else { 0 };
            match domain {
                Domain::Folder => {
                    let request = self.folder_request(&listing.folders, cutoff, incremental);
                    ctx.send(Action::FolderSync, &request, None).await?;
                    self.forget_reported(domain, request.del_folders.as_deref());
                }
                Domain::Note => {
                    let (entries, gone) = self.file_snapshot(&listing.files, Domain::Note, cutoff).await;
                    let (del_notes, missing_notes) = self.vanished(gone, incremental);
                    let request = NoteSyncRequest {
                        vault: ctx.vault().to_string(),
                        last_time: cutoff,
                        notes: entries,
                        del_notes,
                        missing_notes,
                    };
                    ctx.send(Action::NoteSync, &request, None).await?;
                    self.forget_reported(domain, request.del_notes.as_deref());
                }
                Domain::File => {
                    let (entries, gone) = self.file_snapshot(&listing.files, Domain::File, cutoff).await;
                    let (del_files, missing_files) = self.vanished(gone, incremental);
                    let request = FileSyncRequest {
                        vault: ctx.vault().to_string(),
                        last_time: cutoff,
                        files: entries,
                        del_files,
                        missing_files,
                    };
                    ctx.send(Action::FileSync, &request, None).await?;
                    self.forget_reported(domain, request.del_files.as_deref());
                }
                Domain::Config => {
                    let request = self.config_request(cutoff, incremental).await;
                    ctx.send(Action::SettingSync, &request, None).await?;
                    self.forget_reported(domain, request.del_settings.as_deref());
                }
            }
        }
        Ok(())
    }

    fn vanished(&self, gone: Vec<String>, incremental: bool) -> (Option<Vec<PathRef>>, Option<Vec<PathRef>>) {
        split_vanished(gone, self.ctx.settings.offline_delete_sync, incremental)
    }

    /// Paths reported as deleted leave the ledger once the request went out.
    fn forget_reported(&self, domain: Domain, deleted: Option<&[PathRef]>) {
        let store = self.ctx.store_for(domain);
        for entry in deleted.unwrap_or_default() {
            store.remove_hash(&entry.path);
            if domain == Domain::Folder {
                self.ctx.folder_snapshot.remove(&entry.path);
            }
        }
    }

    async fn snapshot_entry(&self, entity: &Entity, mtime: i64, ctime: i64) -> Option<SnapEntry> {
        let ctx = &self.ctx;
        let local = ctx.read_local(entity).await?;
        let path = entity.path();
        let entry = SnapEntry {
            path: path.to_string(),
            path_hash: path_hash(path),
            content_hash: content_hash(entity, &local.bytes),
            mtime,
            ctime,
            size: local.size,
            ..Default::default()
        };
        Some(entry.with_base(ctx.store_for(entity.domain()).get_hash(path)))
    }

    /// Entries of one vault file domain newer than `cutoff`, plus tracked paths gone locally.
    async fn file_snapshot(&self, files: &[LocalItem], domain: Domain, cutoff: i64) -> (Vec<SnapEntry>, Vec<String>) {
        let ctx = &self.ctx;
        let local: Vec<&LocalItem> = files.iter().filter(|i| i.entity.domain() == domain).collect();
        let mut entries = Vec::new();
        for (i, item) in local.iter().enumerate() {
            if item.stat.mtime_millis < cutoff {
                continue;
            }
            let ctime = item.stat.ctime_millis.unwrap_or(item.stat.mtime_millis);
            if let Some(entry) = self.snapshot_entry(&item.entity, item.stat.mtime_millis, ctime).await {
                entries.push(entry);
            }
            cooperative_yield(i + 1).await;
        }
        let present: HashSet<&str> = local.iter().map(|i| i.entity.path()).collect();
        let gone = ctx
            .file_hashes
            .get_all_paths()
            .into_iter()
            .filter(|p| {
                let entity = Entity::file(p);
                entity.domain() == domain && !present.contains(p.as_str()) && !ctx.is_excluded(&entity)
            })
            .collect();
        (entries, gone)
    }

    fn folder_request(&self, folders: &[LocalItem], cutoff: i64, incremental: bool) -> FolderSyncRequest {
        let ctx = &self.ctx;
        let now = now_millis();
        let mut entries = Vec::new();
        for item in folders {
            let path = item.entity.path();
            let mtime = match ctx.folder_snapshot.get_mtime(path) {
                Some(mtime) => mtime,
                None => {
                    ctx.folder_snapshot.set_mtime(path, now);
                    now
                }
            };
            if mtime < cutoff {
                continue;
            }
            entries.push(FolderEntry {
                path: path.to_string(),
                path_hash: path_hash(path),
                ctime: item.stat.ctime_millis.unwrap_or(0),
                mtime,
            });
        }
        let present: HashSet<&str> = folders.iter().map(|i| i.entity.path()).collect();
        let gone = ctx
            .folder_hashes
            .get_all_paths()
            .into_iter()
            .filter(|p| !present.contains(p.as_str()) && !ctx.is_excluded(&Entity::Folder(p.clone())))
            .collect();
        let (del_folders, missing_folders) = self.vanished(gone, incremental);
        FolderSyncRequest {
            vault: ctx.vault().to_string(),
            last_time: cutoff,
            folders: entries,
            del_folders,
            missing_folders,
        }
    }

    async fn config_request(&self, cutoff: i64, incremental: bool) -> SettingSyncRequest {
        let ctx = &self.ctx;
        let items = scan_config(ctx.fs.as_ref(), ctx.config_dir(), ctx.config_roots(), ctx.config_rules()).await;
        let mut entries = Vec::new();
        let mut present: HashSet<String> = items.iter().map(|i| i.entity.path().to_string()).collect();
        for (i, item) in items.iter().enumerate() {
            if item.stat.mtime_millis < cutoff {
                continue;
            }
            let ctime = item.stat.ctime_millis.unwrap_or(item.stat.mtime_millis);
            if let Some(entry) = self.snapshot_entry(&item.entity, item.stat.mtime_millis, ctime).await {
                entries.push(entry);
            }
            cooperative_yield(i + 1).await;
        }

        if let Some(store) = ctx.virtual_items.as_ref() {
            for key in store.keys() {
                let entity = Entity::VirtualConfigItem(virtual_path(&key));
                if ctx.is_excluded(&entity) {
                    continue;
                }
                let Some(value) = store.get(&key) else {
                    continue;
                };
                present.insert(entity.path().to_string());
                // Virtual items carry no mtime; incremental syncs send only drifted ones.
                let hash = fingerprint_text(&value);
                if incremental && ctx.config_hashes.get_hash(entity.path()).as_deref() == Some(hash.as_str()) {
                    continue;
                }
                if let Some(entry) = self.snapshot_entry(&entity, now_millis(), 0).await {
                    entries.push(entry);
                }
            }
        }

        let has_virtual = ctx.virtual_items.is_some();
        let gone = ctx
            .config_hashes
            .get_all_paths()
            .into_iter()
            .filter(|p| !present.contains(p))
            .filter(|p| {
                let entity = Entity::config(p);
                let tracked_kind = has_virtual || !matches!(entity, Entity::VirtualConfigItem(_));
                tracked_kind && !ctx.is_excluded(&entity)
            })
            .collect();
        let (del_settings, missing_settings) = self.vanished(gone, incremental);
        SettingSyncRequest {
            vault: ctx.vault().to_string(),
            last_time: cutoff,
            settings: entries,
            del_settings,
            missing_settings,
            cover: ctx.epochs.get(Domain::Config) == 0,
        }
    }

    // ==================== Completion ====================

    fn spawn_completion_poller(&self, generation: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut last_percent = -1.0;
            loop {
                tokio::time::sleep(engine.ctx.timings.completion_poll).await;
                let cycle = &engine.ctx.cycle;
                if cycle.generation() != generation || !cycle.is_running() {
                    debug!("Completion poller for cycle {} stopped", generation);
                    return;
                }
                engine.sweep_expired_downloads();
                let percent = engine.progress();
                if (percent - last_percent).abs() > f64::EPSILON {
                    last_percent = percent;
                    engine.ctx.events.emit(SyncEvent::Progress {
                        percent,
                        phase: cycle.phase().as_str().to_string(),
                    });
                }
                if is_cycle_complete(&engine.gate_input()) {
                    engine.finish_cycle().await;
                    return;
                }
            }
        });
    }

    /// Current cycle progress in percent.
    pub fn progress(&self) -> f64 {
        self.ctx
            .cycle
            .progress(self.ctx.outbox.buffered_amount(), self.ctx.timings.default_chunk_size)
    }

    /// Everything the completion gate looks at, sampled now.
    pub fn gate_input(&self) -> GateInput {
        let ctx = &self.ctx;
        let transfers = ctx.cycle.transfers.snapshot();
        GateInput {
            all_domains_ended: ctx.cycle.all_ended(),
            chunks_done: transfers.done(),
            chunks_expected: transfers.expected(),
            active_downloads: ctx.downloads.active(),
            pending_uploads: ctx.uploads.pending(),
            deferred_tasks: ctx.deferred(),
            buffered_amount: ctx.outbox.buffered_amount(),
        }
    }

    /// Drop downloads that stopped receiving chunks. Nothing is written for them.
    fn sweep_expired_downloads(&self) {
        let ctx = &self.ctx;
        for expired in ctx.downloads.expire_idle(ctx.timings.session_idle_timeout) {
            warn!(
                "Download of {} timed out with {} chunks outstanding",
                expired.path, expired.remaining
            );
            ctx.cycle.transfers.abandon_download(expired.remaining);
            ctx.cycle.complete_task(Domain::File);
            ctx.log.add(
                LogType::Receive,
                Action::FileSyncChunkDownload.as_str(),
                LogStatus::Error,
                Some(&expired.path),
                Some("download timed out"),
            );
        }
    }

    async fn finish_cycle(&self) {
        let ctx = &self.ctx;
        for (domain, epoch) in ctx.cycle.take_pending_epochs() {
            ctx.epochs.advance(domain, epoch);
        }
        ctx.cycle.finish();
        ctx.set_watch_enabled(true);
        self.flush().await;
        ctx.events.emit(SyncEvent::Progress {
            percent: 100.0,
            phase: CyclePhase::Completed.as_str().to_string(),
        });
        ctx.events.emit(SyncEvent::SyncCompleted);
        ctx.events.emit(SyncEvent::info("Sync completed"));
        info!("Sync completed");

        if ctx.settings.cloud_preview && ctx.settings.sync_enabled {
            self.verify_remote_attachments().await;
        }
    }

    /// Ask the server about every local attachment; it opens an upload for any it lacks.
    async fn verify_remote_attachments(&self) {
        let ctx = &self.ctx;
        let listing = match scan_vault(ctx.fs.as_ref(), ctx.config_dir(), ctx.vault_rules()).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Attachment check skipped: {}", e);
                return;
            }
        };
        let attachments: Vec<&LocalItem> = listing
            .files
            .iter()
            .filter(|i| matches!(i.entity, Entity::Attachment(_)))
            .collect();
        debug!("Checking {} attachments against the server", attachments.len());
        for item in attachments {
            FileOperator.local_change(ctx, &item.entity, false).await;
        }
    }

    // ==================== Inbound ====================

    /// One inbound text frame.
    pub async fn handle_text(&self, raw: &str) {
        let ctx = &self.ctx;
        let (name, payload) = match split_text(raw) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Dropping malformed text frame: {}", e);
                return;
            }
        };
        ctx.events.emit(SyncEvent::MessageReceived {
            message_type: name.to_string(),
            size: raw.len(),
        });
        let Some(action) = Action::parse(name) else {
            debug!("Ignoring unknown action {}", name);
            return;
        };
        if action == Action::Authorization {
            // The connection driver owns the handshake.
            return;
        }
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping {} with unreadable payload: {}", action, e);
                return;
            }
        };
        if envelope.is_error() {
            let message = envelope.describe_error();
            warn!("Server reported failure for {}: {}", action, message);
            ctx.log
                .add(LogType::Receive, action.as_str(), LogStatus::Error, None, Some(&message));
            ctx.events.emit(SyncEvent::error(format!("{} failed: {}", action, message)));
            return;
        }
        if self.is_foreign(&envelope.data) {
            return;
        }
        self.dispatch(action, envelope.data).await;
    }

    /// One inbound binary frame.
    pub async fn handle_binary(&self, frame: &[u8]) {
        let Some((prefix, payload)) = split_binary(frame) else {
            debug!("Dropping binary frame of {} bytes", frame.len());
            return;
        };
        if prefix != CHUNK_PREFIX {
            debug!(
                "No handler for binary prefix {:?}",
                String::from_utf8_lossy(&prefix)
            );
            return;
        }
        FileOperator.accept_chunk(&self.ctx, payload).await;
    }

    fn is_foreign(&self, data: &Value) -> bool {
        match data.get("vault").and_then(Value::as_str) {
            Some(vault) if vault != self.ctx.vault() => {
                debug!("Dropping message for vault {}", vault);
                true
            }
            _ => false,
        }
    }

    /// Route one instruction to its operator. Boxed because end summaries recurse.
    fn dispatch(&self, action: Action, data: Value) -> BoxFuture<'_, ()> {
        async move {
            let ctx = &*self.ctx;
            if is_receive_logged(action) {
                let path = data.get("path").and_then(Value::as_str).map(str::to_string);
                ctx.log
                    .add(LogType::Receive, action.as_str(), LogStatus::Success, path.as_deref(), None);
            }

            match action {
                Action::NoteSyncModify => {
                    if let Some(msg) = decode::<RemoteModify>(action, data) {
                        NoteOperator.apply_modify(ctx, &msg).await;
                    }
                }
                Action::NoteSyncNeedPush => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        NoteOperator.need_push(ctx, &msg).await;
                    }
                }
                Action::NoteSyncMtime => {
                    if let Some(msg) = decode::<RemoteMtime>(action, data) {
                        NoteOperator.apply_mtime(ctx, &msg).await;
                    }
                }
                Action::NoteSyncDelete => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        NoteOperator.apply_delete(ctx, &msg).await;
                    }
                }
                Action::NoteSyncRename => {
                    if let Some(msg) = decode::<RemoteRename>(action, data) {
                        NoteOperator.apply_rename(ctx, &msg).await;
                    }
                }

                Action::FileUpload => {
                    if let Some(msg) = decode::<UploadSession>(action, data) {
                        FileOperator.start_upload(ctx, &msg);
                    }
                }
                Action::FileSyncNeedUpload => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        FileOperator.need_upload(ctx, &msg).await;
                    }
                }
                Action::FileSyncUpdate => {
                    if let Some(msg) = decode::<FileUpdate>(action, data) {
                        FileOperator.announce_update(&self.ctx, &msg);
                    }
                }
                Action::FileSyncChunkDownload => {
                    if let Some(msg) = decode::<ChunkDownloadMeta>(action, data) {
                        FileOperator.begin_download(ctx, &msg).await;
                    }
                }
                Action::FileSyncDelete => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        FileOperator.apply_delete(ctx, &msg).await;
                    }
                }
                Action::FileSyncMtime => {
                    if let Some(msg) = decode::<RemoteMtime>(action, data) {
                        FileOperator.apply_mtime(ctx, &msg).await;
                    }
                }
                Action::FileSyncRename => {
                    if let Some(msg) = decode::<RemoteRename>(action, data) {
                        FileOperator.apply_rename(ctx, &msg).await;
                    }
                }

                Action::SettingSyncModify => {
                    if let Some(msg) = decode::<RemoteModify>(action, data) {
                        ConfigOperator.apply_modify(ctx, &msg).await;
                    }
                }
                Action::SettingSyncNeedUpload => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        ConfigOperator.need_upload(ctx, &msg).await;
                    }
                }
                Action::SettingSyncMtime => {
                    if let Some(msg) = decode::<RemoteMtime>(action, data) {
                        ConfigOperator.apply_mtime(ctx, &msg).await;
                    }
                }
                Action::SettingSyncDelete => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        ConfigOperator.apply_delete(ctx, &msg).await;
                    }
                }
                Action::SettingSyncRename => {
                    if let Some(msg) = decode::<RemoteRename>(action, data) {
                        ConfigOperator.apply_rename(ctx, &msg).await;
                    }
                }
                Action::SettingSyncClear | Action::SettingClear => ConfigOperator.apply_clear(ctx),

                Action::FolderSyncModify => {
                    if let Some(msg) = decode::<RemoteFolder>(action, data) {
                        FolderOperator.apply_modify(ctx, &msg).await;
                    }
                }
                Action::FolderSyncDelete => {
                    if let Some(msg) = decode::<RemotePath>(action, data) {
                        FolderOperator.apply_delete(&self.ctx, &msg);
                    }
                }
                Action::FolderSyncRename => {
                    if let Some(msg) = decode::<RemoteRename>(action, data) {
                        FolderOperator.apply_rename(ctx, &msg).await;
                    }
                }
                Action::FolderSyncMtime => {
                    if let Some(msg) = decode::<RemoteMtime>(action, data) {
                        FolderOperator.apply_mtime(ctx, &msg).await;
                    }
                }

                Action::NoteSyncEnd | Action::FileSyncEnd | Action::SettingSyncEnd | Action::FolderSyncEnd => {
                    if let (Some(domain), Some(end)) = (action.domain(), decode::<SyncEnd>(action, data)) {
                        self.handle_sync_end(domain, end).await;
                    }
                }

                other => debug!("Ignoring outbound-only action {} from server", other),
            }

            if action.is_counted_instruction() {
                if let Some(domain) = action.domain() {
                    ctx.cycle.complete_task(domain);
                }
            }
        }
        .boxed()
    }

    /// Apply inlined instructions one at a time, then record the domain as ended.
    async fn handle_sync_end(&self, domain: Domain, mut end: SyncEnd) {
        let ctx = &self.ctx;
        let inline = std::mem::take(&mut end.messages);
        debug!(
            "{:?} sync end: {} tasks, {} inlined",
            domain,
            end.total_tasks(),
            inline.len()
        );
        for message in inline {
            match Action::parse(&message.action) {
                Some(action) if !self.is_foreign(&message.data) => self.dispatch(action, message.data).await,
                Some(_) => {}
                None => warn!("Unknown inlined action {}", message.action),
            }
            tokio::time::sleep(ctx.timings.inline_message_yield).await;
        }
        if !ctx.cycle.is_active(domain) {
            debug!("{:?} end arrived outside a cycle", domain);
            ctx.epochs.advance(domain, end.last_time);
        } else {
            ctx.cycle.mark_ended(domain, &end);
        }
        if domain == Domain::Config {
            ConfigOperator.prune_empty_dirs(ctx).await;
        }
    }

    // ==================== Local events ====================

    /// A change reported by the host watcher.
    pub async fn on_local_event(&self, event: LocalEvent) {
        let ctx = &*self.ctx;
        let config_dir = ctx.config_dir().to_string();
        match event {
            LocalEvent::Created { path, is_dir } => {
                if let Some(entity) = Entity::classify(&path, is_dir, &config_dir) {
                    operator_for(entity.domain()).local_change(ctx, &entity, true).await;
                }
            }
            LocalEvent::Modified { path } => {
                let is_dir = ctx.fs.stat(&path).await.map(|s| s.is_dir).unwrap_or(false);
                if let Some(entity) = Entity::classify(&path, is_dir, &config_dir) {
                    operator_for(entity.domain()).local_change(ctx, &entity, true).await;
                }
            }
            LocalEvent::Deleted { path } => {
                let is_dir = ctx.folder_hashes.get(&path).is_some();
                if let Some(entity) = Entity::classify(&path, is_dir, &config_dir) {
                    operator_for(entity.domain()).local_delete(ctx, &entity, true).await;
                }
            }
            LocalEvent::Renamed { from, to, is_dir } => {
                let old = Entity::classify(&from, is_dir, &config_dir);
                let new = Entity::classify(&to, is_dir, &config_dir);
                match (old, new) {
                    (Some(old), Some(new)) if old.domain() == new.domain() => {
                        operator_for(new.domain())
                            .local_rename(ctx, old.path(), &new, true)
                            .await;
                    }
                    (old, new) => {
                        if let Some(old) = old {
                            operator_for(old.domain()).local_delete(ctx, &old, true).await;
                        }
                        if let Some(new) = new {
                            operator_for(new.domain()).local_change(ctx, &new, true).await;
                        }
                    }
                }
            }
            LocalEvent::Raw { path } => {
                let Some(entity @ Entity::ConfigFile(_)) = Entity::classify(&path, false, &config_dir) else {
                    return;
                };
                if ctx.is_excluded(&entity) {
                    return;
                }
                if ctx.exists(&path).await {
                    ConfigOperator.local_change(ctx, &entity, true).await;
                } else {
                    ConfigOperator.local_delete(ctx, &entity, true).await;
                }
            }
        }
    }

    // ==================== Maintenance ====================

    /// Ask the server to drop its config copy and forget ours.
    pub async fn clear_remote_config(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.send(Action::SettingClear, &json!({ "vault": ctx.vault() }), None)
            .await?;
        ConfigOperator.apply_clear(ctx);
        Ok(())
    }

    /// Push host virtual items that changed since the last poll.
    pub async fn poll_virtual_items(&self) {
        ConfigOperator.poll_virtual_items(&self.ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoticeLevel;
    use crate::fs::{InMemoryFs, WriteTimes};
    use crate::kv::MemoryKv;
    use crate::transport::MemoryConnection;
    use crate::virtual_items::InMemoryVirtualItems;
    use std::sync::Mutex;

    struct Fixture {
        engine: SyncEngine,
        fs: Arc<InMemoryFs>,
        conn: Arc<MemoryConnection>,
        events: Arc<Mutex<Vec<SyncEvent>>>,
        _subscription: crate::events::Subscription,
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            vault: "v".into(),
            config_sync_enabled: true,
            startup_delay_ms: 0,
            ..Default::default()
        }
    }

    fn fixture_with(settings: SyncSettings) -> Fixture {
        let fs = Arc::new(InMemoryFs::new());
        let conn = Arc::new(MemoryConnection::new());
        let mut timings = EngineTimings::default();
        timings.session_idle_timeout = Duration::from_secs(1);
        let engine = SyncEngine::builder(settings, fs.clone(), Arc::new(MemoryKv::new()), conn.clone())
            .timings(timings)
            .virtual_items(Arc::new(InMemoryVirtualItems::new()))
            .build();
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = events.clone();
            engine.events().subscribe(move |e| events.lock().unwrap().push(e))
        };
        Fixture {
            engine,
            fs,
            conn,
            events,
            _subscription: subscription,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings())
    }

    fn frame(action: &str, data: Value) -> String {
        format!("{}|{}", action, json!({ "code": 1, "msg": "ok", "data": data }))
    }

    fn end(last_time: i64) -> Value {
        json!({ "lastTime": last_time })
    }

    async fn end_all(f: &Fixture, last_time: i64) {
        for action in ["FolderSyncEnd", "NoteSyncEnd", "FileSyncEnd", "SettingSyncEnd"] {
            f.engine.handle_text(&frame(action, end(last_time))).await;
        }
    }

    // ==================== Starting a cycle ====================

    #[tokio::test]
    async fn test_sync_refused_while_disconnected() {
        let f = fixture();
        f.conn.set_authenticated(false);
        assert_eq!(
            f.engine.handle_sync(false, SyncMode::Auto).await,
            SyncStartOutcome::NotConnected
        );
        assert!(f.conn.texts().is_empty());
    }

    #[tokio::test]
    async fn test_requests_sent_folders_first() {
        let f = fixture();
        f.fs.write("a.md", b"hello", None).await.unwrap();
        f.fs.write("img/p.png", b"png", None).await.unwrap();
        f.fs.write(".obsidian/app.json", b"{}", None).await.unwrap();
        f.engine.initialize_stores().await.unwrap();

        assert_eq!(
            f.engine.handle_sync(false, SyncMode::Auto).await,
            SyncStartOutcome::Started
        );

        assert_eq!(f.conn.actions(), vec!["FolderSync", "NoteSync", "FileSync", "SettingSync"]);
        let notes = &f.conn.payloads(Action::NoteSync)[0];
        assert_eq!(notes["notes"][0]["path"], json!("a.md"));
        assert_eq!(notes["lastTime"], json!(0));
        let files = &f.conn.payloads(Action::FileSync)[0];
        assert_eq!(files["files"][0]["path"], json!("img/p.png"));
        let config = &f.conn.payloads(Action::SettingSync)[0];
        assert_eq!(config["cover"], json!(true));
        assert_eq!(config["settings"][0]["path"], json!("app.json"));
        assert!(!f.engine.context().watch_enabled());
    }

    #[tokio::test]
    async fn test_second_sync_waits_for_first() {
        let f = fixture();
        f.engine.handle_sync(false, SyncMode::Auto).await;
        assert_eq!(
            f.engine.handle_sync(false, SyncMode::Auto).await,
            SyncStartOutcome::PreviousSyncPending
        );
        let events = f.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Notice { level: NoticeLevel::Warning, message } if message.contains("Previous sync")
        )));
    }

    #[tokio::test]
    async fn test_cloud_preview_skips_file_domain() {
        let mut settings = settings();
        settings.cloud_preview = true;
        settings.config_sync_enabled = false;
        let f = fixture_with(settings);
        f.engine.handle_sync(false, SyncMode::Auto).await;
        assert_eq!(f.conn.actions(), vec!["FolderSync", "NoteSync"]);
    }

    #[tokio::test]
    async fn test_config_mode_only_sends_settings() {
        let f = fixture();
        f.engine.handle_sync(false, SyncMode::Config).await;
        assert_eq!(f.conn.actions(), vec!["SettingSync"]);
    }

    #[tokio::test]
    async fn test_incremental_sync_skips_old_entries() {
        let f = fixture();
        f.fs.write("old.md", b"o", Some(WriteTimes::new(100, 100))).await.unwrap();
        f.fs.write("new.md", b"n", Some(WriteTimes::new(900, 900))).await.unwrap();
        f.engine.initialize_stores().await.unwrap();
        f.engine.context().epochs.set(Domain::Note, 500);

        f.engine.handle_sync(true, SyncMode::Note).await;

        let notes = &f.conn.payloads(Action::NoteSync)[0];
        assert_eq!(notes["lastTime"], json!(500));
        let paths: Vec<&Value> = notes["notes"].as_array().unwrap().iter().map(|n| &n["path"]).collect();
        assert_eq!(paths, vec![&json!("new.md")]);
    }

    #[tokio::test]
    async fn test_vanished_note_without_delete_tracking_is_missing() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine.context().file_hashes.set_hash("gone.md", "1");

        f.engine.handle_sync(true, SyncMode::Note).await;

        let notes = &f.conn.payloads(Action::NoteSync)[0];
        assert_eq!(notes["missingNotes"][0]["path"], json!("gone.md"));
        assert!(notes.get("delNotes").is_none());
        assert_eq!(f.engine.context().file_hashes.get_hash("gone.md").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_vanished_note_with_delete_tracking_is_deleted() {
        let mut settings = settings();
        settings.offline_delete_sync = true;
        let f = fixture_with(settings);
        f.engine.initialize_stores().await.unwrap();
        f.engine.context().file_hashes.set_hash("gone.md", "1");

        f.engine.handle_sync(true, SyncMode::Note).await;

        let notes = &f.conn.payloads(Action::NoteSync)[0];
        assert_eq!(notes["delNotes"][0]["path"], json!("gone.md"));
        assert!(notes.get("missingNotes").is_none());
        assert_eq!(f.engine.context().file_hashes.get_hash("gone.md"), None);
    }

    #[test]
    fn test_full_sync_without_delete_tracking_reports_nothing() {
        assert_eq!(split_vanished(vec!["a.md".into()], false, false), (None, None));
        assert_eq!(split_vanished(Vec::new(), true, true), (None, None));
    }

    // ==================== Completion ====================

    #[tokio::test(start_paused = true)]
    async fn test_cycle_completes_after_every_domain_ends() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine.handle_sync(false, SyncMode::Auto).await;

        f.engine.handle_text(&frame("NoteSyncEnd", end(10))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!f.engine.context().watch_enabled());

        f.engine.handle_text(&frame("FolderSyncEnd", end(11))).await;
        f.engine.handle_text(&frame("FileSyncEnd", end(12))).await;
        f.engine.handle_text(&frame("SettingSyncEnd", end(13))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let ctx = f.engine.context();
        assert!(ctx.watch_enabled());
        assert_eq!(ctx.epochs.get(Domain::Note), 10);
        assert_eq!(ctx.epochs.get(Domain::Config), 13);
        assert!(f.events.lock().unwrap().contains(&SyncEvent::SyncCompleted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_holds_while_send_buffer_is_full() {
        let f = fixture();
        f.engine.handle_sync(false, SyncMode::Auto).await;
        f.conn.set_buffered(10);
        end_all(&f, 5).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!f.engine.context().watch_enabled());

        f.conn.set_buffered(0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.engine.context().watch_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_expires_without_write() {
        let f = fixture();
        f.engine.handle_sync(false, SyncMode::Auto).await;
        f.engine
            .handle_text(&frame(
                "FileSyncUpdate",
                json!({ "path": "big.bin", "size": 300, "mtime": 1, "lastTime": 3 }),
            ))
            .await;
        f.engine
            .handle_text(&frame(
                "FileSyncChunkDownload",
                json!({
                    "path": "big.bin",
                    "sessionId": "123e4567-e89b-12d3-a456-426614174000",
                    "totalChunks": 3,
                    "chunkSize": 100,
                    "size": 300
                }),
            ))
            .await;
        end_all(&f, 5).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!f.engine.context().watch_enabled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.engine.context().watch_enabled());
        assert!(!f.fs.exists("big.bin").await.unwrap());
        assert_eq!(f.engine.context().downloads.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_cycle() {
        let f = fixture();
        f.engine.handle_sync(false, SyncMode::Auto).await;
        f.engine.on_disconnected();
        assert!(f.engine.context().watch_enabled());
        assert!(!f.engine.context().cycle.is_running());
        assert_eq!(
            f.engine.handle_sync(false, SyncMode::Auto).await,
            SyncStartOutcome::Started
        );
    }

    // ==================== Dispatch ====================

    #[tokio::test]
    async fn test_inline_instructions_applied_before_end() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine.handle_sync(false, SyncMode::Note).await;
        let data = json!({
            "lastTime": 20,
            "needModifyCount": 1,
            "messages": [{
                "action": "NoteSyncModify",
                "data": { "path": "n.md", "content": "remote", "contentHash": fingerprint_text("remote"), "mtime": 5 }
            }]
        });
        f.engine.handle_text(&frame("NoteSyncEnd", data)).await;

        assert_eq!(f.fs.read_text("n.md").await.unwrap(), "remote");
        let tasks = f.engine.context().cycle.tasks(Domain::Note);
        assert!(tasks.ended);
        assert_eq!(tasks.completed, 1);
        assert_eq!(tasks.total(), 1);
    }

    #[tokio::test]
    async fn test_message_for_other_vault_is_dropped() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine
            .handle_text(&frame(
                "NoteSyncModify",
                json!({ "vault": "other", "path": "x.md", "content": "x" }),
            ))
            .await;
        assert!(!f.fs.exists("x.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_envelope_becomes_notice() {
        let f = fixture();
        let raw = format!(
            "NoteSyncModify|{}",
            json!({ "code": 500, "msg": "boom", "data": { "path": "x.md", "content": "x" } })
        );
        f.engine.handle_text(&raw).await;
        assert!(!f.fs.exists("x.md").await.unwrap());
        let events = f.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Notice { level: NoticeLevel::Error, message } if message.contains("boom")
        )));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let f = fixture();
        f.engine.handle_text("no separator").await;
        f.engine.handle_text("NoteSyncModify|{not json").await;
        f.engine.handle_text("Bogus|{}").await;
        f.engine.handle_binary(b"9").await;
        f.engine.handle_binary(b"99payload").await;
        assert!(f.conn.texts().is_empty());
    }

    #[tokio::test]
    async fn test_live_modify_advances_epoch_outside_cycle() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine
            .handle_text(&frame(
                "NoteSyncModify",
                json!({ "path": "live.md", "content": "x", "contentHash": fingerprint_text("x"), "mtime": 3, "lastTime": 99 }),
            ))
            .await;
        assert_eq!(f.engine.context().epochs.get(Domain::Note), 99);
        let received: Vec<_> = f
            .engine
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.kind == LogType::Receive)
            .collect();
        assert_eq!(received[0].path.as_deref(), Some("live.md"));
    }

    #[tokio::test]
    async fn test_setting_clear_resets_config_ledger() {
        let f = fixture();
        f.engine.context().config_hashes.set_hash("app.json", "1");
        f.engine.context().epochs.set(Domain::Config, 50);
        f.engine.clear_remote_config().await.unwrap();
        assert_eq!(f.conn.actions(), vec!["SettingClear"]);
        assert!(f.engine.context().config_hashes.is_empty());
        assert_eq!(f.engine.context().epochs.get(Domain::Config), 0);
    }

    // ==================== Local events ====================

    #[tokio::test]
    async fn test_local_events_route_by_entity() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.fs.write("a.md", b"a", None).await.unwrap();
        f.fs.write("pic.png", b"p", None).await.unwrap();
        f.fs.mkdir("dir").await.unwrap();
        f.fs.write(".obsidian/app.json", b"{}", None).await.unwrap();

        f.engine
            .on_local_event(LocalEvent::Created { path: "a.md".into(), is_dir: false })
            .await;
        f.engine
            .on_local_event(LocalEvent::Modified { path: "pic.png".into() })
            .await;
        f.engine
            .on_local_event(LocalEvent::Created { path: "dir".into(), is_dir: true })
            .await;
        f.engine
            .on_local_event(LocalEvent::Raw { path: ".obsidian/app.json".into() })
            .await;
        f.engine
            .on_local_event(LocalEvent::Raw { path: ".obsidian/workspace.json".into() })
            .await;

        assert_eq!(
            f.conn.actions(),
            vec!["NoteModify", "FileUploadCheck", "FolderModify", "SettingModify"]
        );
    }

    #[tokio::test]
    async fn test_rename_across_domains_is_delete_plus_create() {
        let f = fixture();
        f.engine.initialize_stores().await.unwrap();
        f.engine.context().file_hashes.set_hash("a.md", "1");
        f.fs.write("a.txt", b"a", None).await.unwrap();

        f.engine
            .on_local_event(LocalEvent::Renamed {
                from: "a.md".into(),
                to: "a.txt".into(),
                is_dir: false,
            })
            .await;

        assert_eq!(f.conn.actions(), vec!["NoteDelete", "FileUploadCheck"]);
    }

    #[tokio::test]
    async fn test_seeded_stores_reflect_disk() {
        let f = fixture();
        f.fs.write("d/a.md", b"a", None).await.unwrap();
        f.fs.write(".obsidian/app.json", b"{}", None).await.unwrap();
        f.engine.initialize_stores().await.unwrap();

        let ctx = f.engine.context();
        assert_eq!(ctx.file_hashes.get_hash("d/a.md"), Some(fingerprint_text("a")));
        assert_eq!(ctx.folder_hashes.get_hash("d"), Some(path_hash("d")));
        assert_eq!(ctx.config_hashes.get_hash("app.json"), Some(fingerprint_text("{}")));
        assert!(ctx.file_hashes.is_ready());
    }
}
