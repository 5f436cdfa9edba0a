//! Chunked binary transfer.
//!
//! Outbound: [`UploadQueue`] runs uploads on a small worker pool, each splitting the file
//! into fixed-size [`ChunkFrame`]s. [`UploadTracker`] holds a cancellation flag per path
//! that is checked before every chunk.
//!
//! Inbound: [`DownloadSessions`] reassembles chunks by index. A session is only complete
//! when every index arrived, and the result is discarded unless its length matches the
//! announced size.

use crate::fs::FileSystem;
use crate::progress::CycleTracker;
use crate::protocol::ChunkFrame;
use crate::protocol::messages::{ChunkDownloadMeta, FileUpdate};
use crate::sync_log::{LogEntry, LogStatus, LogType, SyncLog};
use crate::transport::Outbox;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of chunks needed for `size` bytes.
pub fn chunk_count(size: usize, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size.max(1)) as u32
}

/// Byte range of every chunk, in index order.
pub fn chunk_ranges(size: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..chunk_count(size, chunk_size) as usize).map(move |i| {
        let start = i * chunk_size;
        start..(start + chunk_size).min(size)
    })
}

// ==================== Uploads ====================

/// Paths with an upload in flight, each with its cancellation flag.
#[derive(Clone, Default)]
pub struct UploadTracker {
    uploads: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new upload of `path`. A previous upload of the same path is cancelled.
    pub fn begin(&self, path: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let previous = self
            .uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), Arc::clone(&flag));
        if let Some(previous) = previous {
            previous.store(true, Ordering::SeqCst);
        }
        flag
    }

    /// Cancel the upload of `path`. Returns false if none was in flight.
    pub fn cancel(&self, path: &str) -> bool {
        let removed = self
            .uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        match removed {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_uploading(&self, path: &str) -> bool {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, flag) in drained {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, path: &str, flag: &Arc<AtomicBool>) {
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        if uploads.get(path).is_some_and(|f| Arc::ptr_eq(f, flag)) {
            uploads.remove(path);
        }
    }
}

/// One server-approved upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Path as sent on the wire
    pub path: String,
    /// Location in the document store
    pub storage_path: String,
    pub session_id: String,
    pub chunk_size: usize,
    cancelled: Arc<AtomicBool>,
    generation: u64,
}

impl UploadJob {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Reads a file and streams its chunks.
pub struct ChunkUploader {
    pub fs: Arc<dyn FileSystem>,
    pub outbox: Outbox,
    pub tracker: UploadTracker,
    pub cycle: Arc<CycleTracker>,
    pub log: Arc<SyncLog>,
    pub default_chunk_size: usize,
    pub chunk_yield: Duration,
}

/// How an upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Sent(u32),
    Cancelled { sent: u32 },
    Failed { sent: u32 },
}

impl ChunkUploader {
    pub async fn run(&self, job: &UploadJob) -> UploadOutcome {
        let outcome = self.stream(job).await;
        self.tracker.finish(&job.path, &job.cancelled);
        let entry = LogEntry::new(LogType::Send, "FileUpload", LogStatus::Success)
            .with_id(&job.session_id)
            .with_path(&job.path);
        match outcome {
            UploadOutcome::Sent(n) => {
                info!("Uploaded {} ({} chunks)", job.path, n);
                self.log.add_or_update(entry.with_progress(100));
            }
            UploadOutcome::Cancelled { sent } => {
                info!("Upload of {} cancelled after {} chunks", job.path, sent);
                self.log.add_or_update(entry.with_message("Cancelled"));
            }
            UploadOutcome::Failed { sent } => {
                let mut entry = entry.with_message(format!("Failed after {} chunks", sent));
                entry.status = LogStatus::Error;
                self.log.add_or_update(entry);
            }
        }
        outcome
    }

    async fn stream(&self, job: &UploadJob) -> UploadOutcome {
        if job.is_cancelled() {
            return UploadOutcome::Cancelled { sent: 0 };
        }
        let content = match self.fs.read(&job.storage_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read {} for upload: {}", job.storage_path, e);
                return UploadOutcome::Failed { sent: 0 };
            }
        };
        let chunk_size = if job.chunk_size == 0 {
            self.default_chunk_size
        } else {
            job.chunk_size
        };
        let total = chunk_count(content.len(), chunk_size);
        let counts = self.cycle.generation() == job.generation;
        if counts {
            self.cycle.transfers.add_upload(total as u64);
        }
        self.log.add_or_update(
            LogEntry::new(LogType::Send, "FileUpload", LogStatus::Pending)
                .with_id(&job.session_id)
                .with_path(&job.path)
                .with_progress(0),
        );

        let mut sent = 0u32;
        for range in chunk_ranges(content.len(), chunk_size) {
            let abandon = |sent: u32| {
                if counts && self.cycle.generation() == job.generation {
                    self.cycle.transfers.abandon_upload((total - sent) as u64);
                }
            };
            if self.outbox.wait_for_drain().await.is_err() {
                abandon(sent);
                return UploadOutcome::Failed { sent };
            }
            if job.is_cancelled() {
                abandon(sent);
                return UploadOutcome::Cancelled { sent };
            }
            let frame = ChunkFrame {
                session_id: &job.session_id,
                index: sent,
                data: &content[range],
            };
            let result = match frame.encode() {
                Ok(bytes) => self.outbox.send_binary_now(bytes).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = result {
                warn!("Chunk {} of {} failed: {}", sent, job.path, e);
                abandon(sent);
                return UploadOutcome::Failed { sent };
            }
            sent += 1;
            if counts && self.cycle.generation() == job.generation {
                self.cycle.transfers.chunk_sent();
            }
            if total > 1 {
                self.log.add_or_update(
                    LogEntry::new(LogType::Send, "FileUpload", LogStatus::Pending)
                        .with_id(&job.session_id)
                        .with_progress((sent * 100 / total) as u8),
                );
            }
            if self.chunk_yield.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.chunk_yield).await;
            }
        }
        UploadOutcome::Sent(sent)
    }
}

struct QueueState {
    pending: VecDeque<UploadJob>,
    active: usize,
}

struct QueueInner {
    uploader: ChunkUploader,
    workers: usize,
    state: Mutex<QueueState>,
}

/// FIFO of uploads served by a fixed number of workers.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(uploader: ChunkUploader, workers: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                uploader,
                workers: workers.max(1),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    active: 0,
                }),
            }),
        }
    }

    pub fn tracker(&self) -> &UploadTracker {
        &self.inner.uploader.tracker
    }

    /// Queue an upload of `path` into an open server session.
    pub fn enqueue(&self, path: &str, storage_path: &str, session_id: &str, chunk_size: usize) {
        let job = UploadJob {
            path: path.to_string(),
            storage_path: storage_path.to_string(),
            session_id: session_id.to_string(),
            chunk_size,
            cancelled: self.inner.uploader.tracker.begin(path),
            generation: self.inner.uploader.cycle.generation(),
        };
        debug!("Queued upload of {} (session {})", path, session_id);
        self.lock().pending.push_back(job);
        self.pump();
    }

    /// Uploads queued or running.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.active
    }

    /// Drop queued uploads and cancel running ones.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut self.lock().pending);
        if !dropped.is_empty() {
            debug!("Dropped {} queued uploads", dropped.len());
        }
        self.inner.uploader.tracker.cancel_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pump(&self) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.active >= self.inner.workers {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.active += 1;
                job
            };
            let queue = self.clone();
            tokio::spawn(async move {
                queue.inner.uploader.run(&job).await;
                queue.lock().active -= 1;
                queue.pump();
            });
        }
    }
}

// ==================== Downloads ====================

/// Key of the session created when an update is announced, before chunk metadata.
pub fn provisional_key(path: &str) -> String {
    format!("temp_{}", path)
}

#[derive(Debug)]
struct DownloadSession {
    path: String,
    ctime: i64,
    mtime: i64,
    last_time: i64,
    total_chunks: Option<u32>,
    size: u64,
    chunks: HashMap<u32, Vec<u8>>,
    buffered: usize,
    touched: Instant,
}

impl DownloadSession {
    fn remaining(&self) -> u64 {
        self.total_chunks
            .map(|t| (t as u64).saturating_sub(self.chunks.len() as u64))
            .unwrap_or(0)
    }
}

/// A fully reassembled download, ready to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub last_time: i64,
    pub content: Vec<u8>,
    /// Bytes released by [`DownloadSessions::finish`] once written
    pub buffered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// No session with that id
    UnknownSession,
    /// Index outside the announced range
    Ignored,
    Stored { received: u32, total: u32 },
    Complete(CompletedDownload),
    /// Session torn down without writing
    Failed { path: String, reason: String },
}

/// A session removed by the idle sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredDownload {
    pub path: String,
    /// Announced chunks that never arrived
    pub remaining: u64,
}

/// All in-progress downloads keyed by session id (or provisional key).
#[derive(Default)]
pub struct DownloadSessions {
    sessions: Mutex<HashMap<String, DownloadSession>>,
    buffered: AtomicUsize,
    /// Completed downloads handed out but not yet finished
    writing: AtomicUsize,
}

impl DownloadSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DownloadSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the provisional session for an announced update.
    pub fn announce(&self, update: &FileUpdate) {
        let session = DownloadSession {
            path: update.path.clone(),
            ctime: update.ctime,
            mtime: update.mtime,
            last_time: update.last_time,
            total_chunks: None,
            size: update.size,
            chunks: HashMap::new(),
            buffered: 0,
            touched: Instant::now(),
        };
        if let Some(old) = self.lock().insert(provisional_key(&update.path), session) {
            self.release(old.buffered);
        }
    }

    /// Attach chunk metadata, promoting the provisional session when there is one.
    /// A download of zero chunks completes immediately.
    pub fn promote(&self, meta: &ChunkDownloadMeta) -> ChunkOutcome {
        let mut sessions = self.lock();
        let provisional = sessions.remove(&provisional_key(&meta.path));
        let last_time = provisional.as_ref().map(|s| s.last_time).unwrap_or(0);
        let session = DownloadSession {
            path: meta.path.clone(),
            ctime: meta.ctime,
            mtime: meta.mtime,
            last_time,
            total_chunks: Some(meta.total_chunks),
            size: meta.size,
            chunks: HashMap::new(),
            buffered: 0,
            touched: Instant::now(),
        };
        if meta.total_chunks == 0 {
            return self.finalize(session);
        }
        sessions.insert(meta.session_id.clone(), session);
        ChunkOutcome::Stored {
            received: 0,
            total: meta.total_chunks,
        }
    }

    /// Store one chunk. Completes the session once every index is present.
    pub fn accept_chunk(&self, session_id: &str, index: u32, data: &[u8]) -> ChunkOutcome {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return ChunkOutcome::UnknownSession;
        };
        let Some(total) = session.total_chunks else {
            return ChunkOutcome::UnknownSession;
        };
        if index >= total {
            warn!("Chunk index {} out of range for {} ({} chunks)", index, session.path, total);
            return ChunkOutcome::Ignored;
        }
        session.touched = Instant::now();
        if let Some(old) = session.chunks.insert(index, data.to_vec()) {
            session.buffered -= old.len();
            self.release(old.len());
        }
        session.buffered += data.len();
        self.buffered.fetch_add(data.len(), Ordering::SeqCst);

        let received = session.chunks.len() as u32;
        if received < total {
            return ChunkOutcome::Stored { received, total };
        }
        match sessions.remove(session_id) {
            Some(session) => self.finalize(session),
            None => ChunkOutcome::UnknownSession,
        }
    }

    fn finalize(&self, mut session: DownloadSession) -> ChunkOutcome {
        let total = session.total_chunks.unwrap_or(0);
        let mut content = Vec::with_capacity(session.size as usize);
        for index in 0..total {
            match session.chunks.remove(&index) {
                Some(chunk) => content.extend_from_slice(&chunk),
                None => {
                    self.release(session.buffered);
                    return ChunkOutcome::Failed {
                        path: session.path,
                        reason: format!("chunk {} missing", index),
                    };
                }
            }
        }
        if content.len() as u64 != session.size {
            self.release(session.buffered);
            return ChunkOutcome::Failed {
                reason: format!("size mismatch: got {} bytes, expected {}", content.len(), session.size),
                path: session.path,
            };
        }
        self.writing.fetch_add(1, Ordering::SeqCst);
        ChunkOutcome::Complete(CompletedDownload {
            path: session.path,
            ctime: session.ctime,
            mtime: session.mtime,
            last_time: session.last_time,
            content,
            buffered: session.buffered,
        })
    }

    /// Settle a completed download after it was written (or given up on).
    pub fn finish(&self, done: &CompletedDownload) {
        self.release(done.buffered);
        let _ = self
            .writing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
    }

    /// Remove sessions that saw no activity for `timeout`.
    pub fn expire_idle(&self, timeout: Duration) -> Vec<ExpiredDownload> {
        let mut sessions = self.lock();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.touched.elapsed() >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .map(|session| {
                self.release(session.buffered);
                ExpiredDownload {
                    remaining: session.remaining(),
                    path: session.path,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions still receiving plus completed downloads not yet written.
    pub fn active(&self) -> usize {
        self.len() + self.writing.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Wait while buffered bytes exceed `ceiling`.
    pub async fn wait_for_buffer_room(&self, ceiling: usize, poll: Duration) {
        while self.buffered_bytes() > ceiling {
            tokio::time::sleep(poll).await;
        }
    }

    /// Drop every session and its buffered bytes.
    pub fn clear(&self) {
        self.lock().clear();
        self.buffered.store(0, Ordering::SeqCst);
        self.writing.store(0, Ordering::SeqCst);
    }
}
