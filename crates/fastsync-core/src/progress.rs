//! Per-cycle task counters, chunk counters, weighted progress and the completion gate.

use crate::protocol::messages::SyncEnd;
use crate::settings::Domain;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a sync cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Snapshotting,
    RequestsSent,
    AwaitingDomainEnds,
    ReconcilingInstructions,
    AwaitingTransferDrain,
    Completed,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Snapshotting => "snapshotting",
            CyclePhase::RequestsSent => "requests-sent",
            CyclePhase::AwaitingDomainEnds => "awaiting-domain-ends",
            CyclePhase::ReconcilingInstructions => "reconciling",
            CyclePhase::AwaitingTransferDrain => "awaiting-transfer-drain",
            CyclePhase::Completed => "completed",
        }
    }

    pub fn is_running(self) -> bool {
        !matches!(self, CyclePhase::Idle | CyclePhase::Completed)
    }
}

fn weight(domain: Domain) -> f64 {
    match domain {
        Domain::Note => 0.3,
        Domain::File => 0.4,
        Domain::Config => 0.15,
        Domain::Folder => 0.15,
    }
}

/// Discrete reconciliation tasks of one domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounters {
    pub need_upload: u64,
    pub need_modify: u64,
    pub need_sync_mtime: u64,
    pub need_delete: u64,
    pub completed: u64,
    /// The domain's end-of-sync summary arrived
    pub ended: bool,
}

impl TaskCounters {
    pub fn total(&self) -> u64 {
        self.need_upload + self.need_modify + self.need_sync_mtime + self.need_delete
    }
}

/// Chunk-transfer units, shared with the uploader and download sessions.
#[derive(Debug, Default)]
pub struct TransferCounters {
    upload_total: AtomicU64,
    upload_sent: AtomicU64,
    download_total: AtomicU64,
    download_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub upload_total: u64,
    pub upload_sent: u64,
    pub download_total: u64,
    pub download_received: u64,
}

impl TransferSnapshot {
    pub fn expected(&self) -> u64 {
        self.upload_total + self.download_total
    }

    pub fn done(&self) -> u64 {
        self.upload_sent + self.download_received
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(n)));
}

impl TransferCounters {
    pub fn add_upload(&self, chunks: u64) {
        self.upload_total.fetch_add(chunks, Ordering::SeqCst);
    }

    pub fn chunk_sent(&self) {
        self.upload_sent.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop chunks of an upload that will never be sent.
    pub fn abandon_upload(&self, remaining: u64) {
        saturating_sub(&self.upload_total, remaining);
    }

    pub fn add_download(&self, chunks: u64) {
        self.download_total.fetch_add(chunks, Ordering::SeqCst);
    }

    pub fn chunk_received(&self) {
        self.download_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn abandon_download(&self, remaining: u64) {
        saturating_sub(&self.download_total, remaining);
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            upload_total: self.upload_total.load(Ordering::SeqCst),
            upload_sent: self.upload_sent.load(Ordering::SeqCst),
            download_total: self.download_total.load(Ordering::SeqCst),
            download_received: self.download_received.load(Ordering::SeqCst),
        }
    }

    pub fn reset(&self) {
        self.upload_total.store(0, Ordering::SeqCst);
        self.upload_sent.store(0, Ordering::SeqCst);
        self.download_total.store(0, Ordering::SeqCst);
        self.download_received.store(0, Ordering::SeqCst);
    }
}

/// Everything the completion gate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInput {
    pub all_domains_ended: bool,
    pub chunks_done: u64,
    pub chunks_expected: u64,
    pub active_downloads: usize,
    /// Uploads queued or running
    pub pending_uploads: usize,
    /// Remote instructions still finishing in the background, such as folder deletes
    pub deferred_tasks: usize,
    pub buffered_amount: usize,
}

/// A cycle is complete only when every condition holds at once.
pub fn is_cycle_complete(input: &GateInput) -> bool {
    input.all_domains_ended
        && input.chunks_done >= input.chunks_expected
        && input.active_downloads == 0
        && input.pending_uploads == 0
        && input.deferred_tasks == 0
        && input.buffered_amount == 0
}

#[derive(Debug)]
struct CycleState {
    phase: CyclePhase,
    generation: u64,
    incremental: bool,
    active: Vec<Domain>,
    tasks: HashMap<Domain, TaskCounters>,
    /// Epochs from end messages, committed when the cycle completes
    pending_epochs: HashMap<Domain, i64>,
}

/// Bookkeeping for the current sync cycle.
#[derive(Debug)]
pub struct CycleTracker {
    state: Mutex<CycleState>,
    pub transfers: TransferCounters,
}

impl Default for CycleTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(CycleState {
                phase: CyclePhase::Idle,
                generation: 0,
                incremental: false,
                active: Vec::new(),
                tasks: HashMap::new(),
                pending_epochs: HashMap::new(),
            }),
            transfers: TransferCounters::default(),
        }
    }
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a cycle over `active` domains. Returns the cycle generation.
    pub fn begin(&self, active: Vec<Domain>, incremental: bool) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.phase = CyclePhase::Snapshotting;
        state.incremental = incremental;
        state.tasks = active.iter().map(|d| (*d, TaskCounters::default())).collect();
        state.active = active;
        state.pending_epochs.clear();
        self.transfers.reset();
        state.generation
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn phase(&self) -> CyclePhase {
        self.lock().phase
    }

    pub fn set_phase(&self, phase: CyclePhase) {
        self.lock().phase = phase;
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    pub fn is_incremental(&self) -> bool {
        self.lock().incremental
    }

    pub fn active_domains(&self) -> Vec<Domain> {
        self.lock().active.clone()
    }

    pub fn is_active(&self, domain: Domain) -> bool {
        self.lock().active.contains(&domain)
    }

    pub fn tasks(&self, domain: Domain) -> TaskCounters {
        self.lock().tasks.get(&domain).copied().unwrap_or_default()
    }

    /// Record a domain's end-of-sync summary.
    pub fn mark_ended(&self, domain: Domain, end: &SyncEnd) {
        let mut state = self.lock();
        if !state.active.contains(&domain) {
            return;
        }
        let counters = state.tasks.entry(domain).or_default();
        counters.need_upload = end.need_upload_count;
        counters.need_modify = end.need_modify_count;
        counters.need_sync_mtime = end.need_sync_mtime_count;
        counters.need_delete = end.need_delete_count;
        counters.ended = true;
        state.pending_epochs.insert(domain, end.last_time);
        let all_ended = state.active.iter().all(|d| state.tasks.get(d).map(|t| t.ended).unwrap_or(false));
        if state.phase.is_running() {
            state.phase = if all_ended {
                CyclePhase::AwaitingTransferDrain
            } else {
                CyclePhase::ReconcilingInstructions
            };
        }
    }

    pub fn complete_task(&self, domain: Domain) {
        let mut state = self.lock();
        if let Some(counters) = state.tasks.get_mut(&domain) {
            counters.completed += 1;
        }
    }

    pub fn all_ended(&self) -> bool {
        let state = self.lock();
        state
            .active
            .iter()
            .all(|d| state.tasks.get(d).map(|t| t.ended).unwrap_or(false))
    }

    /// Take the epochs accumulated during the cycle.
    pub fn take_pending_epochs(&self) -> HashMap<Domain, i64> {
        std::mem::take(&mut self.lock().pending_epochs)
    }

    /// Weighted progress in percent over the active domains.
    ///
    /// A domain counts zero until its end summary arrives. The file domain also counts
    /// chunk units, with chunks still sitting in the send buffer not counted as sent.
    pub fn progress(&self, buffered_amount: usize, chunk_size: usize) -> f64 {
        let state = self.lock();
        if state.active.is_empty() {
            return 0.0;
        }
        let transfers = self.transfers.snapshot();
        let weight_sum: f64 = state.active.iter().map(|d| weight(*d)).sum();
        let mut weighted = 0.0;
        for domain in &state.active {
            let counters = state.tasks.get(domain).copied().unwrap_or_default();
            if !counters.ended {
                continue;
            }
            let (done, total) = if *domain == Domain::File {
                let unsent = (buffered_amount / chunk_size.max(1)) as u64;
                let sent = transfers.upload_sent.saturating_sub(unsent);
                (
                    counters.completed + sent + transfers.download_received,
                    counters.total() + transfers.expected(),
                )
            } else {
                (counters.completed, counters.total())
            };
            let ratio = if total == 0 {
                1.0
            } else {
                (done as f64 / total as f64).min(1.0)
            };
            weighted += weight(*domain) * ratio;
        }
        (weighted / weight_sum * 100.0).clamp(0.0, 100.0)
    }

    /// Leave the cycle; any poller holding the old generation stops.
    pub fn abandon(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.phase = CyclePhase::Idle;
        state.active.clear();
        state.tasks.clear();
        state.pending_epochs.clear();
        self.transfers.reset();
    }

    /// Mark completed and reset counters.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.phase = CyclePhase::Completed;
        state.tasks.clear();
        state.active.clear();
        self.transfers.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end(modify: u64) -> SyncEnd {
        SyncEnd {
            last_time: 42,
            need_modify_count: modify,
            ..Default::default()
        }
    }

    fn gate() -> GateInput {
        GateInput {
            all_domains_ended: true,
            chunks_done: 3,
            chunks_expected: 3,
            active_downloads: 0,
            pending_uploads: 0,
            deferred_tasks: 0,
            buffered_amount: 0,
        }
    }

    // ==================== Completion gate ====================

    #[test]
    fn test_gate_requires_every_condition() {
        assert!(is_cycle_complete(&gate()));
        assert!(!is_cycle_complete(&GateInput {
            all_domains_ended: false,
            ..gate()
        }));
        assert!(!is_cycle_complete(&GateInput {
            chunks_done: 2,
            ..gate()
        }));
        assert!(!is_cycle_complete(&GateInput {
            active_downloads: 1,
            ..gate()
        }));
        assert!(!is_cycle_complete(&GateInput {
            pending_uploads: 1,
            ..gate()
        }));
        assert!(!is_cycle_complete(&GateInput {
            deferred_tasks: 1,
            ..gate()
        }));
        assert!(!is_cycle_complete(&GateInput {
            buffered_amount: 1,
            ..gate()
        }));
    }

    // ==================== Progress ====================

    #[test]
    fn test_domains_count_zero_until_ended() {
        let tracker = CycleTracker::new();
        tracker.begin(vec![Domain::Note, Domain::Folder], false);
        assert_eq!(tracker.progress(0, 1024), 0.0);

        tracker.mark_ended(Domain::Folder, &end(0));
        let expected = 0.15 / 0.45 * 100.0;
        assert!((tracker.progress(0, 1024) - expected).abs() < 1e-9);
        assert!(!tracker.all_ended());

        tracker.mark_ended(Domain::Note, &end(2));
        tracker.complete_task(Domain::Note);
        let expected = (0.15 + 0.3 * 0.5) / 0.45 * 100.0;
        assert!((tracker.progress(0, 1024) - expected).abs() < 1e-9);
        assert!(tracker.all_ended());
        assert_eq!(tracker.phase(), CyclePhase::AwaitingTransferDrain);
    }

    #[test]
    fn test_file_progress_discounts_buffered_chunks() {
        let tracker = CycleTracker::new();
        tracker.begin(vec![Domain::File], false);
        tracker.mark_ended(Domain::File, &end(0));
        tracker.transfers.add_upload(4);
        for _ in 0..4 {
            tracker.transfers.chunk_sent();
        }
        assert_eq!(tracker.progress(0, 100), 100.0);
        assert_eq!(tracker.progress(200, 100), 50.0);
    }

    #[test]
    fn test_abandoned_upload_shrinks_expected() {
        let counters = TransferCounters::default();
        counters.add_upload(3);
        counters.chunk_sent();
        counters.chunk_sent();
        counters.abandon_upload(1);
        let snap = counters.snapshot();
        assert_eq!(snap.expected(), 2);
        assert_eq!(snap.done(), 2);
        counters.abandon_upload(10);
        assert_eq!(counters.snapshot().upload_total, 0);
    }

    #[test]
    fn test_abandon_bumps_generation() {
        let tracker = CycleTracker::new();
        let generation = tracker.begin(vec![Domain::Note], true);
        assert!(tracker.is_running());
        tracker.abandon();
        assert_ne!(tracker.generation(), generation);
        assert!(!tracker.is_running());
    }

    #[test]
    fn test_epochs_collected_from_end_messages() {
        let tracker = CycleTracker::new();
        tracker.begin(vec![Domain::Note], false);
        tracker.mark_ended(Domain::Note, &end(0));
        tracker.mark_ended(Domain::Config, &end(0));
        let epochs = tracker.take_pending_epochs();
        assert_eq!(epochs.get(&Domain::Note), Some(&42));
        assert!(!epochs.contains_key(&Domain::Config));
    }
}
