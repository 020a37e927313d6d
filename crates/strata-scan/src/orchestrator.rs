//! Scan lifecycle: start, stop, force-reset and the read API around it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strata_analyze::{DuplicateGroup, DuplicateIndex};
use strata_core::{
    ChildListing, Entry, EntryFilter, EntryId, EntryPage, ExtensionStats, ScanConfig, ScanError,
    SessionCounters, SessionId, SessionStatus, StorageSnapshot,
};
use strata_store::{HistoryPage, StoreError, TreeStore, TreeWriter, WriterOptions};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::PathClassifier;
use crate::progress::{Baseline, ProgressReporter, ScanProgress, ScanStatusReport};
use crate::walker::{TreeWalker, WalkEnd, WalkError};

const FORCE_RESET_MESSAGE: &str = "Force reset by user";
const STOPPED_MESSAGE: &str = "Stopped by user request";

/// Final state of a session run by this orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub session: SessionId,
    pub status: SessionStatus,
    pub counters: SessionCounters,
    pub error_message: Option<String>,
    /// Rows tombstoned by the completion sweep.
    pub swept: u64,
}

/// Result of [`ScanOrchestrator::delete_entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedEntry {
    /// The entry as it was before deletion.
    pub entry: Entry,
    /// The file existed on disk and was removed.
    pub file_removed: bool,
}

struct ActiveScan {
    session: SessionId,
    cancel: CancellationToken,
    done: Receiver<ScanOutcome>,
    handle: JoinHandle<()>,
}

impl ActiveScan {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Owns the scan state machine and every operation exposed to callers.
///
/// At most one worker thread exists at a time. The database enforces the
/// same rule for `running` sessions, so a second process sharing the file
/// is rejected as well.
pub struct ScanOrchestrator {
    store: Arc<TreeStore>,
    config: RwLock<ScanConfig>,
    duplicates: DuplicateIndex,
    active: Mutex<Option<ActiveScan>>,
    reporter: Arc<Mutex<ProgressReporter>>,
    progress_tx: broadcast::Sender<ScanProgress>,
}

impl ScanOrchestrator {
    /// Open the index at `db_path` with `config` for future scans.
    pub fn open(db_path: impl AsRef<Path>, config: ScanConfig) -> Result<Self, ScanError> {
        let store = TreeStore::open(db_path)?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Wrap an already opened store.
    pub fn with_store(store: Arc<TreeStore>, config: ScanConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            store,
            config: RwLock::new(config),
            duplicates: DuplicateIndex::new(),
            active: Mutex::new(None),
            reporter: Arc::new(Mutex::new(ProgressReporter::new())),
            progress_tx,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    /// Configuration the next scan will snapshot.
    pub fn config(&self) -> ScanConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. A running scan keeps its snapshot.
    pub fn set_config(&self, config: ScanConfig) {
        *self.config.write() = config;
    }

    /// Subscribe to heartbeat events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Whether a worker thread is attached to a session.
    pub fn worker_active(&self) -> bool {
        self.active.lock().as_ref().is_some_and(ActiveScan::is_live)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start a new session on a background thread.
    pub fn start_scan(&self) -> Result<SessionId, ScanError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(ActiveScan::is_live) {
            return Err(ScanError::AlreadyRunning);
        }
        if let Some(finished) = active.take() {
            reap(finished);
        }

        let config = self.config.read().clone();
        PathClassifier::new(&config)?;

        let baseline = self
            .store
            .last_completed_session()?
            .as_ref()
            .and_then(Baseline::from_session);
        let session = self.store.create_session(&config)?;
        let id = session.id;

        let options = WriterOptions {
            batch_size: config.batch_size,
            ..WriterOptions::default()
        };
        let writer = match self.store.writer(id, options) {
            Ok(writer) => writer,
            Err(e) => {
                self.store.fail_session(id, &e.to_string())?;
                return Err(e.into());
            }
        };

        self.reporter.lock().begin(id, baseline, Instant::now());
        let cancel = CancellationToken::new();
        let (done_tx, done) = crossbeam_channel::bounded(1);
        let worker = ScanWorker {
            store: Arc::clone(&self.store),
            writer,
            session: id,
            config,
            cancel: cancel.clone(),
            reporter: Arc::clone(&self.reporter),
            progress_tx: self.progress_tx.clone(),
            done: done_tx,
        };

        let spawned = thread::Builder::new()
            .name(format!("strata-scan-{id}"))
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("cannot spawn scan worker: {e}");
                self.store.fail_session(id, &message)?;
                self.reporter.lock().clear();
                return Err(ScanError::Other { message });
            }
        };

        info!(session = %id, "Scan started");
        *active = Some(ActiveScan {
            session: id,
            cancel,
            done,
            handle,
        });
        Ok(id)
    }

    /// Request cooperative cancellation of the live session.
    pub fn stop_scan(&self) -> Result<(), ScanError> {
        let active = self.active.lock();
        match active.as_ref() {
            Some(scan) if scan.is_live() => {
                info!(session = %scan.session, "Stop requested");
                scan.cancel.cancel();
                Ok(())
            }
            _ => Err(ScanError::NotRunning),
        }
    }

    /// Move every `running` session to `failed`, live worker or not.
    ///
    /// A live worker is also cancelled; its next batch is fenced out.
    pub fn force_reset_scan(&self) -> Result<usize, ScanError> {
        if let Some(scan) = self.active.lock().as_ref() {
            scan.cancel.cancel();
        }
        let reset = self.store.force_reset_running(FORCE_RESET_MESSAGE)?;
        self.reporter.lock().clear();
        Ok(reset)
    }

    /// Block until the current worker exits and return how its session ended.
    ///
    /// Returns `None` when no worker was started since the last wait.
    pub fn wait(&self) -> Option<ScanOutcome> {
        let done = self.active.lock().as_ref().map(|scan| scan.done.clone())?;
        let outcome = done.recv().ok();

        let mut active = self.active.lock();
        let same = match (&outcome, active.as_ref()) {
            (Some(outcome), Some(scan)) => scan.session == outcome.session,
            (None, Some(_)) => true,
            _ => false,
        };
        if same {
            if let Some(finished) = active.take() {
                reap(finished);
            }
        }
        outcome
    }

    // ── Status ───────────────────────────────────────────────────

    /// Snapshot of the running session, or of the most recent one.
    pub fn status(&self) -> Result<ScanStatusReport, ScanError> {
        let worker_active = self.worker_active();
        let session = match self.store.running_session()? {
            Some(running) => Some(running),
            None => self.store.latest_session()?,
        };

        let Some(mut session) = session else {
            return Ok(ScanStatusReport {
                status: SessionStatus::Idle,
                session: None,
                progress: None,
                worker_active,
            });
        };

        let progress = session.is_running().then(|| {
            let reporter = self.reporter.lock();
            if reporter.session() == Some(session.id) {
                // Heartbeats run ahead of the last committed batch.
                if let Some(latest) = reporter.latest() {
                    if latest.files_seen >= session.counters.files_seen {
                        session.counters = *latest;
                    }
                }
            }
            reporter.estimate(&session.counters)
        });

        Ok(ScanStatusReport {
            status: session.status,
            session: Some(session),
            progress,
            worker_active,
        })
    }

    /// Terminal sessions, newest first. `page` is 1-based.
    pub fn scan_history(&self, page: u32, page_size: u32) -> Result<HistoryPage, ScanError> {
        Ok(self.store.session_history(page, page_size)?)
    }

    // ── Tree ─────────────────────────────────────────────────────

    /// Scan roots, capped at the configured listing size.
    pub fn tree_root(&self) -> Result<ChildListing, ScanError> {
        let cap = self.config.read().listing_cap;
        Ok(self.store.root_listing(cap)?)
    }

    /// Largest children of a directory plus a summary of the rest.
    pub fn tree_children(&self, id: EntryId) -> Result<ChildListing, ScanError> {
        let entry = self.live_entry(id)?;
        if !entry.is_dir() {
            return Err(ScanError::NotADirectory { path: entry.path });
        }
        let cap = self.config.read().listing_cap;
        Ok(self.store.children_listing(id, cap)?)
    }

    /// Live entries matching `filter`. `page` is 1-based.
    pub fn search_entries(
        &self,
        filter: &EntryFilter,
        page: u32,
        page_size: u32,
    ) -> Result<EntryPage, ScanError> {
        Ok(self.store.search_entries(filter, page, page_size)?)
    }

    /// A live entry by id.
    pub fn entry(&self, id: EntryId) -> Result<Entry, ScanError> {
        self.live_entry(id)
    }

    fn live_entry(&self, id: EntryId) -> Result<Entry, ScanError> {
        match self.store.entry(id)? {
            Some(entry) if !entry.deleted => Ok(entry),
            _ => Err(ScanError::EntryNotFound { id }),
        }
    }

    // ── Duplicates ───────────────────────────────────────────────

    /// Current duplicate groups, refreshed from rows changed since the last call.
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, ScanError> {
        Ok(self.duplicates.groups(&self.store)?)
    }

    // ── Administration ───────────────────────────────────────────

    /// Delete a file from disk and tombstone its entry.
    ///
    /// A file already gone from disk is still tombstoned.
    pub fn delete_entry(&self, id: EntryId) -> Result<DeletedEntry, ScanError> {
        if self.worker_active() {
            return Err(ScanError::ScanInProgress);
        }
        let entry = self.live_entry(id)?;
        if entry.is_dir() {
            return Err(ScanError::NotAFile { path: entry.path });
        }

        let file_removed = match fs::remove_file(&entry.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %entry.path.display(), "File already missing, tombstoning entry");
                false
            }
            Err(e) => return Err(ScanError::io(&entry.path, e)),
        };
        if !self.store.mark_deleted(id)? {
            return Err(ScanError::EntryNotFound { id });
        }

        info!(entry = %id, path = %entry.path.display(), "Deleted entry");
        Ok(DeletedEntry {
            entry,
            file_removed,
        })
    }

    /// Remove every entry and session.
    pub fn reset_database(&self) -> Result<(), ScanError> {
        if self.worker_active() {
            return Err(ScanError::ScanInProgress);
        }
        self.store.reset()?;
        self.duplicates.invalidate();
        self.reporter.lock().clear();
        Ok(())
    }

    // ── Analytics ────────────────────────────────────────────────

    /// Daily storage totals, oldest first.
    pub fn storage_history(&self, days: u32) -> Result<Vec<StorageSnapshot>, ScanError> {
        Ok(self.store.storage_history(days)?)
    }

    /// Extensions with the largest combined size.
    pub fn extension_summary(&self, limit: usize) -> Result<Vec<ExtensionStats>, ScanError> {
        Ok(self.store.extension_summary(limit)?)
    }
}

fn reap(scan: ActiveScan) {
    if scan.handle.join().is_err() {
        error!(session = %scan.session, "Scan worker panicked");
    }
}

/// State moved onto the worker thread.
struct ScanWorker {
    store: Arc<TreeStore>,
    writer: TreeWriter,
    session: SessionId,
    config: ScanConfig,
    cancel: CancellationToken,
    reporter: Arc<Mutex<ProgressReporter>>,
    progress_tx: broadcast::Sender<ScanProgress>,
    done: Sender<ScanOutcome>,
}

impl ScanWorker {
    fn run(mut self) {
        let started = Instant::now();
        let (result, counters, current_path) = self.walk(started);
        let outcome = self.conclude(result, counters, current_path);

        {
            let mut reporter = self.reporter.lock();
            if reporter.session() == Some(self.session) {
                reporter.clear();
            }
        }
        let _ = self.done.send(outcome);
    }

    fn walk(
        &mut self,
        started: Instant,
    ) -> (Result<WalkEnd, WalkError>, SessionCounters, Option<PathBuf>) {
        let session = self.session;
        let reporter = Arc::clone(&self.reporter);
        let progress_tx = self.progress_tx.clone();
        let on_heartbeat = move |counters: &SessionCounters, path: &Path| {
            reporter.lock().record(counters, Instant::now());
            // No subscribers is fine.
            let _ = progress_tx.send(ScanProgress {
                session,
                counters: *counters,
                current_path: path.to_path_buf(),
                elapsed: started.elapsed(),
            });
        };

        let deadline = self.config.max_duration().map(|limit| started + limit);
        let mut walker = match TreeWalker::new(
            self.config.clone(),
            &mut self.writer,
            self.cancel.clone(),
            on_heartbeat,
        ) {
            Ok(walker) => walker.with_deadline(deadline),
            Err(e) => return (Err(e), SessionCounters::default(), None),
        };
        let result = walker.run();
        let counters = *walker.counters();
        let current_path = walker.current_path().map(Path::to_path_buf);
        (result, counters, current_path)
    }

    fn conclude(
        &mut self,
        result: Result<WalkEnd, WalkError>,
        counters: SessionCounters,
        current_path: Option<PathBuf>,
    ) -> ScanOutcome {
        let path = current_path.as_deref();
        let mut swept = 0;

        let ended: Result<(), StoreError> = match result {
            Ok(WalkEnd::Completed) => self.writer.complete(&counters, path).map(|summary| {
                swept = summary.swept;
            }),
            Ok(end) => {
                let message = self.stop_message(end);
                info!(session = %self.session, %message, "Scan stopping");
                self.writer.flush().and_then(|()| {
                    self.writer
                        .finish(SessionStatus::Stopped, &counters, path, Some(&message))
                })
            }
            Err(err) if err.is_fenced() => Err(StoreError::Fenced {
                session: self.session,
            }),
            Err(err) => {
                let message = err.to_string();
                error!(session = %self.session, error = %message, "Scan failed");
                if let Err(flush_err) = self.writer.flush() {
                    warn!(error = %flush_err, "Could not commit the last batch of a failed scan");
                    self.writer.discard();
                }
                self.writer
                    .finish(SessionStatus::Failed, &counters, path, Some(&message))
            }
        };

        match ended {
            Ok(()) => {}
            Err(StoreError::Fenced { session }) => {
                self.writer.discard();
                info!(session = %session, "Session was reset while scanning, worker exiting");
            }
            Err(e) => {
                error!(session = %self.session, error = %e, "Could not record scan end");
                if let Err(e) = self.store.fail_session(self.session, &e.to_string()) {
                    error!(session = %self.session, error = %e, "Could not mark session failed");
                }
            }
        }

        self.outcome(counters, swept)
    }

    fn stop_message(&self, end: WalkEnd) -> String {
        match end {
            WalkEnd::DeadlineExceeded => format!(
                "maximum scan duration of {} s exceeded",
                self.config.max_duration_secs.unwrap_or_default()
            ),
            WalkEnd::TopLevelLimit => format!(
                "top-level directory limit of {} reached",
                self.config.max_top_level_dirs.unwrap_or_default()
            ),
            WalkEnd::Cancelled | WalkEnd::Completed => STOPPED_MESSAGE.to_string(),
        }
    }

    /// Read back the session as it was left in the store.
    fn outcome(&self, counters: SessionCounters, swept: u64) -> ScanOutcome {
        match self.store.session(self.session) {
            Ok(Some(session)) => ScanOutcome {
                session: session.id,
                status: session.status,
                counters: session.counters,
                error_message: session.error_message,
                swept,
            },
            Ok(None) | Err(_) => ScanOutcome {
                session: self.session,
                status: SessionStatus::Failed,
                counters,
                error_message: Some("session record unavailable".to_string()),
                swept,
            },
        }
    }
}
