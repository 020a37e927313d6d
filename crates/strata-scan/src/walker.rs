//! Depth-first tree walk feeding the store writer and the hashing pool.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use compact_str::CompactString;
use jwalk::{Parallelism, WalkDir};
use strata_core::{
    EntryId, ScanConfig, ScanError, ScanWarning, SessionCounters, WarningKind, extension_of,
};
use strata_store::{DirectoryRecord, FileRecord, StoreError, TreeWriter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{Classification, EntryType, PathClassifier};
use crate::hasher::{Digest, HashJob, HashOutcome, HashingEngine};

/// Errors that end a walk.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WalkError {
    /// The session was force-reset underneath the walk.
    pub fn is_fenced(&self) -> bool {
        matches!(self, Self::Store(StoreError::Fenced { .. }))
    }
}

impl From<WalkError> for ScanError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::Scan(e) => e,
            WalkError::Store(e) => e.into(),
        }
    }
}

/// How a walk ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Every root was fully walked.
    Completed,
    /// The cancellation token fired.
    Cancelled,
    /// The configured maximum duration elapsed.
    DeadlineExceeded,
    /// The top-level directory limit was reached.
    TopLevelLimit,
}

/// A directory whose children are still being walked.
struct Frame {
    id: EntryId,
    depth: usize,
    path: PathBuf,
}

/// Walks the configured roots for one session.
///
/// The walk is sequential and pre-order. Each directory row is queued when
/// the directory is entered and finalized once all of its children are
/// queued; the writer keeps every committed aggregate equal to the sum of
/// the children committed with it. Cancellation and the deadline are
/// checked at directory boundaries.
pub struct TreeWalker<'a, F>
where
    F: FnMut(&SessionCounters, &Path),
{
    config: ScanConfig,
    classifier: Arc<PathClassifier>,
    writer: &'a mut TreeWriter,
    hasher: Option<HashingEngine>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    counters: SessionCounters,
    frames: Vec<Frame>,
    skip_below: Option<usize>,
    top_level_dirs: usize,
    current_path: Option<PathBuf>,
    on_heartbeat: F,
}

impl<'a, F> TreeWalker<'a, F>
where
    F: FnMut(&SessionCounters, &Path),
{
    /// Prepare a walk. Starts the hashing workers.
    pub fn new(
        config: ScanConfig,
        writer: &'a mut TreeWriter,
        cancel: CancellationToken,
        on_heartbeat: F,
    ) -> Result<Self, WalkError> {
        let classifier = Arc::new(PathClassifier::new(&config)?);
        let hasher = HashingEngine::new(config.effective_hash_workers(), config.hash_queue_depth)
            .map_err(|e| ScanError::Other {
                message: format!("cannot start hashing workers: {e}"),
            })?;

        Ok(Self {
            config,
            classifier,
            writer,
            hasher: Some(hasher),
            cancel,
            deadline: None,
            counters: SessionCounters::default(),
            frames: Vec::new(),
            skip_below: None,
            top_level_dirs: 0,
            current_path: None,
            on_heartbeat,
        })
    }

    /// Stop the walk once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Counters accumulated so far.
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Directory most recently completed.
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    /// Walk every root. Buffered writes are left for the caller to flush.
    pub fn run(&mut self) -> Result<WalkEnd, WalkError> {
        let roots = self.prepare_roots()?;

        let mut end = WalkEnd::Completed;
        for root in &roots {
            end = self.walk_root(root)?;
            if end != WalkEnd::Completed {
                break;
            }
        }

        self.finish_hashing(end != WalkEnd::Completed);
        info!(
            ?end,
            files = self.counters.files_seen,
            dirs = self.counters.dirs_seen,
            skipped = self.counters.skipped,
            "Walk finished"
        );
        Ok(end)
    }

    /// Canonicalize and validate the roots, dropping any nested in another.
    fn prepare_roots(&self) -> Result<Vec<PathBuf>, ScanError> {
        let mut roots = Vec::with_capacity(self.config.roots.len());
        for root in &self.config.roots {
            let canonical = root
                .canonicalize()
                .map_err(|source| ScanError::RootUnreadable {
                    path: root.clone(),
                    source,
                })?;
            let metadata =
                fs::metadata(&canonical).map_err(|source| ScanError::RootUnreadable {
                    path: canonical.clone(),
                    source,
                })?;
            if !metadata.is_dir() {
                return Err(ScanError::NotADirectory { path: canonical });
            }
            self.classifier.check_root(&canonical)?;
            fs::read_dir(&canonical).map_err(|source| ScanError::RootUnreadable {
                path: canonical.clone(),
                source,
            })?;
            roots.push(canonical);
        }

        roots.sort();
        let mut kept: Vec<PathBuf> = Vec::with_capacity(roots.len());
        for root in roots {
            if !kept.iter().any(|k| root.starts_with(k)) {
                kept.push(root);
            }
        }
        Ok(kept)
    }

    fn walk_root(&mut self, root: &Path) -> Result<WalkEnd, WalkError> {
        info!(root = %root.display(), "Walking root");
        let classifier = Arc::clone(&self.classifier);
        let walk = WalkDir::new(root)
            .parallelism(Parallelism::Serial)
            .sort(true)
            .skip_hidden(!self.config.include_hidden)
            .follow_links(false)
            .process_read_dir(move |_depth, _path, _state, children| {
                children.retain(|child| match child {
                    Ok(entry) => {
                        let excluded = entry.file_type().is_dir()
                            && classifier.is_excluded_dir_name(&entry.file_name().to_string_lossy());
                        if excluded {
                            debug!(path = %entry.path().display(), "Excluded directory");
                        }
                        !excluded
                    }
                    Err(_) => true,
                });
            });

        self.skip_below = None;
        for item in walk {
            let mut entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    self.soft_error(walk_warning(&err));
                    continue;
                }
            };

            let depth = entry.depth();
            if let Some(limit) = self.skip_below {
                if depth > limit {
                    continue;
                }
                self.skip_below = None;
            }

            let closed = self.close_frames(depth);
            let path = entry.path();
            let entry_type = EntryType::from_file_type(entry.file_type());

            if closed || entry_type == EntryType::Directory {
                if let Some(end) = self.halt_reason() {
                    self.abandon();
                    return Ok(end);
                }
            }

            match (self.classifier.classify(&path, entry_type), entry_type) {
                (Classification::Include, EntryType::Directory) => {
                    if depth == 1 && self.top_level_limit_reached() {
                        info!(
                            limit = self.top_level_dirs,
                            path = %path.display(),
                            "Top-level directory limit reached"
                        );
                        self.abandon();
                        return Ok(WalkEnd::TopLevelLimit);
                    }
                    match entry.metadata() {
                        Ok(metadata) => {
                            self.enter_directory(path, depth, &metadata)?;
                            // The directory stays indexed with whatever could be read.
                            if let Some(err) = entry.read_children_error.take() {
                                self.soft_error(walk_warning(&err));
                            }
                        }
                        Err(err) => {
                            self.soft_error(ScanWarning::new(
                                &path,
                                err.to_string(),
                                WarningKind::MetadataError,
                            ));
                            self.skip_below = Some(depth);
                        }
                    }
                }
                (Classification::Include, _) => match entry.metadata() {
                    Ok(metadata) => self.visit_file(path, &metadata)?,
                    Err(err) => self.soft_error(ScanWarning::new(
                        &path,
                        err.to_string(),
                        WarningKind::MetadataError,
                    )),
                },
                (Classification::ExcludeSubtree, _) => {
                    self.skip_below = Some(depth);
                }
                (Classification::SkipEntry(WarningKind::Symlink), _) => {
                    self.soft_error(symlink_warning(&path));
                }
                (Classification::SkipEntry(_), _) => {
                    self.soft_error(ScanWarning::special_file(&path));
                }
            }

            self.drain_hashes();
            self.writer.maybe_flush()?;
        }

        self.close_frames(0);
        Ok(WalkEnd::Completed)
    }

    fn enter_directory(
        &mut self,
        path: PathBuf,
        depth: usize,
        metadata: &Metadata,
    ) -> Result<(), WalkError> {
        let parent = self.frames.last().map(|f| f.id);
        if depth > 0 && parent.is_none() {
            self.skip_below = Some(depth);
            return Ok(());
        }

        let ensured = self.writer.ensure_directory(DirectoryRecord {
            path: path.clone(),
            parent,
            name: entry_name(&path),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            permissions: permission_bits(metadata),
        })?;
        self.counters.record_dir();
        if ensured.created {
            debug!(path = %path.display(), "New directory");
        }
        self.frames.push(Frame {
            id: ensured.id,
            depth,
            path,
        });
        Ok(())
    }

    fn visit_file(&mut self, path: PathBuf, metadata: &Metadata) -> Result<(), WalkError> {
        let Some(parent) = self.frames.last().map(|f| f.id) else {
            return Ok(());
        };

        let size = metadata.len();
        let name = entry_name(&path);
        let upsert = self.writer.upsert_file(FileRecord {
            path: path.clone(),
            parent,
            extension: extension_of(&name),
            name,
            size,
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            permissions: permission_bits(metadata),
        })?;
        self.counters.record_file(size);

        let Some(hasher) = self.hasher.as_ref() else {
            return Ok(());
        };
        let writer = &mut *self.writer;
        let job = HashJob {
            id: upsert.id,
            path,
        };
        if let Digest::Cached(_) = hasher.digest(job, upsert.cached_hash, || writer.flush())? {
            self.counters.hash_cache_hits += 1;
        }
        Ok(())
    }

    /// Complete every frame at `depth` or deeper. Returns whether any closed.
    fn close_frames(&mut self, depth: usize) -> bool {
        let mut closed = false;
        while self.frames.last().is_some_and(|f| f.depth >= depth) {
            if let Some(frame) = self.frames.pop() {
                self.close_frame(frame, true);
                closed = true;
            }
        }
        closed
    }

    /// Unwind after a halt. Unfinished directories stay open in the writer,
    /// which sums them from whatever children were committed, and nothing
    /// under them is swept.
    fn abandon(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.close_frame(frame, false);
        }
    }

    fn close_frame(&mut self, frame: Frame, complete: bool) {
        if complete {
            self.writer.finalize_directory(frame.id);
        }
        self.writer
            .record_progress(self.counters, Some(frame.path.clone()));
        (self.on_heartbeat)(&self.counters, &frame.path);
        self.current_path = Some(frame.path);
    }

    /// Count a top-level directory, reporting whether it exceeds the limit.
    fn top_level_limit_reached(&mut self) -> bool {
        match self.config.max_top_level_dirs {
            Some(limit) if self.top_level_dirs >= limit => true,
            _ => {
                self.top_level_dirs += 1;
                false
            }
        }
    }

    fn halt_reason(&self) -> Option<WalkEnd> {
        if self.cancel.is_cancelled() {
            return Some(WalkEnd::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(WalkEnd::DeadlineExceeded),
            _ => None,
        }
    }

    fn drain_hashes(&mut self) {
        let Some(hasher) = self.hasher.as_ref() else {
            return;
        };
        let outcomes: Vec<_> = hasher.completed().collect();
        for outcome in outcomes {
            self.apply_outcome(outcome);
        }
    }

    /// Wait for the hashing pool. Queued jobs are dropped when `cancelled`.
    fn finish_hashing(&mut self, cancelled: bool) {
        let Some(hasher) = self.hasher.take() else {
            return;
        };
        if cancelled {
            let dropped = hasher.cancel_pending();
            if dropped > 0 {
                debug!(dropped, "Discarded queued hash jobs");
            }
        }
        for outcome in hasher.finish() {
            self.apply_outcome(outcome);
        }
        self.writer.record_progress(self.counters, self.current_path.clone());
    }

    fn apply_outcome(&mut self, outcome: HashOutcome) {
        match outcome {
            HashOutcome::Hashed { id, hash, bytes } => {
                self.writer.set_hash(id, hash);
                self.counters.files_hashed += 1;
                self.counters.bytes_hashed += bytes;
            }
            HashOutcome::Failed { path, error, .. } => {
                self.counters.hash_failures += 1;
                self.soft_error(ScanWarning::hash_error(path, error));
            }
        }
    }

    fn soft_error(&mut self, warning: ScanWarning) {
        warn!(path = %warning.path.display(), kind = ?warning.kind, "{}", warning.message);
        self.counters.record_skip();
    }
}

fn walk_warning(err: &jwalk::Error) -> ScanWarning {
    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
    match err.io_error() {
        Some(io) => ScanWarning::read_error(path, io),
        None => ScanWarning::new(path, err.to_string(), WarningKind::ReadError),
    }
}

/// Tell links with a reachable target apart from dangling ones.
fn symlink_warning(path: &Path) -> ScanWarning {
    if fs::metadata(path).is_ok() {
        ScanWarning::symlink(path)
    } else {
        ScanWarning::broken_symlink(path)
    }
}

fn entry_name(path: &Path) -> CompactString {
    match path.file_name() {
        Some(name) => CompactString::new(name.to_string_lossy()),
        None => CompactString::new(path.to_string_lossy()),
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
