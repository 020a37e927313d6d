//! The single writer used by a running scan.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use compact_str::CompactString;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use strata_core::{
    ContentHash, EntryId, SessionCounters, SessionId, SessionStatus, StorageSnapshot,
    system_time_to_nanos,
};
use tracing::{debug, info};

use crate::db::{NEXT_CHANGE_SEQ, from_sql_int, open_connection, to_sql_int};
use crate::error::{Result, StoreError};
use crate::rows::path_text;

/// Batching policy of a [`TreeWriter`].
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Buffered operations that trigger a flush.
    pub batch_size: usize,
    /// Maximum age of the oldest unflushed operation.
    pub flush_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// A directory as seen on entry, before its children are walked.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub path: PathBuf,
    pub parent: Option<EntryId>,
    pub name: CompactString,
    pub modified: SystemTime,
    pub permissions: u32,
}

/// A regular file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub parent: EntryId,
    pub name: CompactString,
    pub size: u64,
    pub extension: Option<CompactString>,
    pub modified: SystemTime,
    pub permissions: u32,
}

/// Result of buffering a file row.
#[derive(Debug, Clone, Copy)]
pub struct FileUpsert {
    pub id: EntryId,
    /// Hash kept from an earlier scan because size and mtime are unchanged.
    pub cached_hash: Option<ContentHash>,
}

/// Result of buffering a directory row.
#[derive(Debug, Clone, Copy)]
pub struct EnsuredDirectory {
    pub id: EntryId,
    /// The directory was not indexed before this session.
    pub created: bool,
}

/// What a completed session left behind.
#[derive(Debug, Clone)]
pub struct CompletionSummary {
    /// Rows tombstoned because this session did not see them.
    pub swept: u64,
    pub snapshot: StorageSnapshot,
}

struct ExistingRow {
    id: EntryId,
    is_dir: bool,
    size: u64,
    modified_ns: i64,
    hash: Option<Vec<u8>>,
    deleted: bool,
}

enum WriteOp {
    InsertDirectory {
        id: EntryId,
        record: DirectoryRecord,
    },
    UpdateDirectory {
        id: EntryId,
        record: DirectoryRecord,
        restamp: bool,
    },
    InsertFile {
        id: EntryId,
        record: FileRecord,
    },
    UpdateFile {
        id: EntryId,
        record: FileRecord,
        keep_hash: bool,
        restamp: bool,
    },
    FinalizeDirectory {
        id: EntryId,
    },
    SetHash {
        id: EntryId,
        hash: ContentHash,
    },
}

/// Buffered, fenced writer owned by one scan session.
///
/// Operations are queued in memory and applied by [`flush`](Self::flush) in
/// a single immediate transaction that first checks the session is still
/// `running`. Ids are allocated here so that a queued directory can be
/// referenced by its queued children.
///
/// Every commit leaves each live directory's aggregate equal to the sum of
/// its live children. Directories still being walked are re-summed from
/// their committed children at each flush; a finished directory first
/// tombstones the children this session did not see.
pub struct TreeWriter {
    conn: Connection,
    session: SessionId,
    options: WriterOptions,
    next_id: i64,
    ops: Vec<WriteOp>,
    /// Directories entered and not yet finalized, outermost first.
    open: Vec<EntryId>,
    /// Rows tombstoned by committed finalize operations.
    swept: u64,
    progress: Option<(SessionCounters, Option<PathBuf>)>,
    last_flush: Instant,
}

impl TreeWriter {
    pub(crate) fn open(path: &Path, session: SessionId, options: WriterOptions) -> Result<Self> {
        let conn = open_connection(path)?;
        let max_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM entries", [], |row| row.get(0))?;
        Ok(Self {
            conn,
            session,
            options,
            next_id: max_id,
            ops: Vec::with_capacity(options.batch_size),
            open: Vec::new(),
            swept: 0,
            progress: None,
            last_flush: Instant::now(),
        })
    }

    /// Session this writer belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Number of buffered row operations.
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn lookup(&self, path: &Path) -> Result<Option<ExistingRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, is_dir, size, modified_ns, content_hash, deleted FROM entries WHERE path = ?1",
        )?;
        let row = stmt
            .query_row(params![path_text(path)], |row| {
                Ok(ExistingRow {
                    id: EntryId(row.get(0)?),
                    is_dir: row.get(1)?,
                    size: from_sql_int(row.get(2)?),
                    modified_ns: row.get(3)?,
                    hash: row.get(4)?,
                    deleted: row.get(5)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Queue the row of a directory about to be walked.
    ///
    /// Until [`finalize_directory`](Self::finalize_directory) the directory is
    /// open: each flush sets its aggregate to the sum of its committed live
    /// children.
    pub fn ensure_directory(&mut self, record: DirectoryRecord) -> Result<EnsuredDirectory> {
        let ensured = match self.lookup(&record.path)? {
            Some(existing) => {
                let restamp = !existing.is_dir || existing.deleted;
                self.ops.push(WriteOp::UpdateDirectory {
                    id: existing.id,
                    record,
                    restamp,
                });
                EnsuredDirectory {
                    id: existing.id,
                    created: false,
                }
            }
            None => {
                let id = self.allocate_id();
                self.ops.push(WriteOp::InsertDirectory { id, record });
                EnsuredDirectory { id, created: true }
            }
        };
        self.open.push(ensured.id);
        Ok(ensured)
    }

    /// Queue a file row. Reports a reusable hash when the stored row has the
    /// same size and modification time.
    pub fn upsert_file(&mut self, record: FileRecord) -> Result<FileUpsert> {
        let modified_ns = system_time_to_nanos(record.modified);
        match self.lookup(&record.path)? {
            Some(existing) => {
                let unchanged = !existing.is_dir
                    && existing.size == record.size
                    && existing.modified_ns == modified_ns;
                let cached_hash = if unchanged {
                    existing.hash.as_deref().and_then(ContentHash::from_slice)
                } else {
                    None
                };
                let id = existing.id;
                self.ops.push(WriteOp::UpdateFile {
                    id,
                    record,
                    keep_hash: unchanged,
                    restamp: !unchanged || existing.deleted,
                });
                Ok(FileUpsert { id, cached_hash })
            }
            None => {
                let id = self.allocate_id();
                self.ops.push(WriteOp::InsertFile { id, record });
                Ok(FileUpsert {
                    id,
                    cached_hash: None,
                })
            }
        }
    }

    /// Close a directory whose children have all been queued.
    ///
    /// When applied, children not seen by this session are tombstoned along
    /// with their subtrees and the aggregate is summed from the rest.
    pub fn finalize_directory(&mut self, id: EntryId) {
        if let Some(pos) = self.open.iter().rposition(|open| *open == id) {
            self.open.remove(pos);
        }
        self.ops.push(WriteOp::FinalizeDirectory { id });
    }

    /// Queue a freshly computed content hash.
    pub fn set_hash(&mut self, id: EntryId, hash: ContentHash) {
        self.ops.push(WriteOp::SetHash { id, hash });
    }

    /// Replace the counters written with the next flush.
    pub fn record_progress(&mut self, counters: SessionCounters, current_path: Option<PathBuf>) {
        self.progress = Some((counters, current_path));
    }

    /// Flush when the batch is full or old enough.
    pub fn maybe_flush(&mut self) -> Result<bool> {
        let due = self.ops.len() >= self.options.batch_size
            || (self.last_flush.elapsed() >= self.options.flush_interval
                && (!self.ops.is_empty() || self.progress.is_some()));
        if due {
            self.flush()?;
        }
        Ok(due)
    }

    /// Apply every buffered operation in one fenced transaction.
    pub fn flush(&mut self) -> Result<()> {
        if self.ops.is_empty() && self.progress.is_none() {
            return Ok(());
        }
        let session = self.session;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_running(&tx, session)?;
        let mut swept = 0;
        for op in &self.ops {
            swept += apply(&tx, session, op)?;
        }
        for id in self.open.iter().rev() {
            sum_children(&tx, *id)?;
        }
        if let Some((counters, current_path)) = &self.progress {
            write_counters(&tx, session, counters, current_path.as_deref())?;
        }
        tx.commit()?;

        self.swept += swept;
        debug!(session = %session, ops = self.ops.len(), swept, "Committed batch");
        self.ops.clear();
        self.progress = None;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Drop buffered operations that can no longer be committed.
    pub fn discard(&mut self) {
        if !self.ops.is_empty() {
            debug!(session = %self.session, ops = self.ops.len(), "Discarding unflushed batch");
        }
        self.ops.clear();
        self.progress = None;
    }

    /// Move the session to `stopped` or `failed`. Buffered operations must
    /// have been flushed or discarded first.
    pub fn finish(
        &mut self,
        status: SessionStatus,
        counters: &SessionCounters,
        current_path: Option<&Path>,
        message: Option<&str>,
    ) -> Result<()> {
        let session = self.session;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_running(&tx, session)?;
        write_counters(&tx, session, counters, current_path)?;
        end_session(&tx, session, status, message)?;
        tx.commit()?;
        info!(session = %session, %status, "Scan session ended");
        Ok(())
    }

    /// Flush, tombstone any remaining rows this session never saw, record the
    /// day's storage totals and mark the session `completed`.
    pub fn complete(
        &mut self,
        counters: &SessionCounters,
        current_path: Option<&Path>,
    ) -> Result<CompletionSummary> {
        self.flush()?;
        let session = self.session;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_running(&tx, session)?;

        let unseen = tx.execute(
            &format!(
                "UPDATE entries SET deleted = 1, change_seq = {NEXT_CHANGE_SEQ} \
                 WHERE deleted = 0 AND last_seen_session IS NOT ?1"
            ),
            params![session.0],
        )?;

        let (total_size, file_count, dir_count): (i64, i64, i64) = tx.query_row(
            "SELECT COALESCE(SUM(size), 0), COALESCE(SUM(file_count), 0), \
                    COALESCE(SUM(dir_count), 0) + COUNT(*) \
             FROM entries WHERE parent_id IS NULL AND deleted = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let now = Utc::now();
        let snapshot = StorageSnapshot {
            day: now.date_naive(),
            total_size: from_sql_int(total_size),
            file_count: from_sql_int(file_count),
            dir_count: from_sql_int(dir_count),
        };
        tx.execute(
            "INSERT INTO storage_history (day, total_size, file_count, dir_count, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(day) DO UPDATE SET total_size = excluded.total_size, \
                 file_count = excluded.file_count, dir_count = excluded.dir_count, \
                 recorded_at = excluded.recorded_at",
            params![
                snapshot.day.format("%Y-%m-%d").to_string(),
                total_size,
                file_count,
                dir_count,
                now.to_rfc3339()
            ],
        )?;

        write_counters(&tx, session, counters, current_path)?;
        end_session(&tx, session, SessionStatus::Completed, None)?;
        tx.commit()?;

        let swept = self.swept + unseen as u64;
        info!(session = %session, swept, total_size, "Scan session completed");
        Ok(CompletionSummary { swept, snapshot })
    }
}

fn ensure_running(tx: &Transaction<'_>, session: SessionId) -> Result<()> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM scan_sessions WHERE id = ?1",
            params![session.0],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        Some("running") => Ok(()),
        _ => Err(StoreError::Fenced { session }),
    }
}

/// Apply one queued operation. Returns the number of rows it tombstoned.
fn apply(tx: &Transaction<'_>, session: SessionId, op: &WriteOp) -> Result<u64> {
    match op {
        WriteOp::InsertDirectory { id, record } => {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO entries (id, path, parent_id, name, is_dir, modified_ns, permissions, \
                     last_seen_session, change_seq) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, {NEXT_CHANGE_SEQ})"
            ))?;
            stmt.execute(params![
                id.0,
                path_text(&record.path),
                record.parent.map(|p| p.0),
                record.name.as_str(),
                system_time_to_nanos(record.modified),
                record.permissions,
                session.0
            ])?;
        }
        WriteOp::UpdateDirectory {
            id,
            record,
            restamp,
        } => {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE entries SET parent_id = ?2, name = ?3, modified_ns = ?4, permissions = ?5, \
                     last_seen_session = ?6, extension = NULL, content_hash = NULL, \
                     size = CASE WHEN is_dir = 0 THEN 0 ELSE size END, \
                     file_count = CASE WHEN is_dir = 0 THEN 0 ELSE file_count END, \
                     dir_count = CASE WHEN is_dir = 0 THEN 0 ELSE dir_count END, \
                     change_seq = CASE WHEN ?7 THEN {NEXT_CHANGE_SEQ} ELSE change_seq END, \
                     is_dir = 1, deleted = 0 \
                 WHERE id = ?1"
            ))?;
            stmt.execute(params![
                id.0,
                record.parent.map(|p| p.0),
                record.name.as_str(),
                system_time_to_nanos(record.modified),
                record.permissions,
                session.0,
                restamp
            ])?;
        }
        WriteOp::InsertFile { id, record } => {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO entries (id, path, parent_id, name, is_dir, size, extension, \
                     modified_ns, permissions, last_seen_session, change_seq) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, {NEXT_CHANGE_SEQ})"
            ))?;
            stmt.execute(params![
                id.0,
                path_text(&record.path),
                record.parent.0,
                record.name.as_str(),
                to_sql_int(record.size),
                record.extension.as_deref(),
                system_time_to_nanos(record.modified),
                record.permissions,
                session.0
            ])?;
        }
        WriteOp::UpdateFile {
            id,
            record,
            keep_hash,
            restamp,
        } => {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE entries SET parent_id = ?2, name = ?3, is_dir = 0, size = ?4, \
                     file_count = 0, dir_count = 0, extension = ?5, modified_ns = ?6, \
                     permissions = ?7, last_seen_session = ?8, deleted = 0, \
                     content_hash = CASE WHEN ?9 THEN content_hash ELSE NULL END, \
                     change_seq = CASE WHEN ?10 THEN {NEXT_CHANGE_SEQ} ELSE change_seq END \
                 WHERE id = ?1"
            ))?;
            stmt.execute(params![
                id.0,
                record.parent.0,
                record.name.as_str(),
                to_sql_int(record.size),
                record.extension.as_deref(),
                system_time_to_nanos(record.modified),
                record.permissions,
                session.0,
                keep_hash,
                restamp
            ])?;
        }
        WriteOp::FinalizeDirectory { id } => {
            let mut stmt = tx.prepare_cached(&format!(
                "WITH RECURSIVE gone(id) AS ( \
                     SELECT id FROM entries \
                     WHERE parent_id = ?1 AND deleted = 0 AND last_seen_session IS NOT ?2 \
                     UNION ALL \
                     SELECT e.id FROM entries e JOIN gone g ON e.parent_id = g.id \
                     WHERE e.deleted = 0 AND e.last_seen_session IS NOT ?2 \
                 ) \
                 UPDATE entries SET deleted = 1, change_seq = {NEXT_CHANGE_SEQ} \
                 WHERE id IN (SELECT id FROM gone)"
            ))?;
            let swept = stmt.execute(params![id.0, session.0])?;
            sum_children(tx, *id)?;
            return Ok(swept as u64);
        }
        WriteOp::SetHash { id, hash } => {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE entries SET content_hash = ?2, change_seq = {NEXT_CHANGE_SEQ} WHERE id = ?1"
            ))?;
            stmt.execute(params![id.0, hash.as_bytes().as_slice()])?;
        }
    }
    Ok(0)
}

/// Set a directory's aggregate to the sum over its live children.
fn sum_children(tx: &Transaction<'_>, id: EntryId) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "UPDATE entries SET size = agg.size, file_count = agg.files, dir_count = agg.dirs \
         FROM ( \
             SELECT COALESCE(SUM(size), 0) AS size, \
                    COALESCE(SUM(CASE WHEN is_dir = 1 THEN file_count ELSE 1 END), 0) AS files, \
                    COALESCE(SUM(CASE WHEN is_dir = 1 THEN dir_count + 1 ELSE 0 END), 0) AS dirs \
             FROM entries WHERE parent_id = ?1 AND deleted = 0 \
         ) AS agg \
         WHERE entries.id = ?1",
    )?;
    stmt.execute(params![id.0])?;
    Ok(())
}

fn write_counters(
    tx: &Transaction<'_>,
    session: SessionId,
    counters: &SessionCounters,
    current_path: Option<&Path>,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "UPDATE scan_sessions SET files_seen = ?2, dirs_seen = ?3, bytes_seen = ?4, skipped = ?5, \
             files_hashed = ?6, bytes_hashed = ?7, hash_cache_hits = ?8, hash_failures = ?9, \
             current_path = ?10 \
         WHERE id = ?1",
    )?;
    stmt.execute(params![
        session.0,
        to_sql_int(counters.files_seen),
        to_sql_int(counters.dirs_seen),
        to_sql_int(counters.bytes_seen),
        to_sql_int(counters.skipped),
        to_sql_int(counters.files_hashed),
        to_sql_int(counters.bytes_hashed),
        to_sql_int(counters.hash_cache_hits),
        to_sql_int(counters.hash_failures),
        current_path.map(path_text)
    ])?;
    Ok(())
}

fn end_session(
    tx: &Transaction<'_>,
    session: SessionId,
    status: SessionStatus,
    message: Option<&str>,
) -> Result<()> {
    tx.execute(
        "UPDATE scan_sessions SET status = ?2, ended_at = ?3, error_message = ?4 \
         WHERE id = ?1 AND status = 'running'",
        params![session.0, status.as_ref(), Utc::now().to_rfc3339(), message],
    )?;
    Ok(())
}
