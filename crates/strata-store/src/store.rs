//! Read and administrative access to the index.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, TransactionBehavior, params, params_from_iter,
};
use strata_core::{
    ChildListing, ContentHash, Entry, EntryFilter, EntryId, EntryPage, ExtensionStats,
    ListingRemainder, ScanConfig, ScanSession, SessionId, SortKey, StorageSnapshot,
};
use tracing::{debug, info};

use crate::db::{NEXT_CHANGE_SEQ, from_sql_int, migrate_schema, open_connection, to_sql_int};
use crate::error::{Result, StoreError};
use crate::rows::{ENTRY_COLUMNS, SESSION_COLUMNS, SessionRow, entry_from_row, path_text};
use crate::writer::{TreeWriter, WriterOptions};

/// A live file with a computed content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub id: EntryId,
    pub path: PathBuf,
    pub size: u64,
    pub hash: ContentHash,
}

/// A row whose size, hash or deleted flag changed after some change stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedEntry {
    pub id: EntryId,
    pub size: u64,
    pub change_seq: i64,
}

/// One page of terminal sessions, newest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub sessions: Vec<ScanSession>,
    /// Number of terminal sessions across all pages.
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl HistoryPage {
    /// Number of pages at this page size.
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }
}

/// Shared handle to the index database.
///
/// Holds the reader/admin connection. Scans write through a separate
/// [`TreeWriter`] connection obtained from [`TreeStore::writer`].
pub struct TreeStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TreeStore {
    /// Open (or create) the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        migrate_schema(&conn)?;
        debug!(path = %path.display(), "Opened tree store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the single writer for a running session.
    pub fn writer(&self, session: SessionId, options: WriterOptions) -> Result<TreeWriter> {
        TreeWriter::open(&self.path, session, options)
    }

    // ── Scan sessions ────────────────────────────────────────────

    /// Insert a new `running` session.
    ///
    /// Fails with [`StoreError::SessionRunning`] when another session is
    /// already marked running.
    pub fn create_session(&self, config: &ScanConfig) -> Result<ScanSession> {
        let started_at = Utc::now();
        let snapshot = serde_json::to_string(config)?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO scan_sessions (status, started_at, config) VALUES ('running', ?1, ?2)",
            params![started_at.to_rfc3339(), snapshot],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::SessionRunning);
            }
            Err(e) => return Err(e.into()),
        }
        let id = SessionId(conn.last_insert_rowid());
        info!(session = %id, "Created scan session");
        Ok(ScanSession::start(id, config.clone(), started_at))
    }

    /// Look up a session by id.
    pub fn session(&self, id: SessionId) -> Result<Option<ScanSession>> {
        self.query_session("WHERE id = ?1", params![id.0])
    }

    /// The session currently marked `running`, if any.
    pub fn running_session(&self) -> Result<Option<ScanSession>> {
        self.query_session("WHERE status = 'running'", [])
    }

    /// The most recently started session in any state.
    pub fn latest_session(&self) -> Result<Option<ScanSession>> {
        self.query_session("ORDER BY id DESC LIMIT 1", [])
    }

    /// The most recent completed session, used as the progress baseline.
    pub fn last_completed_session(&self) -> Result<Option<ScanSession>> {
        self.query_session("WHERE status = 'completed' ORDER BY id DESC LIMIT 1", [])
    }

    fn query_session(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<ScanSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM scan_sessions {clause}");
        let conn = self.conn.lock();
        let row = conn
            .query_row(&sql, params, SessionRow::from_row)
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Terminal sessions, newest first. `page` is 1-based.
    pub fn session_history(&self, page: u32, page_size: u32) -> Result<HistoryPage> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(page_size);
        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scan_sessions WHERE status IN ('completed', 'failed', 'stopped')",
            [],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM scan_sessions \
             WHERE status IN ('completed', 'failed', 'stopped') \
             ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![i64::from(page_size), offset], SessionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let sessions = rows
            .into_iter()
            .map(SessionRow::into_session)
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryPage {
            sessions,
            total: from_sql_int(total),
            page,
            page_size,
        })
    }

    /// Move every `running` session to `failed` with `message`.
    ///
    /// Entries are left untouched. A worker still attached to one of these
    /// sessions is fenced out on its next batch.
    pub fn force_reset_running(&self, message: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let reset = conn.execute(
            "UPDATE scan_sessions SET status = 'failed', ended_at = ?1, error_message = ?2 \
             WHERE status = 'running'",
            params![Utc::now().to_rfc3339(), message],
        )?;
        if reset > 0 {
            info!(sessions = reset, "Force-reset running sessions");
        }
        Ok(reset)
    }

    /// Mark one running session `failed` before any writer was attached.
    pub fn fail_session(&self, id: SessionId, message: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE scan_sessions SET status = 'failed', ended_at = ?2, error_message = ?3 \
             WHERE id = ?1 AND status = 'running'",
            params![id.0, Utc::now().to_rfc3339(), message],
        )?;
        Ok(updated > 0)
    }

    // ── Entries ──────────────────────────────────────────────────

    /// Look up an entry by id, tombstoned or not.
    pub fn entry(&self, id: EntryId) -> Result<Option<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
        let conn = self.conn.lock();
        Ok(conn.query_row(&sql, params![id.0], entry_from_row).optional()?)
    }

    /// Look up an entry by its full path.
    pub fn entry_by_path(&self, path: &Path) -> Result<Option<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE path = ?1");
        let conn = self.conn.lock();
        Ok(conn
            .query_row(&sql, params![path_text(path)], entry_from_row)
            .optional()?)
    }

    /// Live scan roots, largest first, capped at `cap`.
    pub fn root_listing(&self, cap: usize) -> Result<ChildListing> {
        self.listing(None, cap)
    }

    /// Live children of `parent`, largest first, capped at `cap`.
    pub fn children_listing(&self, parent: EntryId, cap: usize) -> Result<ChildListing> {
        self.listing(Some(parent), cap)
    }

    fn listing(&self, parent: Option<EntryId>, cap: usize) -> Result<ChildListing> {
        let filter = match parent {
            Some(_) => "parent_id = ?1",
            None => "parent_id IS NULL AND ?1 IS NULL",
        };
        let parent_id = parent.map(|p| p.0);
        let cap = i64::try_from(cap).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock();
        // One read transaction so the page and its remainder describe the same batch.
        let tx = conn.transaction()?;
        let entries = {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE {filter} AND deleted = 0 \
                 ORDER BY size DESC, name ASC LIMIT ?2"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params![parent_id, cap], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let (count, total_size): (i64, i64) = tx.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM entries WHERE {filter} AND deleted = 0"
            ),
            params![parent_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.commit()?;

        let shown_size: u64 = entries.iter().map(|e| e.size).sum();
        let hidden = from_sql_int(count).saturating_sub(entries.len() as u64);
        let remainder = (hidden > 0).then(|| ListingRemainder {
            count: hidden,
            total_size: from_sql_int(total_size).saturating_sub(shown_size),
        });

        Ok(ChildListing { entries, remainder })
    }

    /// Every live child of `parent`, ordered by name.
    pub fn children(&self, parent: EntryId) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE parent_id = ?1 AND deleted = 0 ORDER BY name"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![parent.0], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Every live entry, in discovery order.
    pub fn live_entries(&self) -> Result<Vec<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE deleted = 0 ORDER BY id");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Live entries matching `filter`, one page at a time. `page` is 1-based.
    pub fn search_entries(
        &self,
        filter: &EntryFilter,
        page: u32,
        page_size: u32,
    ) -> Result<EntryPage> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(page_size);

        let mut clauses = vec!["deleted = 0".to_string()];
        let mut values: Vec<Value> = Vec::new();
        if let Some(prefix) = &filter.path_prefix {
            values.push(Value::Text(path_text(prefix)));
            let n = values.len();
            clauses.push(format!("substr(path, 1, length(?{n})) = ?{n}"));
        }
        if let Some(needle) = filter.name_contains.as_deref().filter(|s| !s.is_empty()) {
            values.push(Value::Text(format!("%{}%", escape_like(needle))));
            clauses.push(format!("name LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(ext) = filter.normalized_extension() {
            values.push(Value::Text(ext.to_string()));
            clauses.push(format!("extension = ?{}", values.len()));
        }
        if let Some(min) = filter.min_size.filter(|&min| min > 0) {
            values.push(Value::Integer(to_sql_int(min)));
            clauses.push(format!("size >= ?{}", values.len()));
        }
        if let Some(max) = filter.max_size {
            values.push(Value::Integer(to_sql_int(max)));
            clauses.push(format!("size <= ?{}", values.len()));
        }
        let where_clause = clauses.join(" AND ");

        let column = match filter.sort {
            SortKey::Size => "size",
            SortKey::Name => "name",
            SortKey::Modified => "modified_ns",
        };
        let direction = if filter.descending { "DESC" } else { "ASC" };

        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM entries WHERE {where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let n = values.len();
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE {where_clause} \
             ORDER BY {column} {direction}, id ASC LIMIT ?{} OFFSET ?{}",
            n + 1,
            n + 2
        );
        values.push(Value::Integer(i64::from(page_size)));
        values.push(Value::Integer(offset));
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values.iter()), entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(total, page, "Entry search");

        Ok(EntryPage {
            entries,
            total: from_sql_int(total),
            page,
            page_size,
        })
    }

    /// Tombstone a file entry and subtract it from every ancestor aggregate.
    ///
    /// Returns `false` when the entry is missing, already deleted or a
    /// directory.
    pub fn mark_deleted(&self, id: EntryId) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let size: Option<i64> = tx
            .query_row(
                "SELECT size FROM entries WHERE id = ?1 AND is_dir = 0 AND deleted = 0",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(size) = size else {
            return Ok(false);
        };

        tx.execute(
            &format!("UPDATE entries SET deleted = 1, change_seq = {NEXT_CHANGE_SEQ} WHERE id = ?1"),
            params![id.0],
        )?;
        let ancestors = tx.execute(
            "WITH RECURSIVE ancestors(id) AS ( \
                 SELECT parent_id FROM entries WHERE id = ?1 AND parent_id IS NOT NULL \
                 UNION ALL \
                 SELECT e.parent_id FROM entries e JOIN ancestors a ON e.id = a.id \
                 WHERE e.parent_id IS NOT NULL \
             ) \
             UPDATE entries SET size = MAX(size - ?2, 0), file_count = MAX(file_count - 1, 0) \
             WHERE id IN (SELECT id FROM ancestors)",
            params![id.0, size],
        )?;
        tx.commit()?;

        debug!(entry = %id, ancestors, "Tombstoned entry");
        Ok(true)
    }

    /// Remove every entry, session and history row.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM storage_history;
             DELETE FROM scan_sessions;
             DELETE FROM entries;",
        )?;
        tx.commit()?;
        info!("Index database reset");
        Ok(())
    }

    // ── Analytics ────────────────────────────────────────────────

    /// Daily storage totals for the last `days` recorded days, oldest first.
    pub fn storage_history(&self, days: u32) -> Result<Vec<StorageSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT day, total_size, file_count, dir_count FROM storage_history \
             ORDER BY day DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::from(days)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshots = rows
            .into_iter()
            .map(|(day, size, files, dirs)| {
                let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|e| {
                    StoreError::Corrupt {
                        message: format!("bad history day '{day}': {e}"),
                    }
                })?;
                Ok(StorageSnapshot {
                    day,
                    total_size: from_sql_int(size),
                    file_count: from_sql_int(files),
                    dir_count: from_sql_int(dirs),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        snapshots.reverse();
        Ok(snapshots)
    }

    /// Extensions with the largest combined live size.
    pub fn extension_summary(&self, limit: usize) -> Result<Vec<ExtensionStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT extension, COUNT(*), SUM(size) FROM entries \
             WHERE is_dir = 0 AND deleted = 0 AND extension IS NOT NULL \
             GROUP BY extension ORDER BY SUM(size) DESC, extension ASC LIMIT ?1",
        )?;
        let stats = stmt
            .query_map(params![to_sql_int(limit as u64)], |row| {
                Ok(ExtensionStats {
                    extension: row.get(0)?,
                    count: from_sql_int(row.get(1)?),
                    total_size: from_sql_int(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    // ── Duplicate index support ──────────────────────────────────

    /// Highest change stamp in the store, 0 when empty.
    pub fn max_change_seq(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COALESCE(MAX(change_seq), 0) FROM entries", [], |row| {
            row.get(0)
        })?)
    }

    /// Rows stamped after `seq`, oldest stamp first.
    pub fn changed_since(&self, seq: i64) -> Result<Vec<ChangedEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, size, change_seq FROM entries WHERE change_seq > ?1 ORDER BY change_seq",
        )?;
        let changed = stmt
            .query_map(params![seq], |row| {
                Ok(ChangedEntry {
                    id: EntryId(row.get(0)?),
                    size: from_sql_int(row.get(1)?),
                    change_seq: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changed)
    }

    /// Live hashed files of exactly `size` bytes, in discovery order.
    pub fn hashed_files_of_size(&self, size: u64) -> Result<Vec<HashedFile>> {
        self.hashed_files("AND size = ?1", params![to_sql_int(size)])
    }

    /// Live hashed files whose size is shared with at least one other
    /// live hashed file, ordered by size then discovery.
    pub fn hashed_files_with_shared_size(&self) -> Result<Vec<HashedFile>> {
        self.hashed_files(
            "AND size IN (SELECT size FROM entries \
                 WHERE is_dir = 0 AND deleted = 0 AND content_hash IS NOT NULL \
                 GROUP BY size HAVING COUNT(*) > 1)",
            [],
        )
    }

    fn hashed_files(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<HashedFile>> {
        let sql = format!(
            "SELECT id, path, size, content_hash FROM entries \
             WHERE is_dir = 0 AND deleted = 0 AND content_hash IS NOT NULL {clause} \
             ORDER BY size, id"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, path, size, hash)| {
                Some(HashedFile {
                    id: EntryId(id),
                    path: PathBuf::from(path),
                    size: from_sql_int(size),
                    hash: ContentHash::from_slice(&hash)?,
                })
            })
            .collect())
    }
}

/// Escape `LIKE` wildcards so `text` matches literally.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
