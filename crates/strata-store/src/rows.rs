//! Row mapping between SQLite and the core types.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use rusqlite::Row;
use strata_core::{
    ContentHash, Entry, EntryId, EntryKind, ScanConfig, ScanSession, SessionCounters, SessionId,
    SessionStatus, nanos_to_system_time,
};

use crate::db::from_sql_int;
use crate::error::{Result, StoreError};

pub(crate) const ENTRY_COLUMNS: &str = "id, path, parent_id, name, is_dir, size, file_count, \
     dir_count, extension, modified_ns, permissions, content_hash, deleted";

pub(crate) const SESSION_COLUMNS: &str = "id, status, started_at, ended_at, files_seen, \
     dirs_seen, bytes_seen, skipped, files_hashed, bytes_hashed, hash_cache_hits, hash_failures, \
     current_path, error_message, config";

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let is_dir: bool = row.get(4)?;
    let kind = if is_dir {
        EntryKind::Directory {
            file_count: from_sql_int(row.get(6)?),
            dir_count: from_sql_int(row.get(7)?),
        }
    } else {
        EntryKind::File
    };
    let hash: Option<Vec<u8>> = row.get(11)?;

    Ok(Entry {
        id: EntryId(row.get(0)?),
        path: PathBuf::from(row.get::<_, String>(1)?),
        parent: row.get::<_, Option<i64>>(2)?.map(EntryId),
        name: CompactString::from(row.get::<_, String>(3)?),
        kind,
        size: from_sql_int(row.get(5)?),
        extension: row.get::<_, Option<String>>(8)?.map(CompactString::from),
        modified: nanos_to_system_time(row.get(9)?),
        permissions: row.get(10)?,
        content_hash: hash.as_deref().and_then(ContentHash::from_slice),
        deleted: row.get(12)?,
    })
}

/// Session row as stored, before the text columns are parsed.
pub(crate) struct SessionRow {
    id: i64,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    counters: SessionCounters,
    current_path: Option<String>,
    error_message: Option<String>,
    config: String,
}

impl SessionRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            counters: SessionCounters {
                files_seen: from_sql_int(row.get(4)?),
                dirs_seen: from_sql_int(row.get(5)?),
                bytes_seen: from_sql_int(row.get(6)?),
                skipped: from_sql_int(row.get(7)?),
                files_hashed: from_sql_int(row.get(8)?),
                bytes_hashed: from_sql_int(row.get(9)?),
                hash_cache_hits: from_sql_int(row.get(10)?),
                hash_failures: from_sql_int(row.get(11)?),
            },
            current_path: row.get(12)?,
            error_message: row.get(13)?,
            config: row.get(14)?,
        })
    }

    pub(crate) fn into_session(self) -> Result<ScanSession> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|_| StoreError::Corrupt {
                message: format!("unknown session status '{}'", self.status),
            })?;
        let config: ScanConfig = serde_json::from_str(&self.config)?;

        Ok(ScanSession {
            id: SessionId(self.id),
            status,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            counters: self.counters,
            current_path: self.current_path.map(PathBuf::from),
            error_message: self.error_message,
            config,
        })
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            message: format!("bad timestamp '{text}': {e}"),
        })
}

pub(crate) fn path_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}
