use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

const SCHEMA_VERSION: i64 = 1;

/// Open a connection with the pragmas every strata connection uses.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -16000;
         PRAGMA busy_timeout = 5000;",
    )?;
    debug!("SQLite pragmas configured (WAL mode, 16MB cache)");
    Ok(())
}

/// Create the schema, or bring an older one up to date.
///
/// The index is derived data, so an unknown older version is dropped and
/// rebuilt by the next scan.
pub(crate) fn migrate_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version != 0 && version < SCHEMA_VERSION {
        debug!("Schema version {} < {}, recreating", version, SCHEMA_VERSION);
        conn.execute_batch(
            "DROP TABLE IF EXISTS storage_history;
             DROP TABLE IF EXISTS scan_sessions;
             DROP TABLE IF EXISTS entries;",
        )?;
    }

    conn.execute_batch(include_str!("schema.sql"))?;
    debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
    Ok(())
}

/// Store an unsigned counter in an INTEGER column.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Read an INTEGER column back as an unsigned counter.
pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Next value of the store-wide change stamp, evaluated inside the statement.
pub(crate) const NEXT_CHANGE_SEQ: &str = "(SELECT COALESCE(MAX(change_seq), 0) + 1 FROM entries)";
