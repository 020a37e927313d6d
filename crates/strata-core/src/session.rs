//! Scan sessions and their counters.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::config::ScanConfig;

/// Identifier of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a scan session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    /// No session has run yet.
    Idle,
    /// The walk is in progress.
    Running,
    /// The whole tree was walked and aggregated.
    Completed,
    /// A session-fatal error ended the walk.
    Failed,
    /// Cancelled by request or by the duration limit.
    Stopped,
}

impl SessionStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// Raw counters maintained by the walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Files indexed.
    pub files_seen: u64,
    /// Directories indexed.
    pub dirs_seen: u64,
    /// Bytes of all indexed files.
    pub bytes_seen: u64,
    /// Soft per-entry errors (unreadable or unsupported entries).
    pub skipped: u64,
    /// Files whose content was read and hashed.
    pub files_hashed: u64,
    /// Bytes read by the hashing engine.
    pub bytes_hashed: u64,
    /// Files whose hash was reused from a previous scan.
    pub hash_cache_hits: u64,
    /// Files whose hash could not be computed.
    pub hash_failures: u64,
}

impl SessionCounters {
    /// Record an indexed file.
    pub fn record_file(&mut self, size: u64) {
        self.files_seen += 1;
        self.bytes_seen += size;
    }

    /// Record an indexed directory.
    pub fn record_dir(&mut self) {
        self.dirs_seen += 1;
    }

    /// Record a soft error.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }
}

/// One run of the walker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    /// Session identity.
    pub id: SessionId,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Progress counters.
    pub counters: SessionCounters,
    /// Directory most recently completed.
    pub current_path: Option<PathBuf>,
    /// Last error, for failed and stopped sessions.
    pub error_message: Option<String>,
    /// Configuration captured at start.
    pub config: ScanConfig,
}

impl ScanSession {
    /// Create a running session.
    pub fn start(id: SessionId, config: ScanConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SessionStatus::Running,
            started_at,
            ended_at: None,
            counters: SessionCounters::default(),
            current_path: None,
            error_message: None,
            config,
        }
    }

    /// Check if the session is running.
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Time between start and end (or `now` while running).
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Duration of a finished session.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .map(|end| (end - self.started_at).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Daily storage totals recorded after completed scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// UTC day of the recording.
    pub day: NaiveDate,
    /// Total indexed bytes.
    pub total_size: u64,
    /// Total indexed files.
    pub file_count: u64,
    /// Total indexed directories.
    pub dir_count: u64,
}

/// Aggregate size of one file extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStats {
    /// Extension without the dot.
    pub extension: String,
    /// Number of live files.
    pub count: u64,
    /// Combined size of live files.
    pub total_size: u64,
}
