//! Indexed file and directory entries.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Stable identifier of an indexed entry.
///
/// Assigned on first discovery and kept across re-scans, so ordering by id
/// is ordering by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl EntryId {
    /// Create a new EntryId.
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BLAKE3 content hash for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Rebuild a hash from a stored byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get the hash as a hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Type of indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory {
        /// Total number of files in this subtree.
        file_count: u64,
        /// Total number of directories in this subtree.
        dir_count: u64,
    },
}

impl EntryKind {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory { .. })
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File)
    }
}

/// A single file or directory row of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier for this entry.
    pub id: EntryId,

    /// Full path (unique across the index).
    pub path: PathBuf,

    /// Parent directory, `None` for scan roots.
    pub parent: Option<EntryId>,

    /// File/directory name (not full path).
    pub name: CompactString,

    /// Entry type and associated counts.
    pub kind: EntryKind,

    /// Size in bytes (aggregate of descendant files for directories).
    pub size: u64,

    /// Lowercased extension without the dot (files only).
    pub extension: Option<CompactString>,

    /// Last modification time.
    pub modified: SystemTime,

    /// Permission bits.
    pub permissions: u32,

    /// Content hash, once computed (files only).
    pub content_hash: Option<ContentHash>,

    /// Tombstoned by a delete or because it vanished from disk.
    pub deleted: bool,
}

impl Entry {
    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this entry is a file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Get file count for directories, 1 for files.
    pub fn file_count(&self) -> u64 {
        match self.kind {
            EntryKind::Directory { file_count, .. } => file_count,
            EntryKind::File => 1,
        }
    }

    /// Get directory count for directories.
    pub fn dir_count(&self) -> u64 {
        match self.kind {
            EntryKind::Directory { dir_count, .. } => dir_count,
            EntryKind::File => 0,
        }
    }
}

/// Lowercased extension of a file name, without the leading dot.
pub fn extension_of(name: &str) -> Option<CompactString> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(CompactString::new(ext.to_lowercase()))
}

/// Encode a timestamp as signed nanoseconds relative to the Unix epoch.
pub fn system_time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Inverse of [`system_time_to_nanos`].
pub fn nanos_to_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// Largest children of a folder plus a summary of the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildListing {
    /// The largest children, sorted by size descending.
    pub entries: Vec<Entry>,
    /// Children cut off by the listing cap.
    pub remainder: Option<ListingRemainder>,
}

impl ChildListing {
    /// Total number of children, shown or summarized.
    pub fn total_children(&self) -> u64 {
        self.entries.len() as u64 + self.remainder.map_or(0, |r| r.count)
    }
}

/// Summary of the children omitted from a capped listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRemainder {
    /// Number of omitted children.
    pub count: u64,
    /// Combined size of omitted children.
    pub total_size: u64,
}
