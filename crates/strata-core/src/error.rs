//! Error types for scanning operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::EntryId;

/// Errors surfaced by scan sessions and the operations around them.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Another session is already running.
    #[error("Scan already running")]
    AlreadyRunning,

    /// No live scan to act on.
    #[error("No scan is running")]
    NotRunning,

    /// The operation is refused while a scan is writing to the index.
    #[error("Operation not allowed while a scan is running")]
    ScanInProgress,

    /// A configured root cannot be read.
    #[error("Cannot read scan root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configured root is itself covered by the exclusion rules.
    #[error("Cannot scan excluded path: {path}")]
    ExcludedRoot { path: PathBuf },

    /// Root path is not a directory.
    #[error("Root path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// No entry with this id is indexed.
    #[error("Entry not found: {id}")]
    EntryNotFound { id: EntryId },

    /// The entry is a directory where a file was required.
    #[error("Not a file: {path}")]
    NotAFile { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The index store failed.
    #[error("Storage error: {source}")]
    Storage {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl ScanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Wrap a storage backend error.
    pub fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage {
            source: Box::new(source),
        }
    }
}

/// Kind of scan warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// Permission was denied.
    PermissionDenied,
    /// Symbolic link skipped without being followed.
    Symlink,
    /// Symbolic link whose target does not exist.
    BrokenSymlink,
    /// Socket, device or other unsupported entry.
    SpecialFile,
    /// Error reading file/directory.
    ReadError,
    /// Error reading metadata.
    MetadataError,
    /// File content could not be hashed.
    HashError,
}

/// Non-fatal warning encountered during scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanWarning {
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of warning.
    pub kind: WarningKind,
}

impl ScanWarning {
    /// Create a new scan warning.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: WarningKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a permission denied warning.
    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Permission denied: {}", path.display()),
            path,
            kind: WarningKind::PermissionDenied,
        }
    }

    /// Create a warning for a symlink that was not followed.
    pub fn symlink(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Symbolic link not followed: {}", path.display()),
            path,
            kind: WarningKind::Symlink,
        }
    }

    /// Create a warning for a symlink pointing at nothing.
    pub fn broken_symlink(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Broken symbolic link: {}", path.display()),
            path,
            kind: WarningKind::BrokenSymlink,
        }
    }

    /// Create a warning for sockets, fifos and devices.
    pub fn special_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Unsupported file type: {}", path.display()),
            path,
            kind: WarningKind::SpecialFile,
        }
    }

    /// Create a read error warning, mapping permission failures to their own kind.
    pub fn read_error(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::permission_denied(path);
        }
        let path = path.into();
        Self {
            message: format!("Read error: {error}"),
            path,
            kind: WarningKind::ReadError,
        }
    }

    /// Create a hashing failure warning.
    pub fn hash_error(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        let path = path.into();
        Self {
            message: format!("Hash failed: {message}"),
            path,
            kind: WarningKind::HashError,
        }
    }
}
