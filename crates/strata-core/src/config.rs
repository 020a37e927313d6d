//! Scan configuration snapshot.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Upper bound for the automatically sized hashing pool.
pub const MAX_AUTO_HASH_WORKERS: usize = 4;

/// Configuration for a scan session.
///
/// A copy of this struct is captured when a session starts and persisted
/// with it, so edits made while a scan runs only apply to the next one.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ScanConfig {
    /// Root directories to walk.
    pub roots: Vec<PathBuf>,

    /// Skip directories matching `excluded_dirs` (the exclusion toggle).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub skip_excluded_dirs: bool,

    /// Directory name patterns (case-insensitive globs) excluded as whole subtrees.
    #[builder(default = "default_excluded_dirs()")]
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,

    /// Include hidden files (starting with .).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub include_hidden: bool,

    /// Number of largest children returned per folder listing.
    #[builder(default = "100")]
    #[serde(default = "default_listing_cap")]
    pub listing_cap: usize,

    /// Wall-clock limit for one session in seconds (None = unlimited).
    #[builder(default = "Some(6 * 3600)")]
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: Option<u64>,

    /// Concurrent hashing workers (0 = auto-detect, capped).
    #[builder(default = "0")]
    #[serde(default)]
    pub hash_workers: usize,

    /// Files that may wait in the hashing queue before the walk blocks.
    #[builder(default = "256")]
    #[serde(default = "default_hash_queue_depth")]
    pub hash_queue_depth: usize,

    /// Store operations per committed batch.
    #[builder(default = "500")]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Stop after this many top-level directories of the roots (None = all).
    #[builder(default)]
    #[serde(default)]
    pub max_top_level_dirs: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_excluded_dirs() -> Vec<String> {
    ["appdata", "cache", "*.cache", "tmp", "temp", "docker", "containers"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_listing_cap() -> usize {
    100
}

fn default_max_duration_secs() -> Option<u64> {
    Some(6 * 3600)
}

fn default_hash_queue_depth() -> usize {
    256
}

fn default_batch_size() -> usize {
    500
}

impl ScanConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.roots {
            Some(ref roots) if roots.is_empty() => {
                return Err("At least one root path is required".to_string());
            }
            Some(ref roots) => {
                if roots.iter().any(|r| r.as_os_str().is_empty()) {
                    return Err("Root path cannot be empty".to_string());
                }
            }
            None => return Err("Root path is required".to_string()),
        }
        if self.listing_cap == Some(0) {
            return Err("Listing cap must be at least 1".to_string());
        }
        if self.max_top_level_dirs == Some(Some(0)) {
            return Err("Top-level directory limit must be at least 1".to_string());
        }
        if self.batch_size == Some(0) {
            return Err("Batch size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl ScanConfig {
    /// Create a new scan config builder.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Create a config with defaults for a single root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
            skip_excluded_dirs: true,
            excluded_dirs: default_excluded_dirs(),
            include_hidden: true,
            listing_cap: default_listing_cap(),
            max_duration_secs: default_max_duration_secs(),
            hash_workers: 0,
            hash_queue_depth: default_hash_queue_depth(),
            batch_size: default_batch_size(),
            max_top_level_dirs: None,
        }
    }

    /// Maximum duration of a session, if bounded.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }

    /// Effective size of the hashing worker pool.
    pub fn effective_hash_workers(&self) -> usize {
        match self.hash_workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_AUTO_HASH_WORKERS),
            n => n,
        }
    }

    /// Check if hidden files should be skipped.
    pub fn should_skip_hidden(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new(".")
    }
}
