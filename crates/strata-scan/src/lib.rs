//! Scan orchestration for strata.
//!
//! This crate walks directory trees into the index kept by `strata-store`
//! and owns the scan lifecycle around it.
//!
//! # Overview
//!
//! - **Path classification** with case-insensitive directory exclusion
//! - **Sequential pre-order walk** via jwalk, writing bottom-up aggregates
//! - **Bounded hashing pool** that reuses hashes of unchanged files
//! - **Singleton sessions** with stop, duration limit and force-reset
//! - **Progress heartbeats** via broadcast channels
//!
//! # Example
//!
//! ```rust,no_run
//! use strata_scan::{ScanConfig, ScanOrchestrator};
//!
//! let orchestrator = ScanOrchestrator::open("index.db", ScanConfig::new("/mnt/user")).unwrap();
//! orchestrator.start_scan().unwrap();
//! let outcome = orchestrator.wait().unwrap();
//!
//! println!("Scan ended {} after {} files", outcome.status, outcome.counters.files_seen);
//! ```
//!
//! # Progress Monitoring
//!
//! Subscribe to heartbeats emitted after each directory completes:
//!
//! ```rust,no_run
//! use strata_scan::{ScanConfig, ScanOrchestrator};
//!
//! let orchestrator = ScanOrchestrator::open("index.db", ScanConfig::new("/mnt/user")).unwrap();
//! let mut progress_rx = orchestrator.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(progress) = progress_rx.recv().await {
//!         println!("Scanned {} files", progress.counters.files_seen);
//!     }
//! });
//! ```

mod classifier;
mod hasher;
mod orchestrator;
mod progress;
mod walker;

pub use classifier::{Classification, EntryType, PathClassifier};
pub use hasher::{Digest, HashJob, HashOutcome, HashingEngine, hash_file};
pub use orchestrator::{DeletedEntry, ScanOrchestrator, ScanOutcome};
pub use progress::{Baseline, ProgressEstimate, ProgressReporter, ScanProgress, ScanStatusReport};
pub use walker::{TreeWalker, WalkEnd, WalkError};

// Re-export core types for convenience
pub use strata_analyze::DuplicateGroup;
pub use strata_core::{
    ChildListing, Entry, EntryFilter, EntryId, EntryPage, ScanConfig, ScanError, ScanSession,
    SessionCounters, SessionId, SessionStatus, SortKey,
};
pub use strata_store::{HistoryPage, TreeStore};
