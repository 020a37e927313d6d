//! Core types for strata.
//!
//! This crate provides the data structures shared by the store, the scan
//! orchestrator and the analysis views: indexed entries, scan sessions,
//! the configuration snapshot and the error taxonomy.

mod config;
mod entry;
mod error;
mod search;
mod session;

pub use config::{MAX_AUTO_HASH_WORKERS, ScanConfig, ScanConfigBuilder};
pub use entry::{
    ChildListing, ContentHash, Entry, EntryId, EntryKind, ListingRemainder, extension_of,
    nanos_to_system_time, system_time_to_nanos,
};
pub use error::{ScanError, ScanWarning, WarningKind};
pub use search::{EntryFilter, EntryPage, SortKey};
pub use session::{
    ExtensionStats, ScanSession, SessionCounters, SessionId, SessionStatus, StorageSnapshot,
};
