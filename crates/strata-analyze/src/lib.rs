//! Analysis views derived from the strata index.
//!
//! - **Duplicate detection** - group stored files by size, then by content hash
//!
//! # Duplicate Detection
//!
//! The [`DuplicateIndex`] never reads file contents. It works on the hashes
//! the scan already stored and keeps its groups cached between calls:
//!
//! ```rust,ignore
//! use strata_analyze::DuplicateIndex;
//! use strata_store::TreeStore;
//!
//! let store = TreeStore::open("/var/lib/strata/index.db")?;
//! let index = DuplicateIndex::new();
//! let report = index.report(&store)?;
//!
//! println!("Found {} duplicate groups", report.group_count);
//! println!("Wasted space: {} bytes", report.total_wasted_space);
//! ```

mod duplicates;

pub use duplicates::{
    DuplicateConfig, DuplicateConfigBuilder, DuplicateGroup, DuplicateIndex, DuplicateMember,
    DuplicateReport, RefreshStats, find_duplicates,
};

// Re-export core types
pub use strata_core::{ContentHash, EntryId};
