//! SQLite-backed tree store for strata.
//!
//! [`TreeStore`] owns the reader/admin connection and is shared by every
//! request context. A running scan gets exactly one [`TreeWriter`], which
//! buffers row operations and commits them in fenced batches so readers only
//! ever observe whole batches.

mod db;
mod error;
mod rows;
mod store;
mod writer;

pub use error::{Result, StoreError};
pub use store::{ChangedEntry, HashedFile, HistoryPage, TreeStore};
pub use strata_core::{EntryFilter, EntryPage, SortKey};
pub use writer::{
    CompletionSummary, DirectoryRecord, EnsuredDirectory, FileRecord, FileUpsert,
    TreeWriter, WriterOptions,
};
