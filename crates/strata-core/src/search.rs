//! Filtered, paginated entry search.

use std::path::PathBuf;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::entry::Entry;

/// Column an entry search is ordered by.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortKey {
    #[default]
    Size,
    Name,
    Modified,
}

/// Criteria for [`EntryPage`] searches. Every set field must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryFilter {
    /// Only entries whose path starts with this prefix.
    pub path_prefix: Option<PathBuf>,
    /// Case-insensitive substring of the entry name.
    pub name_contains: Option<String>,
    /// Exact extension, without the leading dot.
    pub extension: Option<String>,
    /// Minimum size in bytes, inclusive.
    pub min_size: Option<u64>,
    /// Maximum size in bytes, inclusive.
    pub max_size: Option<u64>,
    pub sort: SortKey,
    pub descending: bool,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self {
            path_prefix: None,
            name_contains: None,
            extension: None,
            min_size: None,
            max_size: None,
            sort: SortKey::Size,
            descending: true,
        }
    }
}

impl EntryFilter {
    /// Extension in the stored form: lowercase, no leading dot.
    pub fn normalized_extension(&self) -> Option<CompactString> {
        self.extension
            .as_deref()
            .map(|ext| ext.trim_start_matches('.'))
            .filter(|ext| !ext.is_empty())
            .map(|ext| CompactString::new(ext.to_lowercase()))
    }
}

/// One page of matching live entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    /// Matches across all pages.
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl EntryPage {
    /// Number of pages at this page size.
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }
}
