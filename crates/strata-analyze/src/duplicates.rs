//! Duplicate file groups derived from stored content hashes.
//!
//! Grouping runs in two phases:
//! 1. Bucket hashed files by size (in SQL, discarding unique sizes)
//! 2. Group each bucket by content hash (parallel across buckets)
//!
//! The index caches its groups per size bucket. A refresh reads only the
//! rows whose change stamp moved since the last refresh and recomputes the
//! buckets those rows left or entered, so it always agrees with a full
//! rebuild over the same rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use derive_builder::Builder;
use itertools::Itertools;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use strata_core::{ContentHash, EntryId};
use strata_store::{HashedFile, Result, TreeStore};

/// Configuration for duplicate grouping.
#[derive(Debug, Clone, Builder, PartialEq, Eq)]
#[builder(setter(into))]
pub struct DuplicateConfig {
    /// Minimum file size to consider. Empty files all share one digest, so
    /// they are skipped unless this is 0.
    #[builder(default = "1")]
    pub min_size: u64,

    /// Maximum number of groups to return (0 = unlimited).
    #[builder(default = "0")]
    pub max_groups: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_groups: 0,
        }
    }
}

impl DuplicateConfig {
    /// Create a new config builder.
    pub fn builder() -> DuplicateConfigBuilder {
        DuplicateConfigBuilder::default()
    }
}

/// One file of a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMember {
    pub id: EntryId,
    pub path: PathBuf,
    /// First discovered member, suggested to keep.
    pub primary: bool,
}

/// A group of live files sharing size and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Content hash shared by all files in this group.
    pub hash: ContentHash,

    /// Size of each file in bytes.
    pub size: u64,

    /// Members in discovery order; the first is the primary.
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    /// Get the number of duplicate files.
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if keeping one file, how many could be deleted.
    pub fn deletable_count(&self) -> usize {
        self.members.len().saturating_sub(1)
    }

    /// Combined size of every member.
    pub fn total_bytes(&self) -> u64 {
        self.size * self.members.len() as u64
    }

    /// Space reclaimable by keeping only the primary.
    pub fn wasted_bytes(&self) -> u64 {
        self.size * self.deletable_count() as u64
    }

    /// The member suggested to keep.
    pub fn primary(&self) -> Option<&DuplicateMember> {
        self.members.iter().find(|m| m.primary)
    }
}

/// Duplicate groups plus totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateReport {
    /// Groups, sorted by wasted space descending.
    pub groups: Vec<DuplicateGroup>,

    /// Total size of all duplicate files.
    pub total_duplicate_size: u64,

    /// Total wasted space (could be reclaimed).
    pub total_wasted_space: u64,

    /// Number of files that have duplicates.
    pub files_with_duplicates: u64,

    /// Number of groups.
    pub group_count: usize,
}

impl DuplicateReport {
    /// Summarize a list of groups.
    pub fn from_groups(groups: Vec<DuplicateGroup>) -> Self {
        Self {
            total_duplicate_size: groups.iter().map(DuplicateGroup::total_bytes).sum(),
            total_wasted_space: groups.iter().map(DuplicateGroup::wasted_bytes).sum(),
            files_with_duplicates: groups.iter().map(|g| g.count() as u64).sum(),
            group_count: groups.len(),
            groups,
        }
    }

    /// Check if any duplicates were found.
    pub fn has_duplicates(&self) -> bool {
        !self.groups.is_empty()
    }
}

/// What a refresh had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// The whole index was rebuilt.
    pub full: bool,
    /// Changed rows read since the previous refresh.
    pub changed_rows: usize,
    /// Size buckets recomputed.
    pub buckets: usize,
}

#[derive(Default)]
struct IndexState {
    initialized: bool,
    watermark: i64,
    /// Size of every file currently in a group.
    member_sizes: HashMap<EntryId, u64>,
    buckets: BTreeMap<u64, Vec<DuplicateGroup>>,
}

impl IndexState {
    fn replace_bucket(&mut self, size: u64, groups: Vec<DuplicateGroup>) {
        if let Some(old) = self.buckets.remove(&size) {
            for member in old.iter().flat_map(|g| &g.members) {
                self.member_sizes.remove(&member.id);
            }
        }
        if groups.is_empty() {
            return;
        }
        for member in groups.iter().flat_map(|g| &g.members) {
            self.member_sizes.insert(member.id, size);
        }
        self.buckets.insert(size, groups);
    }
}

/// Cached duplicate groups over a [`TreeStore`].
pub struct DuplicateIndex {
    config: DuplicateConfig,
    state: Mutex<IndexState>,
}

impl DuplicateIndex {
    /// Create an empty index with default config.
    pub fn new() -> Self {
        Self::with_config(DuplicateConfig::default())
    }

    /// Create an empty index with custom config.
    pub fn with_config(config: DuplicateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Regroup every hashed file in the store.
    pub fn rebuild(&self, store: &TreeStore) -> Result<RefreshStats> {
        let mut state = self.state.lock();
        self.rebuild_locked(&mut state, store)
    }

    fn rebuild_locked(&self, state: &mut IndexState, store: &TreeStore) -> Result<RefreshStats> {
        // Read the stamp first: rows changing after this point are picked up
        // again by the next refresh.
        let watermark = store.max_change_seq()?;
        let files = store.hashed_files_with_shared_size()?;
        let groups = find_duplicates(files, &self.config);

        *state = IndexState {
            initialized: true,
            watermark,
            ..IndexState::default()
        };
        let mut buckets = 0;
        for (size, bucket) in &groups.into_iter().chunk_by(|g| g.size) {
            state.replace_bucket(size, bucket.collect());
            buckets += 1;
        }

        debug!(buckets, watermark, "Rebuilt duplicate index");
        Ok(RefreshStats {
            full: true,
            changed_rows: 0,
            buckets,
        })
    }

    /// Bring the cached groups up to date with the store.
    pub fn refresh(&self, store: &TreeStore) -> Result<RefreshStats> {
        let mut state = self.state.lock();
        if !state.initialized {
            return self.rebuild_locked(&mut state, store);
        }

        let changed = store.changed_since(state.watermark)?;
        let Some(last) = changed.last() else {
            return Ok(RefreshStats::default());
        };
        let watermark = last.change_seq;

        let mut touched = BTreeSet::new();
        for row in &changed {
            touched.insert(row.size);
            if let Some(old) = state.member_sizes.get(&row.id) {
                touched.insert(*old);
            }
        }

        for &size in &touched {
            let files = if size >= self.config.min_size {
                store.hashed_files_of_size(size)?
            } else {
                Vec::new()
            };
            state.replace_bucket(size, groups_in_bucket(files));
        }
        state.watermark = watermark;

        debug!(changed = changed.len(), buckets = touched.len(), watermark, "Refreshed duplicate index");
        Ok(RefreshStats {
            full: false,
            changed_rows: changed.len(),
            buckets: touched.len(),
        })
    }

    /// Refresh, then return the current groups.
    pub fn groups(&self, store: &TreeStore) -> Result<Vec<DuplicateGroup>> {
        self.refresh(store)?;
        let state = self.state.lock();
        let mut groups: Vec<DuplicateGroup> = state.buckets.values().flatten().cloned().collect();
        sort_groups(&mut groups);
        if self.config.max_groups > 0 {
            groups.truncate(self.config.max_groups);
        }
        Ok(groups)
    }

    /// Refresh, then summarize the current groups.
    pub fn report(&self, store: &TreeStore) -> Result<DuplicateReport> {
        Ok(DuplicateReport::from_groups(self.groups(store)?))
    }

    /// Forget all cached groups; the next refresh rebuilds from scratch.
    pub fn invalidate(&self) {
        *self.state.lock() = IndexState::default();
    }
}

impl Default for DuplicateIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Group hashed files into duplicate groups, sorted by size ascending.
///
/// Files must be ordered by size; within a size, discovery order decides
/// the primary member.
pub fn find_duplicates(files: Vec<HashedFile>, config: &DuplicateConfig) -> Vec<DuplicateGroup> {
    let buckets: Vec<Vec<HashedFile>> = files
        .into_iter()
        .filter(|f| f.size >= config.min_size)
        .chunk_by(|f| f.size)
        .into_iter()
        .map(|(_, bucket)| bucket.collect::<Vec<_>>())
        .filter(|bucket| bucket.len() > 1)
        .collect();

    buckets.into_par_iter().flat_map(groups_in_bucket).collect()
}

/// Split one size bucket into groups of at least two files with equal hashes.
fn groups_in_bucket(mut files: Vec<HashedFile>) -> Vec<DuplicateGroup> {
    if files.len() < 2 {
        return Vec::new();
    }
    files.sort_by_key(|f| (f.hash, f.id));

    let mut groups: Vec<DuplicateGroup> = files
        .into_iter()
        .chunk_by(|f| f.hash)
        .into_iter()
        .filter_map(|(hash, members)| {
            let members: Vec<HashedFile> = members.collect();
            if members.len() < 2 {
                return None;
            }
            let size = members[0].size;
            let members = members
                .into_iter()
                .enumerate()
                .map(|(i, f)| DuplicateMember {
                    id: f.id,
                    path: f.path,
                    primary: i == 0,
                })
                .collect();
            Some(DuplicateGroup {
                hash,
                size,
                members,
            })
        })
        .collect();
    sort_groups(&mut groups);
    groups
}

/// Largest waste first; ties broken by size then hash for stable output.
fn sort_groups(groups: &mut [DuplicateGroup]) {
    groups.sort_by(|a, b| {
        b.wasted_bytes()
            .cmp(&a.wasted_bytes())
            .then(b.size.cmp(&a.size))
            .then(a.hash.cmp(&b.hash))
    });
}
