//! Include/exclude decisions for walked entries.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use strata_core::{ScanConfig, ScanError, WarningKind};

/// Kind of filesystem object, as reported without following links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Directory,
    File,
    Symlink,
    /// Socket, fifo, device node.
    Other,
}

impl EntryType {
    /// Derive the entry type from a `FileType` obtained without following links.
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// Outcome of classifying one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Index the entry (and descend, for directories).
    Include,
    /// Neither index nor descend. Not an error.
    ExcludeSubtree,
    /// Omit this single entry and count it as a soft error.
    SkipEntry(WarningKind),
}

/// Decides what the walk does with each entry.
///
/// Directory exclusion matches case-insensitive globs against the directory
/// name only, so `appdata` excludes `/mnt/user/AppData` but not
/// `/mnt/user/appdata-backup.txt`.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    excluded: Option<GlobSet>,
}

impl PathClassifier {
    /// Build a classifier from a configuration snapshot.
    pub fn new(config: &ScanConfig) -> Result<Self, ScanError> {
        if !config.skip_excluded_dirs || config.excluded_dirs.is_empty() {
            return Ok(Self { excluded: None });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.excluded_dirs {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| ScanError::InvalidConfig {
                    message: format!("invalid exclusion pattern '{pattern}': {e}"),
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ScanError::InvalidConfig {
            message: format!("invalid exclusion patterns: {e}"),
        })?;

        Ok(Self {
            excluded: Some(set),
        })
    }

    /// Whether a directory with this name is excluded as a whole subtree.
    pub fn is_excluded_dir_name(&self, name: &str) -> bool {
        self.excluded.as_ref().is_some_and(|set| set.is_match(name))
    }

    /// Classify a walked entry.
    pub fn classify(&self, path: &Path, entry_type: EntryType) -> Classification {
        match entry_type {
            EntryType::Directory => {
                let excluded = path
                    .file_name()
                    .is_some_and(|name| self.is_excluded_dir_name(&name.to_string_lossy()));
                if excluded {
                    Classification::ExcludeSubtree
                } else {
                    Classification::Include
                }
            }
            EntryType::File => Classification::Include,
            EntryType::Symlink => Classification::SkipEntry(WarningKind::Symlink),
            EntryType::Other => Classification::SkipEntry(WarningKind::SpecialFile),
        }
    }

    /// Check a configured root before walking it.
    pub fn check_root(&self, root: &Path) -> Result<(), ScanError> {
        match self.classify(root, EntryType::Directory) {
            Classification::ExcludeSubtree => Err(ScanError::ExcludedRoot {
                path: root.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }
}
