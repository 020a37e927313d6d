use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use strata_analyze::{DuplicateConfig, DuplicateGroup, DuplicateIndex, DuplicateReport};
use strata_core::{ContentHash, EntryId, ScanConfig};
use strata_store::{DirectoryRecord, FileRecord, TreeStore, TreeWriter, WriterOptions};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    store: TreeStore,
    writer: TreeWriter,
    root: EntryId,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = TreeStore::open(temp.path().join("index.db")).unwrap();
        let session = store.create_session(&ScanConfig::new("/data")).unwrap();
        let mut writer = store.writer(session.id, WriterOptions::default()).unwrap();
        let root = writer
            .ensure_directory(DirectoryRecord {
                path: PathBuf::from("/data"),
                parent: None,
                name: "data".into(),
                modified: UNIX_EPOCH,
                permissions: 0o755,
            })
            .unwrap()
            .id;
        Self {
            _temp: temp,
            store,
            writer,
            root,
        }
    }

    fn add(&mut self, name: &str, size: u64, hash: Option<u8>) -> EntryId {
        let id = self
            .writer
            .upsert_file(FileRecord {
                path: PathBuf::from("/data").join(name),
                parent: self.root,
                name: name.into(),
                size,
                extension: None,
                modified: UNIX_EPOCH + Duration::from_secs(1),
                permissions: 0o644,
            })
            .unwrap()
            .id;
        if let Some(byte) = hash {
            self.writer.set_hash(id, ContentHash::new([byte; 32]));
        }
        id
    }

    fn commit(&mut self) {
        self.writer.flush().unwrap();
    }
}

fn member_ids(groups: &[DuplicateGroup]) -> Vec<Vec<i64>> {
    groups
        .iter()
        .map(|g| g.members.iter().map(|m| m.id.0).collect())
        .collect()
}

#[test]
fn test_duplicate_config_builder() {
    let config = DuplicateConfig::builder()
        .min_size(2048u64)
        .max_groups(5usize)
        .build()
        .unwrap();

    assert_eq!(config.min_size, 2048);
    assert_eq!(config.max_groups, 5);

    // Test default config
    let default_config = DuplicateConfig::default();
    assert_eq!(default_config.min_size, 1);
    assert_eq!(default_config.max_groups, 0);
}

#[test]
fn test_duplicate_report_properties() {
    let report = DuplicateReport::from_groups(Vec::new());
    assert!(!report.has_duplicates());
    assert_eq!(report.group_count, 0);

    let mut fx = Fixture::new();
    fx.add("a.bin", 4096, Some(1));
    fx.add("b.bin", 4096, Some(1));
    fx.add("c.bin", 4096, Some(1));
    fx.commit();

    let report = DuplicateIndex::new().report(&fx.store).unwrap();
    assert!(report.has_duplicates());
    assert_eq!(report.group_count, 1);
    assert_eq!(report.files_with_duplicates, 3);
    assert_eq!(report.total_duplicate_size, 3 * 4096);
    assert_eq!(report.total_wasted_space, 2 * 4096);

    let group = &report.groups[0];
    assert_eq!(group.deletable_count(), 2);
    assert_eq!(group.hash.to_hex().len(), 64);
}

#[test]
fn test_groups_share_size_and_hash() {
    let mut fx = Fixture::new();
    fx.add("x1", 100, Some(1));
    fx.add("x2", 100, Some(1));
    fx.add("y1", 100, Some(2));
    fx.add("z1", 200, Some(1));
    fx.add("unhashed", 100, None);
    fx.commit();

    let groups = DuplicateIndex::new().groups(&fx.store).unwrap();
    assert_eq!(groups.len(), 1);
    for group in &groups {
        assert!(group.count() >= 2);
        let files: Vec<_> = group
            .members
            .iter()
            .map(|m| fx.store.entry(m.id).unwrap().unwrap())
            .collect();
        assert!(files.iter().all(|f| f.size == group.size));
        assert!(files.iter().all(|f| f.content_hash == Some(group.hash)));
        assert!(files.iter().all(|f| !f.deleted));
    }
}

#[test]
fn test_incremental_refresh_matches_full_rebuild() {
    let mut fx = Fixture::new();
    let a = fx.add("a", 10, Some(1));
    fx.add("b", 10, Some(1));
    fx.add("c", 20, Some(2));
    fx.commit();

    let incremental = DuplicateIndex::new();
    assert_eq!(incremental.groups(&fx.store).unwrap().len(), 1);

    // A new copy of c, a late hash for d, and a deleted a.
    fx.add("c-copy", 20, Some(2));
    let d = fx.add("d", 10, None);
    fx.commit();
    fx.writer.set_hash(d, ContentHash::new([1; 32]));
    fx.commit();
    assert!(fx.store.mark_deleted(a).unwrap());

    let stats = incremental.refresh(&fx.store).unwrap();
    assert!(!stats.full);
    assert!(stats.changed_rows >= 3);

    let refreshed = incremental.groups(&fx.store).unwrap();
    let rebuilt = DuplicateIndex::new().groups(&fx.store).unwrap();
    assert_eq!(refreshed, rebuilt);
    assert_eq!(refreshed.len(), 2);
    assert!(
        member_ids(&refreshed)
            .iter()
            .all(|ids| !ids.contains(&a.0))
    );
}

#[test]
fn test_deleted_member_dissolves_pair() {
    let mut fx = Fixture::new();
    let first = fx.add("first", 64, Some(9));
    let second = fx.add("second", 64, Some(9));
    fx.writer.finalize_directory(fx.root);
    fx.commit();

    let index = DuplicateIndex::new();
    let groups = index.groups(&fx.store).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].primary().map(|m| m.id), Some(first));

    assert!(fx.store.mark_deleted(second).unwrap());
    assert!(index.groups(&fx.store).unwrap().is_empty());
}

#[test]
fn test_refresh_without_changes_is_noop() {
    let mut fx = Fixture::new();
    fx.add("a", 10, Some(1));
    fx.add("b", 10, Some(1));
    fx.commit();

    let index = DuplicateIndex::new();
    assert!(index.refresh(&fx.store).unwrap().full);
    let stats = index.refresh(&fx.store).unwrap();
    assert!(!stats.full);
    assert_eq!(stats.changed_rows, 0);
    assert_eq!(index.groups(&fx.store).unwrap().len(), 1);
}

#[test]
fn test_max_groups_limits_output() {
    let mut fx = Fixture::new();
    for (i, size) in [10u64, 20, 30].iter().enumerate() {
        fx.add(&format!("{i}-a"), *size, Some(i as u8));
        fx.add(&format!("{i}-b"), *size, Some(i as u8));
    }
    fx.commit();

    let config = DuplicateConfig::builder().max_groups(2usize).build().unwrap();
    let groups = DuplicateIndex::with_config(config).groups(&fx.store).unwrap();
    assert_eq!(groups.len(), 2);
    // Largest waste first.
    assert_eq!(groups[0].size, 30);
    assert_eq!(groups[1].size, 20);
}
