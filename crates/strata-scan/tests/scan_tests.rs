use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use strata_core::{EntryId, ScanError, SessionCounters, SessionStatus};
use strata_scan::{ScanConfig, ScanOrchestrator, ScanOutcome, TreeWalker, WalkEnd};
use strata_store::{StoreError, TreeStore, WriterOptions};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

struct Fixture {
    data: TempDir,
    state: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            data: TempDir::new().unwrap(),
            state: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> PathBuf {
        self.data.path().canonicalize().unwrap()
    }

    fn db_path(&self) -> PathBuf {
        self.state.path().join("index.db")
    }

    fn write(&self, rel: &str, size: usize) -> PathBuf {
        self.write_bytes(rel, &vec![b'x'; size])
    }

    fn write_bytes(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.data.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn config(&self) -> ScanConfig {
        let mut config = ScanConfig::new(self.data.path());
        config.hash_workers = 2;
        config
    }

    fn orchestrator(&self) -> ScanOrchestrator {
        ScanOrchestrator::open(self.db_path(), self.config()).unwrap()
    }
}

fn run_scan(orchestrator: &ScanOrchestrator) -> ScanOutcome {
    orchestrator.start_scan().unwrap();
    orchestrator.wait().unwrap()
}

fn wide_tree(fx: &Fixture, dirs: usize) {
    for i in 0..dirs {
        fx.write(&format!("d{i:04}/file.bin"), 16);
    }
}

/// Live directories whose aggregates differ from their live children.
fn sum_violations(store: &TreeStore) -> Vec<String> {
    let mut violations = Vec::new();
    for dir in store.live_entries().unwrap().iter().filter(|e| e.is_dir()) {
        let children = store.children(dir.id).unwrap();
        let size: u64 = children.iter().map(|c| c.size).sum();
        let files: u64 = children.iter().map(|c| c.file_count()).sum();
        if dir.size != size || dir.file_count() != files {
            violations.push(format!(
                "{}: {} bytes in {} files, children hold {} bytes in {} files",
                dir.path.display(),
                dir.size,
                dir.file_count(),
                size,
                files
            ));
        }
    }
    violations
}

fn assert_sums_exact(store: &TreeStore) {
    let violations = sum_violations(store);
    assert!(violations.is_empty(), "aggregate drift: {violations:#?}");
}

/// Walk with one operation per batch, checking committed sums at every heartbeat.
fn walk_checking_sums(fx: &Fixture, store: &TreeStore) -> (Vec<String>, usize) {
    let config = fx.config();
    let session = store.create_session(&config).unwrap();
    let options = WriterOptions {
        batch_size: 1,
        ..Default::default()
    };
    let mut writer = store.writer(session.id, options).unwrap();

    let mut violations = Vec::new();
    let mut heartbeats = 0;
    let counters = {
        let mut walker = TreeWalker::new(
            config,
            &mut writer,
            CancellationToken::new(),
            |_: &SessionCounters, path: &Path| {
                heartbeats += 1;
                for violation in sum_violations(store) {
                    violations.push(format!("after {}: {violation}", path.display()));
                }
            },
        )
        .unwrap();
        assert_eq!(walker.run().unwrap(), WalkEnd::Completed);
        *walker.counters()
    };
    writer.complete(&counters, None).unwrap();
    (violations, heartbeats)
}

#[test]
fn test_scenario_a_root_size_is_exact_sum() {
    let fx = Fixture::new();
    for (i, size) in [100, 200, 300].iter().enumerate() {
        fx.write(&format!("first/f{i}.dat"), *size);
    }
    for (i, size) in [1000, 2000, 3000].iter().enumerate() {
        fx.write(&format!("second/g{i}.dat"), *size);
    }

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.counters.files_seen, 6);
    assert_eq!(outcome.counters.dirs_seen, 3);
    assert_eq!(outcome.counters.bytes_seen, 6600);

    let listing = orchestrator.tree_root().unwrap();
    assert_eq!(listing.entries.len(), 1);
    let root = &listing.entries[0];
    assert_eq!(root.path, fx.root());
    assert_eq!(root.size, 6600);
    assert_eq!(root.file_count(), 6);
    assert_eq!(root.dir_count(), 2);

    let children = orchestrator.tree_children(root.id).unwrap();
    let sizes: Vec<u64> = children.entries.iter().map(|e| e.size).collect();
    assert_eq!(sizes, vec![6000, 600]);
    assert_sums_exact(orchestrator.store());
}

#[test]
fn test_parent_chains_terminate_without_cycles() {
    let fx = Fixture::new();
    fx.write("a/b/c/d/deep.txt", 10);
    fx.write("a/side.txt", 5);
    fx.write("top.txt", 1);

    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);

    let entries = orchestrator.store().live_entries().unwrap();
    let by_id: HashMap<EntryId, _> = entries.iter().map(|e| (e.id, e)).collect();
    let paths: HashSet<&Path> = entries.iter().map(|e| e.path.as_path()).collect();
    assert_eq!(paths.len(), entries.len());

    for entry in &entries {
        let mut current = entry;
        let mut steps = 0;
        while let Some(parent) = current.parent {
            current = by_id[&parent];
            steps += 1;
            assert!(steps <= entries.len(), "cycle at {}", entry.path.display());
        }
        assert_eq!(current.path, fx.root());
    }
    assert_sums_exact(orchestrator.store());
}

#[test]
fn test_scenario_b_identical_files_form_one_group() {
    let fx = Fixture::new();
    let content = vec![42u8; 4096];
    fx.write_bytes("one/report.pdf", &content);
    fx.write_bytes("two/deeper/copy-of-report.bin", &content);
    fx.write("unique.txt", 4096);

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.counters.files_hashed, 3);

    let groups = orchestrator.duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.count(), 2);
    assert_eq!(group.size, 4096);
    assert_eq!(group.total_bytes(), 2 * 4096);
    assert_eq!(group.members.iter().filter(|m| m.primary).count(), 1);
}

#[test]
fn test_scenario_c_stop_then_restart() {
    let fx = Fixture::new();
    wide_tree(&fx, 300);

    let orchestrator = fx.orchestrator();
    let mut progress = orchestrator.subscribe();
    let first = orchestrator.start_scan().unwrap();
    let heartbeat = loop {
        match progress.blocking_recv() {
            Ok(heartbeat) => break heartbeat,
            Err(RecvError::Lagged(_)) => continue,
            Err(e) => panic!("progress channel closed: {e}"),
        }
    };
    assert_eq!(heartbeat.session, first);
    orchestrator.stop_scan().unwrap();

    let stopped = orchestrator.wait().unwrap();
    assert_eq!(stopped.session, first);
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert_eq!(stopped.error_message.as_deref(), Some("Stopped by user request"));

    // Everything up to the heartbeat survived the stop.
    let store = orchestrator.store();
    let completed_dir = store.entry_by_path(&heartbeat.current_path).unwrap().unwrap();
    assert!(!completed_dir.deleted);
    assert_eq!(completed_dir.file_count(), 1);
    assert!(store.live_entries().unwrap().len() >= 3);
    assert!(matches!(orchestrator.stop_scan(), Err(ScanError::NotRunning)));

    let second = orchestrator.start_scan().unwrap();
    assert_ne!(first, second);
    let running = store.session(second).unwrap().unwrap();
    assert!(matches!(
        running.status,
        SessionStatus::Running | SessionStatus::Completed
    ));
    let outcome = orchestrator.wait().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.counters.files_seen, 300);
}

#[test]
fn test_scenario_d_force_reset_stale_session() {
    let fx = Fixture::new();
    fx.write("keep/a.txt", 10);
    fx.write("keep/b.txt", 20);

    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);
    let before: Vec<_> = orchestrator
        .store()
        .live_entries()
        .unwrap()
        .into_iter()
        .map(|e| (e.id, e.path, e.size))
        .collect();

    // A crashed process left this marker behind.
    let stale = orchestrator.store().create_session(&fx.config()).unwrap();
    assert!(matches!(
        orchestrator.start_scan(),
        Err(ScanError::AlreadyRunning)
    ));
    assert_eq!(orchestrator.status().unwrap().status, SessionStatus::Running);
    assert!(!orchestrator.status().unwrap().worker_active);

    assert_eq!(orchestrator.force_reset_scan().unwrap(), 1);
    let report = orchestrator.status().unwrap();
    assert!(report.status.is_terminal());
    let session = report.session.unwrap();
    assert_eq!(session.id, stale.id);
    assert_eq!(session.error_message.as_deref(), Some("Force reset by user"));

    let after: Vec<_> = orchestrator
        .store()
        .live_entries()
        .unwrap()
        .into_iter()
        .map(|e| (e.id, e.path, e.size))
        .collect();
    assert_eq!(before, after);
    assert_eq!(run_scan(&orchestrator).status, SessionStatus::Completed);
}

#[test]
fn test_scenario_e_listing_cap_summarizes_remainder() {
    let fx = Fixture::new();
    for (i, size) in [10, 20, 30, 40, 50].iter().enumerate() {
        fx.write(&format!("wide/f{i}"), *size);
    }
    let mut config = fx.config();
    config.listing_cap = 2;
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();
    run_scan(&orchestrator);

    let wide = orchestrator
        .store()
        .entry_by_path(&fx.root().join("wide"))
        .unwrap()
        .unwrap();
    let listing = orchestrator.tree_children(wide.id).unwrap();
    let sizes: Vec<u64> = listing.entries.iter().map(|e| e.size).collect();
    assert_eq!(sizes, vec![50, 40]);
    let remainder = listing.remainder.unwrap();
    assert_eq!(remainder.count, 3);
    assert_eq!(remainder.total_size, 60);
    assert_eq!(listing.total_children(), 5);
}

#[test]
fn test_concurrent_starts_allow_one_session() {
    let fx = Fixture::new();
    wide_tree(&fx, 300);
    let orchestrator = fx.orchestrator();
    let barrier = Barrier::new(8);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    orchestrator.start_scan()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ScanError::AlreadyRunning))
    );
    assert_eq!(orchestrator.wait().unwrap().status, SessionStatus::Completed);
    assert_eq!(orchestrator.scan_history(1, 10).unwrap().total, 1);
}

#[test]
fn test_second_orchestrator_rejected_by_store() {
    let fx = Fixture::new();
    wide_tree(&fx, 300);
    let first = fx.orchestrator();
    let second = fx.orchestrator();

    first.start_scan().unwrap();
    assert!(matches!(second.start_scan(), Err(ScanError::AlreadyRunning)));
    first.wait().unwrap();
}

#[test]
fn test_rescan_reuses_unchanged_hashes() {
    let fx = Fixture::new();
    fx.write("a.bin", 1000);
    fx.write("b.bin", 2000);
    let changing = fx.write("c.bin", 3000);

    let orchestrator = fx.orchestrator();
    let first = run_scan(&orchestrator);
    assert_eq!(first.counters.files_hashed, 3);
    assert_eq!(first.counters.hash_cache_hits, 0);
    let a_path = fx.root().join("a.bin");
    let before = orchestrator.store().entry_by_path(&a_path).unwrap().unwrap();

    fs::write(&changing, vec![b'y'; 3500]).unwrap();
    let second = run_scan(&orchestrator);
    assert_eq!(second.counters.hash_cache_hits, 2);
    assert_eq!(second.counters.files_hashed, 1);
    assert_eq!(second.counters.bytes_hashed, 3500);

    let after = orchestrator.store().entry_by_path(&a_path).unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert!(after.content_hash.is_some());
    assert_eq!(after.content_hash, before.content_hash);
}

#[test]
fn test_rescan_sweeps_vanished_files() {
    let fx = Fixture::new();
    fx.write("stay/a.txt", 100);
    let gone = fx.write("stay/b.txt", 50);

    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);
    fs::remove_file(&gone).unwrap();

    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.swept, 1);
    let root = &orchestrator.tree_root().unwrap().entries[0];
    assert_eq!(root.size, 100);
    let entry = orchestrator
        .store()
        .entry_by_path(&fx.root().join("stay/b.txt"))
        .unwrap()
        .unwrap();
    assert!(entry.deleted);
    assert_sums_exact(orchestrator.store());
}

#[test]
fn test_excluded_directories_are_not_indexed() {
    let fx = Fixture::new();
    fx.write("AppData/config/huge.db", 5000);
    fx.write("photos/.cache/thumb.jpg", 700);
    fx.write("photos/pic.jpg", 300);
    fx.write("cache", 7);

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.counters.skipped, 0);

    let store = orchestrator.store();
    assert!(store.entry_by_path(&fx.root().join("AppData")).unwrap().is_none());
    assert!(store.entry_by_path(&fx.root().join("photos/.cache")).unwrap().is_none());
    assert!(store.entry_by_path(&fx.root().join("cache")).unwrap().is_some());
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 307);
}

#[test]
fn test_exclusion_toggle_off_indexes_everything() {
    let fx = Fixture::new();
    fx.write("AppData/huge.db", 5000);
    fx.write("pic.jpg", 300);

    let mut config = fx.config();
    config.skip_excluded_dirs = false;
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();
    run_scan(&orchestrator);
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 5300);
}

#[cfg(unix)]
#[test]
fn test_symlinks_are_skipped_softly() {
    let fx = Fixture::new();
    let target = fx.write("real.txt", 64);
    std::os::unix::fs::symlink(&target, fx.data.path().join("link.txt")).unwrap();
    std::os::unix::fs::symlink("/nonexistent/target", fx.data.path().join("broken")).unwrap();

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.counters.skipped, 2);
    assert_eq!(outcome.counters.files_seen, 1);
    assert!(
        orchestrator
            .store()
            .entry_by_path(&fx.root().join("link.txt"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_missing_root_fails_session() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.roots = vec![fx.data.path().join("does-not-exist")];
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();

    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Failed);
    assert!(
        outcome
            .error_message
            .unwrap()
            .contains("Cannot read scan root")
    );
    let report = orchestrator.status().unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(report.progress.is_none());
}

#[test]
fn test_excluded_root_fails_session() {
    let fx = Fixture::new();
    fx.write("appdata/x.txt", 1);
    let mut config = fx.config();
    config.roots = vec![fx.data.path().join("appdata")];
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();

    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Failed);
    assert!(outcome.error_message.unwrap().contains("excluded"));
    assert!(orchestrator.tree_root().unwrap().entries.is_empty());
}

#[test]
fn test_duration_limit_stops_session() {
    let fx = Fixture::new();
    fx.write("a.txt", 1);
    let mut config = fx.config();
    config.max_duration_secs = Some(0);
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();

    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Stopped);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("maximum scan duration of 0 s exceeded")
    );
}

#[test]
fn test_delete_entry_updates_tree_and_duplicates() {
    let fx = Fixture::new();
    let content = vec![1u8; 512];
    fx.write_bytes("x/original.bin", &content);
    let copy = fx.write_bytes("x/copy.bin", &content);

    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);
    assert_eq!(orchestrator.duplicate_groups().unwrap().len(), 1);

    let store = orchestrator.store();
    let copy_entry = store.entry_by_path(&fx.root().join("x/copy.bin")).unwrap().unwrap();
    let deleted = orchestrator.delete_entry(copy_entry.id).unwrap();
    assert!(deleted.file_removed);
    assert!(!copy.exists());

    assert!(orchestrator.duplicate_groups().unwrap().is_empty());
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 512);
    assert_sums_exact(store);
    assert!(matches!(
        orchestrator.delete_entry(copy_entry.id),
        Err(ScanError::EntryNotFound { .. })
    ));

    let dir = store.entry_by_path(&fx.root().join("x")).unwrap().unwrap();
    assert!(matches!(
        orchestrator.delete_entry(dir.id),
        Err(ScanError::NotAFile { .. })
    ));
}

#[test]
fn test_delete_entry_tombstones_missing_file() {
    let fx = Fixture::new();
    let path = fx.write("vanishing.txt", 40);
    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);

    fs::remove_file(&path).unwrap();
    let entry = orchestrator
        .store()
        .entry_by_path(&fx.root().join("vanishing.txt"))
        .unwrap()
        .unwrap();
    let deleted = orchestrator.delete_entry(entry.id).unwrap();
    assert!(!deleted.file_removed);
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 0);
}

#[test]
fn test_tree_children_rejects_files_and_unknown_ids() {
    let fx = Fixture::new();
    fx.write("only.txt", 3);
    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);

    let file = orchestrator
        .store()
        .entry_by_path(&fx.root().join("only.txt"))
        .unwrap()
        .unwrap();
    assert!(matches!(
        orchestrator.tree_children(file.id),
        Err(ScanError::NotADirectory { .. })
    ));
    assert!(matches!(
        orchestrator.tree_children(EntryId(9999)),
        Err(ScanError::EntryNotFound { .. })
    ));
}

#[test]
fn test_reset_database_allows_clean_restart() {
    let fx = Fixture::new();
    fx.write("a.txt", 10);
    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);
    assert_eq!(orchestrator.storage_history(30).unwrap().len(), 1);

    orchestrator.reset_database().unwrap();
    assert!(orchestrator.tree_root().unwrap().entries.is_empty());
    assert_eq!(orchestrator.scan_history(1, 10).unwrap().total, 0);
    assert_eq!(orchestrator.status().unwrap().status, SessionStatus::Idle);
    assert!(orchestrator.duplicate_groups().unwrap().is_empty());

    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 10);
}

#[test]
fn test_status_and_history_after_runs() {
    let fx = Fixture::new();
    fx.write("a.txt", 10);
    let orchestrator = fx.orchestrator();
    assert_eq!(orchestrator.status().unwrap().status, SessionStatus::Idle);
    assert!(matches!(orchestrator.stop_scan(), Err(ScanError::NotRunning)));

    run_scan(&orchestrator);
    run_scan(&orchestrator);

    let report = orchestrator.status().unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert!(report.progress.is_none());
    assert!(!report.worker_active);

    let page = orchestrator.scan_history(1, 1).unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.page_count(), 2);
    assert_eq!(page.sessions.len(), 1);
    assert!(page.sessions[0].id > orchestrator.scan_history(2, 1).unwrap().sessions[0].id);
    assert_eq!(orchestrator.extension_summary(5).unwrap()[0].extension, "txt");
}

#[test]
fn test_config_edit_does_not_affect_snapshot() {
    let fx = Fixture::new();
    fx.write("a.txt", 10);
    let orchestrator = fx.orchestrator();
    let id = orchestrator.start_scan().unwrap();

    let mut edited = fx.config();
    edited.listing_cap = 7;
    orchestrator.set_config(edited);
    orchestrator.wait().unwrap();

    let session = orchestrator.store().session(id).unwrap().unwrap();
    assert_eq!(session.config.listing_cap, 100);
    assert_eq!(orchestrator.config().listing_cap, 7);
}

#[test]
fn test_walker_stop_preserves_walked_entries() {
    let fx = Fixture::new();
    fx.write("a/one.txt", 11);
    fx.write("a/two.txt", 22);
    fx.write("b/three.txt", 33);
    fx.write("c/four.txt", 44);

    let config = fx.config();
    let store = TreeStore::open(fx.db_path()).unwrap();
    let session = store.create_session(&config).unwrap();
    let mut writer = store.writer(session.id, WriterOptions::default()).unwrap();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut heartbeats = Vec::new();
    let (end, counters) = {
        let mut walker = TreeWalker::new(
            config,
            &mut writer,
            cancel,
            |_: &SessionCounters, path: &Path| {
                heartbeats.push(path.to_path_buf());
                token.cancel();
            },
        )
        .unwrap();
        let end = walker.run().unwrap();
        (end, *walker.counters())
    };
    assert_eq!(end, WalkEnd::Cancelled);
    assert_eq!(heartbeats[0], fx.root().join("a"));

    writer.flush().unwrap();
    writer
        .finish(SessionStatus::Stopped, &counters, None, Some("Stopped by user request"))
        .unwrap();

    let a = store.entry_by_path(&fx.root().join("a")).unwrap().unwrap();
    assert_eq!(a.size, 33);
    assert!(store.entry_by_path(&fx.root().join("a/two.txt")).unwrap().is_some());
    assert!(store.entry_by_path(&fx.root().join("b")).unwrap().is_none());
    let root = store.entry_by_path(&fx.root()).unwrap().unwrap();
    assert_eq!(root.size, 33);
    assert_sums_exact(&store);
    assert_eq!(
        store.session(session.id).unwrap().unwrap().status,
        SessionStatus::Stopped
    );
}

#[test]
fn test_walker_deadline_halts_at_root() {
    let fx = Fixture::new();
    fx.write("a.txt", 5);
    let config = fx.config();
    let store = TreeStore::open(fx.db_path()).unwrap();
    let session = store.create_session(&config).unwrap();
    let mut writer = store.writer(session.id, WriterOptions::default()).unwrap();

    let mut walker = TreeWalker::new(config, &mut writer, CancellationToken::new(), |_, _| {})
        .unwrap()
        .with_deadline(Some(Instant::now()));
    assert_eq!(walker.run().unwrap(), WalkEnd::DeadlineExceeded);
    assert_eq!(walker.counters().files_seen, 0);
}

#[test]
fn test_fenced_worker_cannot_write_after_reset() {
    let fx = Fixture::new();
    fx.write("a.txt", 5);
    let config = fx.config();
    let store = Arc::new(TreeStore::open(fx.db_path()).unwrap());
    let session = store.create_session(&config).unwrap();
    let mut writer = store.writer(session.id, WriterOptions::default()).unwrap();

    store.force_reset_running("Force reset by user").unwrap();
    let mut walker =
        TreeWalker::new(config, &mut writer, CancellationToken::new(), |_, _| {}).unwrap();
    let result = walker.run();
    drop(walker);

    let fenced = match result {
        Err(e) => e.is_fenced(),
        Ok(_) => matches!(writer.flush(), Err(StoreError::Fenced { .. })),
    };
    assert!(fenced);
    assert!(store.live_entries().unwrap().is_empty());
}

#[test]
fn test_committed_sums_hold_at_every_heartbeat() {
    let fx = Fixture::new();
    for i in 0..3 {
        fx.write(&format!("a/f{i}.bin"), 100);
        fx.write(&format!("b/g{i}.bin"), 100);
    }
    fx.write("top.bin", 7);
    let store = TreeStore::open(fx.db_path()).unwrap();

    let (violations, heartbeats) = walk_checking_sums(&fx, &store);
    assert!(violations.is_empty(), "first scan: {violations:#?}");
    assert!(heartbeats >= 3);
    assert_eq!(store.entry_by_path(&fx.root()).unwrap().unwrap().size, 607);

    fs::remove_file(fx.data.path().join("a/f0.bin")).unwrap();
    fx.write("b/new.bin", 50);
    fx.write("c/d.bin", 25);

    let (violations, _) = walk_checking_sums(&fx, &store);
    assert!(violations.is_empty(), "rescan: {violations:#?}");
    let root = store.entry_by_path(&fx.root()).unwrap().unwrap();
    assert_eq!(root.size, 582);
    assert_eq!(root.file_count(), 8);
    assert_eq!(root.dir_count(), 3);
    assert_sums_exact(&store);
}

#[test]
fn test_top_level_limit_stops_walk() {
    let fx = Fixture::new();
    fx.write("a/x.bin", 10);
    fx.write("b/y.bin", 10);
    fx.write("c/z.bin", 10);
    fx.write("top.txt", 5);

    let mut config = fx.config();
    config.max_top_level_dirs = Some(2);
    let orchestrator = ScanOrchestrator::open(fx.db_path(), config).unwrap();
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Stopped);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("top-level directory limit of 2 reached")
    );

    let store = orchestrator.store();
    assert!(store.entry_by_path(&fx.root().join("b/y.bin")).unwrap().is_some());
    assert!(store.entry_by_path(&fx.root().join("c")).unwrap().is_none());
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 20);
    assert_sums_exact(store);

    let mut unlimited = fx.config();
    unlimited.max_top_level_dirs = None;
    orchestrator.set_config(unlimited);
    let outcome = run_scan(&orchestrator);
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 35);
}

#[cfg(unix)]
#[test]
fn test_unhashable_file_keeps_null_hash() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let content = vec![7u8; 256];
    fx.write_bytes("open.bin", &content);
    let locked = fx.write_bytes("locked.bin", &content);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::File::open(&locked).is_ok() {
        // Permission bits are not enforced for this user.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
        return;
    }

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.counters.files_seen, 2);
    assert_eq!(outcome.counters.hash_failures, 1);
    assert_eq!(outcome.counters.skipped, 1);

    let store = orchestrator.store();
    let entry = store.entry_by_path(&fx.root().join("locked.bin")).unwrap().unwrap();
    assert!(entry.content_hash.is_none());
    assert_eq!(entry.size, 256);
    let twin = store.entry_by_path(&fx.root().join("open.bin")).unwrap().unwrap();
    assert!(twin.content_hash.is_some());
    assert!(orchestrator.duplicate_groups().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn test_unreadable_directory_is_skipped_softly() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    fx.write("locked/inner.bin", 40);
    fx.write("open/a.bin", 10);
    let locked = fx.data.path().join("locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let orchestrator = fx.orchestrator();
    let outcome = run_scan(&orchestrator);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.counters.skipped, 1);
    assert_eq!(outcome.counters.files_seen, 1);

    let store = orchestrator.store();
    let dir = store.entry_by_path(&fx.root().join("locked")).unwrap().unwrap();
    assert_eq!(dir.size, 0);
    assert_eq!(dir.file_count(), 0);
    assert!(store.entry_by_path(&fx.root().join("locked/inner.bin")).unwrap().is_none());
    assert_eq!(orchestrator.tree_root().unwrap().entries[0].size, 10);
    assert_sums_exact(store);
}

#[test]
fn test_search_entries_through_orchestrator() {
    let fx = Fixture::new();
    fx.write("movies/film.MKV", 3000);
    fx.write("movies/notes.txt", 10);
    fx.write("music/song.flac", 900);

    let orchestrator = fx.orchestrator();
    run_scan(&orchestrator);

    let filter = strata_scan::EntryFilter {
        extension: Some("mkv".into()),
        ..Default::default()
    };
    let page = orchestrator.search_entries(&filter, 1, 10).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].path, fx.root().join("movies/film.MKV"));

    let under_music = strata_scan::EntryFilter {
        path_prefix: Some(fx.root().join("music")),
        ..Default::default()
    };
    let page = orchestrator.search_entries(&under_music, 1, 10).unwrap();
    let names: Vec<_> = page.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["music", "song.flac"]);
}
