//! End-to-end workflows across devices
//!
//! Each test plays several devices against one shared target directory:
//! migrating a flat dataset, editing it from separate working copies,
//! and converting it back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bundle_core::{
    BundleMode, BundlePath, DirKind, LoggingLockHandler, RetryPolicy, SyncSettings,
    WorkingDirectory, migrate, unmigrate,
};
use bundle_test_utils::TestDataset;
use pretty_assertions::assert_eq;

// =============================================================================
// Test Infrastructure
// =============================================================================

fn settings(device: &str) -> SyncSettings {
    SyncSettings {
        device_id: Some(device.to_string()),
        cache_staleness_ms: 0,
        background_flush: Some(false),
        lock_retry: RetryPolicy::immediate(1),
        shared_lock_retry: RetryPolicy::immediate(1),
        ..SyncSettings::default()
    }
}

/// Open a working copy of `target` in `working` for `device`.
fn open(
    data: &TestDataset,
    target: &str,
    working: &str,
    kind: DirKind,
    settings: SyncSettings,
) -> WorkingDirectory {
    let mut dir = WorkingDirectory::new(data.dir(target), data.dir(working), kind, settings).unwrap();
    dir.prepare().unwrap();
    dir
}

/// Poll `check` until it holds or five seconds pass.
fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

// =============================================================================
// Dashboard datasets
// =============================================================================

#[test]
fn test_migrated_dataset_is_shared_then_restored() {
    let data = TestDataset::new();
    data.write("shared", "state", "tasks v1");
    data.write("shared", "0.dat", "defects");
    let shared = data.dir("shared");

    assert!(migrate(&shared, DirKind::Dashboard, BundleMode::Local, &settings("server")).unwrap());
    data.assert_missing("shared", "state");

    // first device edits under the write lock
    let mut laptop = open(&data, "shared", "laptop", DirKind::Dashboard, settings("laptop"));
    data.assert_content("laptop", "state", "tasks v1");
    laptop
        .acquire_write_lock(Arc::new(LoggingLockHandler), "laptop-editor")
        .unwrap();
    data.write_with_mtime("laptop", "state", "tasks v2, edited", 1_700_000_500);
    data.write("laptop", "1.dat", "time log");
    assert!(laptop.flush_data().unwrap());
    laptop.release_write_lock();

    // second device only reads
    let desktop = open(&data, "shared", "desktop", DirKind::Dashboard, settings("desktop"));
    assert_eq!(
        data.snapshot("desktop"),
        data.snapshot("laptop"),
        "desktop should mirror the laptop"
    );
    assert_eq!(desktop.working_heads().unwrap(), laptop.published_heads().unwrap());

    drop(laptop);
    drop(desktop);
    assert!(unmigrate(&shared, DirKind::Dashboard, &settings("server")).unwrap());
    data.assert_content("shared", "state", "tasks v2, edited");
    data.assert_content("shared", "1.dat", "time log");
    data.assert_missing("shared", BundlePath::BundlesDir.as_str());
    data.assert_missing("shared", BundlePath::HeadsDir.as_str());
}

#[test]
fn test_second_writer_waits_for_release() {
    let data = TestDataset::new();
    let mut a = open(&data, "target", "a", DirKind::Dashboard, settings("deva"));
    let mut b = open(&data, "target", "b", DirKind::Dashboard, settings("devb"));

    a.acquire_write_lock(Arc::new(LoggingLockHandler), "alice").unwrap();
    assert!(b.acquire_write_lock(Arc::new(LoggingLockHandler), "bob").is_err());

    data.write("a", "state", "from a");
    assert!(a.flush_data().unwrap());
    a.release_write_lock();

    b.acquire_write_lock(Arc::new(LoggingLockHandler), "bob").unwrap();
    b.update().unwrap();
    data.assert_content("b", "state", "from a");

    data.write("b", "state", "from b, longer");
    assert!(b.flush_data().unwrap());
    b.release_write_lock();

    a.update().unwrap();
    data.assert_content("a", "state", "from b, longer");
}

#[test]
fn test_background_flush_reaches_other_device() {
    let data = TestDataset::new();
    let fast = SyncSettings {
        background_flush: Some(true),
        flush_tick_ms: Some(10),
        flush_frequency: 1,
        full_flush_frequency: 1,
        ..settings("deva")
    };
    let mut writer = open(&data, "target", "a", DirKind::Dashboard, fast);
    let reader = open(&data, "target", "b", DirKind::Dashboard, settings("devb"));
    writer
        .acquire_write_lock(Arc::new(LoggingLockHandler), "alice")
        .unwrap();

    data.write("a", "state", "autosaved");
    assert!(eventually(|| {
        reader.update().is_ok() && data.root().join("b").join("state").exists()
    }));
    data.assert_content("b", "state", "autosaved");
    writer.release_write_lock();
}

// =============================================================================
// WBS datasets
// =============================================================================

#[test]
fn test_team_devices_exchange_pdash_files() {
    let data = TestDataset::new();
    let mut alice = open(&data, "team", "alice", DirKind::Wbs, settings("alice"));
    let mut bob = open(&data, "team", "bob", DirKind::Wbs, settings("bob"));
    alice.set_enforce_locks(false);
    bob.set_enforce_locks(false);
    alice.acquire_write_lock(Arc::new(LoggingLockHandler), "alice").unwrap();
    bob.acquire_write_lock(Arc::new(LoggingLockHandler), "bob").unwrap();

    data.write("alice", "projDump.xml", "<wbs/>");
    data.write("alice", "alice.pdash", "alice data");
    assert!(alice.flush_data().unwrap());

    data.write("bob", "bob.pdash", "bob data");
    assert!(bob.flush_data().unwrap());
    bob.update().unwrap();
    data.assert_content("bob", "alice.pdash", "alice data");
    data.assert_content("bob", "projDump.xml", "<wbs/>");

    alice.update().unwrap();
    data.assert_content("alice", "bob.pdash", "bob data");

    let heads = alice.published_heads().unwrap();
    assert_eq!(
        heads.keys().cloned().collect::<Vec<_>>(),
        vec!["alice,pdash", "bob,pdash", "wbs"]
    );
    data.assert_exists("team/heads", "pdash-alice,pdash.txt");
    data.assert_exists("team/heads", "pdash-bob,pdash.txt");
}

#[test]
fn test_wbs_migration_round_trip_with_disseminate() {
    let data = TestDataset::new();
    data.write("wbs", "projDump.xml", "<wbs/>");
    data.write("wbs/disseminate", "jd.pdash", "exported");
    let wbs = data.dir("wbs");

    assert!(migrate(&wbs, DirKind::Wbs, BundleMode::Local, &settings("server")).unwrap());
    data.assert_missing("wbs", "projDump.xml");
    data.assert_missing("wbs/disseminate", "jd.pdash");

    let reader = open(&data, "wbs/disseminate", "copy", DirKind::Disseminate, settings("reader"));
    data.assert_content("copy", "jd.pdash", "exported");
    drop(reader);

    assert!(unmigrate(&wbs, DirKind::Wbs, &settings("server")).unwrap());
    data.assert_content("wbs", "projDump.xml", "<wbs/>");
    data.assert_content("wbs/disseminate", "jd.pdash", "exported");
}
