//! Tests for the working directory lifecycle, write lock and background flush

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bundle_core::{
    DeviceId, DeviceLockManager, DirKind, DirectoryState, Error, LockMessage, LoggingLockHandler,
    RetryPolicy, SyncSettings, WorkingDirectory,
};
use bundle_test_utils::TestDataset;

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

fn open(data: &TestDataset, working: &str, settings: SyncSettings) -> WorkingDirectory {
    WorkingDirectory::new(data.dir("target"), data.dir(working), DirKind::Dashboard, settings)
        .unwrap()
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

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_states_follow_lock_lifecycle() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));
        assert_eq!(dir.state(), DirectoryState::Uninitialized);

        dir.prepare().unwrap();
        assert_eq!(dir.state(), DirectoryState::Prepared);

        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        assert_eq!(dir.state(), DirectoryState::Locked);

        dir.release_write_lock();
        assert_eq!(dir.state(), DirectoryState::Prepared);
    }

    #[test]
    fn test_operations_before_prepare_fail() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));

        assert!(matches!(dir.update(), Err(Error::NotPrepared { .. })));
        let err = dir
            .acquire_write_lock(Arc::new(LoggingLockHandler), "tester")
            .unwrap_err();
        assert!(matches!(err, Error::NotPrepared { .. }));
    }

    #[test]
    fn test_prepare_is_repeatable() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));
        dir.prepare().unwrap();
        dir.prepare().unwrap();
        assert_eq!(dir.state(), DirectoryState::Prepared);
    }

    #[test]
    fn test_metadata_lives_in_working_dir() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));
        dir.prepare().unwrap();
        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        data.write("w", "state", "s");
        assert!(dir.flush_data().unwrap());

        data.assert_exists("w/metadata", "heads.txt");
        data.assert_exists("w/metadata", "fileDataCache.xml");
        data.assert_exists("target/heads", "heads.txt");
        data.assert_exists("target/bundles", "timezone.txt");
    }
}

mod write_lock_tests {
    use super::*;

    #[test]
    fn test_flush_requires_write_lock() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));
        dir.prepare().unwrap();

        assert!(matches!(dir.flush_data(), Err(Error::NotLocked { .. })));
    }

    #[test]
    fn test_second_writer_is_refused() {
        let data = TestDataset::new();
        let mut first = open(&data, "a", settings("dev1"));
        first.prepare().unwrap();
        first.acquire_write_lock(Arc::new(LoggingLockHandler), "first").unwrap();

        let mut second = open(&data, "b", settings("dev2"));
        second.prepare().unwrap();
        let err = second
            .acquire_write_lock(Arc::new(LoggingLockHandler), "second")
            .unwrap_err();
        match err {
            Error::AlreadyLocked { owner, .. } => assert_eq!(owner, "first"),
            other => panic!("unexpected error: {other}"),
        }

        first.release_write_lock();
        second
            .acquire_write_lock(Arc::new(LoggingLockHandler), "second")
            .unwrap();
    }

    #[test]
    fn test_dropping_directory_releases_lock() {
        let data = TestDataset::new();
        {
            let mut dir = open(&data, "a", settings("dev1"));
            dir.prepare().unwrap();
            dir.acquire_write_lock(Arc::new(LoggingLockHandler), "first").unwrap();
        }
        let mut dir = open(&data, "b", settings("dev2"));
        dir.prepare().unwrap();
        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "second").unwrap();
    }

    #[test]
    fn test_device_lock_follows_write_lock() {
        let data = TestDataset::new();
        let manager = Arc::new(DeviceLockManager::new(
            &data.dir("target"),
            DeviceId::new("dev1").unwrap(),
            Duration::from_secs(3600),
        ));
        let mut dir = open(&data, "w", settings("dev1"));
        dir.set_device_lock_manager(Arc::clone(&manager));
        dir.prepare().unwrap();

        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        assert!(manager.lock_file_path().exists());

        dir.release_write_lock();
        assert!(!manager.lock_file_path().exists());
    }

    #[test]
    fn test_unwritable_device_lock_does_not_block_writer() {
        let data = TestDataset::new();
        // a plain file where the locks directory should be
        data.write("target", "locks", "not a directory");
        let manager = Arc::new(DeviceLockManager::new(
            &data.dir("target"),
            DeviceId::new("dev1").unwrap(),
            Duration::from_secs(3600),
        ));
        let mut dir = open(&data, "w", settings("dev1"));
        dir.set_device_lock_manager(Arc::clone(&manager));
        dir.prepare().unwrap();

        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        assert_eq!(dir.state(), DirectoryState::Locked);
        assert!(!manager.lock_file_path().exists());

        data.write("w", "state", "still publishes");
        assert!(dir.flush_data().unwrap());
    }
}

mod flush_tests {
    use super::*;

    #[test]
    fn test_failed_excluded_files_do_not_fail_flush() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", settings("dev1"));
        dir.prepare().unwrap();
        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        data.write("w", "state", "v1");
        data.write("w", "log.txt", "started");
        assert!(dir.flush_data().unwrap());

        // the log bundle can no longer be read as a base
        let heads = dir.published_heads().unwrap();
        let manifest = data.dir("target/bundles").join(format!("{}.json", heads["log"].token()));
        std::fs::remove_file(manifest).unwrap();
        let cache = data.dir("w/metadata").join("fileDataCache.xml");
        std::fs::remove_file(&cache).unwrap();

        data.write("w", "state", "v2, after the log broke");
        data.write("w", "log.txt", "started\nflushed");
        assert!(dir.flush_data().unwrap());

        assert_ne!(dir.published_heads().unwrap()["core"], heads["core"]);
        assert_eq!(dir.published_heads().unwrap()["log"], heads["log"]);
        assert!(cache.exists());
    }
}

mod background_flush_tests {
    use super::*;

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            background_flush: Some(true),
            flush_tick_ms: Some(10),
            flush_frequency: 2,
            full_flush_frequency: 1,
            ..settings("dev1")
        }
    }

    #[test]
    fn test_worker_publishes_changes() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", fast_settings());
        dir.prepare().unwrap();
        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();

        data.write("w", "state", "s");
        data.write("w", "log.txt", "line");
        assert!(eventually(|| {
            dir.published_heads()
                .map(|h| h.contains_key("core") && h.contains_key("log"))
                .unwrap_or(false)
        }));
        dir.release_write_lock();
    }

    #[test]
    fn test_worker_reports_lost_lock() {
        let data = TestDataset::new();
        let messages: Arc<Mutex<Vec<LockMessage>>> = Arc::default();
        let sink = Arc::clone(&messages);

        let mut dir = open(&data, "w", fast_settings());
        dir.prepare().unwrap();
        dir.acquire_write_lock(
            Arc::new(move |m: LockMessage| sink.lock().unwrap().push(m)),
            "tester",
        )
        .unwrap();

        std::fs::remove_file(data.dir("target").join("write.lock")).unwrap();

        assert!(eventually(|| {
            messages
                .lock()
                .unwrap()
                .iter()
                .any(|m| matches!(m, LockMessage::LockInvalid { .. }))
        }));
        assert!(dir.assert_write_lock().is_err());
        dir.release_write_lock();
    }

    #[test]
    fn test_release_stops_worker() {
        let data = TestDataset::new();
        let mut dir = open(&data, "w", fast_settings());
        dir.prepare().unwrap();
        dir.acquire_write_lock(Arc::new(LoggingLockHandler), "tester").unwrap();
        dir.release_write_lock();

        data.write("w", "state", "s");
        std::thread::sleep(Duration::from_millis(100));
        assert!(dir.published_heads().unwrap().is_empty());
    }
}
