//! Tests for converting datasets between flat and bundled layouts

use std::fs;
use std::sync::Arc;

use bundle_core::migrate::{BUNDLE_MODE_KEY, bundle_mode, read_stub_value, run_migration};
use bundle_core::{
    BundleMode, DirKind, Error, LoggingLockHandler, MigrationDirection, Migrator, Result,
    RetryPolicy, SyncSettings, WorkingDirectory, WriteLock, migrate, unmigrate,
};
use bundle_test_utils::TestDataset;

fn settings() -> SyncSettings {
    SyncSettings {
        device_id: Some("dev1".to_string()),
        cache_staleness_ms: 0,
        background_flush: Some(false),
        lock_retry: RetryPolicy::immediate(1),
        shared_lock_retry: RetryPolicy::immediate(1),
        ..SyncSettings::default()
    }
}

fn dashboard(data: &TestDataset) {
    data.write("ds", "state", "state data");
    data.write("ds", "0.dat", "task data");
    data.write("ds", "log.txt", "log line");
    data.write("ds", "pspdash.ini", "user=jane\n");
}

mod dashboard_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bundle_replaces_flat_files_with_stubs() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");

        assert!(migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap());

        data.assert_missing("ds", "state");
        data.assert_missing("ds", "0.dat");
        data.assert_missing("ds", "log.txt");
        data.assert_missing("ds", "metadata");
        assert_eq!(
            read_stub_value(&dir.join("pspdash.ini"), BUNDLE_MODE_KEY).unwrap().as_deref(),
            Some("local")
        );
        assert!(fs::metadata(dir.join("pspdash.ini")).unwrap().permissions().readonly());
        data.assert_exists("ds", "global.dat");
        assert_eq!(bundle_mode(&dir, DirKind::Dashboard).unwrap(), Some(BundleMode::Local));
        assert_eq!(fs::read_dir(dir.join("backup")).unwrap().count(), 1);
    }

    #[test]
    fn test_bundling_twice_is_a_noop() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");

        assert!(migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap());
        assert!(!migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap());
    }

    #[test]
    fn test_bundled_data_opens_in_separate_working_dir() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");
        migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap();

        let mut working =
            WorkingDirectory::new(&dir, data.dir("work"), DirKind::Dashboard, settings()).unwrap();
        working.prepare().unwrap();

        data.assert_content("work", "state", "state data");
        data.assert_content("work", "log.txt", "log line");
        data.assert_content("work", "pspdash.ini", "user=jane\n");
    }

    #[test]
    fn test_round_trip_restores_original_files() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");
        let before = data.snapshot("ds");

        migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap();
        assert!(unmigrate(&dir, DirKind::Dashboard, &settings()).unwrap());

        let mut after = data.snapshot("ds");
        after.remove("write.lock");
        assert_eq!(after, before);
        data.assert_missing("ds", "bundles");
        data.assert_missing("ds", "heads");
        data.assert_missing("ds", "metadata");

        let moved: Vec<String> = fs::read_dir(dir.join("backup"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(moved.iter().any(|n| n.ends_with("bundles")));
        assert!(moved.iter().any(|n| n.ends_with("heads")));
        assert!(!unmigrate(&dir, DirKind::Dashboard, &settings()).unwrap());
    }

    #[test]
    fn test_changes_made_while_bundled_survive_unbundle() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");
        migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap();

        {
            let mut working =
                WorkingDirectory::new(&dir, data.dir("work"), DirKind::Dashboard, settings())
                    .unwrap();
            working.prepare().unwrap();
            working
                .acquire_write_lock(Arc::new(LoggingLockHandler), "editor")
                .unwrap();
            data.write("work", "0.dat", "task data, edited");
            assert!(working.flush_data().unwrap());
        }

        unmigrate(&dir, DirKind::Dashboard, &settings()).unwrap();
        data.assert_content("ds", "0.dat", "task data, edited");
    }

    #[test]
    fn test_locked_directory_is_not_migrated() {
        let data = TestDataset::new();
        dashboard(&data);
        let dir = data.dir("ds");
        let _held = WriteLock::acquire(&dir, "someone else").unwrap();

        let err = migrate(&dir, DirKind::Dashboard, BundleMode::Local, &settings()).unwrap_err();
        assert!(matches!(err, Error::Migration { .. }));
        data.assert_content("ds", "state", "state data");
        data.assert_missing("ds", "bundles");
    }
}

mod wbs_tests {
    use super::*;

    fn wbs(data: &TestDataset) {
        data.write("team", "projDump.xml", "<project/>");
        data.write("team", "jd.pdash", "PK-jd");
        data.write("team/disseminate", "jd-data.pdash", "PK-export");
    }

    #[test]
    fn test_bundling_cascades_into_disseminate() {
        let data = TestDataset::new();
        wbs(&data);
        let dir = data.dir("team");

        assert!(migrate(&dir, DirKind::Wbs, BundleMode::Local, &settings()).unwrap());

        data.assert_exists("team", "user-settings.ini");
        data.assert_missing("team", "projDump.xml");
        data.assert_missing("team/disseminate", "jd-data.pdash");
        data.assert_exists("team/disseminate/heads", "pdash-jd-data,pdash.txt");
        data.assert_missing("team/disseminate", "write.lock");
    }

    #[test]
    fn test_unbundling_restores_nested_directory() {
        let data = TestDataset::new();
        wbs(&data);
        let dir = data.dir("team");

        migrate(&dir, DirKind::Wbs, BundleMode::Local, &settings()).unwrap();
        assert!(unmigrate(&dir, DirKind::Wbs, &settings()).unwrap());

        data.assert_content("team", "projDump.xml", "<project/>");
        data.assert_content("team", "jd.pdash", "PK-jd");
        data.assert_content("team/disseminate", "jd-data.pdash", "PK-export");
        data.assert_missing("team", "user-settings.ini");
        data.assert_missing("team/disseminate", "heads");
    }
}

mod migrator_contract_tests {
    use super::*;

    #[derive(Default)]
    struct FailingMigrator {
        disposed: bool,
    }

    impl Migrator for FailingMigrator {
        fn bundle(&mut self) -> Result<()> {
            Err(Error::Migration {
                path: "x".into(),
                message: "boom".into(),
            })
        }

        fn unbundle(&mut self) -> Result<()> {
            Ok(())
        }

        fn dispose(&mut self) {
            self.disposed = true;
        }
    }

    #[test]
    fn test_dispose_runs_after_failure() {
        let mut migrator = FailingMigrator::default();
        assert!(run_migration(&mut migrator, MigrationDirection::Bundle).is_err());
        assert!(migrator.disposed);
    }
}
