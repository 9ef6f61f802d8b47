//! Reversible migration between the flat-file and bundled layouts.
//!
//! Both directions run under the directory's write lock and finish with
//! [`Migrator::dispose`], whether they succeed or not. Each step either
//! completes or can be re-run: bundling publishes every file before a
//! single legacy file is deleted, and unbundling moves the bundle store
//! aside instead of deleting it.

mod stubs;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundle_fs::{BundlePath, ReadableResourceCollection, io};
use tracing::{debug, info, warn};

pub use stubs::{
    BUNDLE_MODE_KEY, CompatibilityStub, REQUIRES_VERSION_KEY, compatibility_stubs, read_stub_value,
};

use crate::settings::SyncSettings;
use crate::strategy::DirKind;
use crate::working::{LoggingLockHandler, WorkingDirectory, WriteLock};
use crate::{Error, Result};

/// Owner recorded in the write lock while a migration runs.
pub const MIGRATION_OWNER: &str = "bundle-migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Bundle,
    Unbundle,
}

/// How a bundled directory is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMode {
    /// Bundles stored inside the dataset directory itself
    Local,
}

impl BundleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
        }
    }

    /// Oldest client version that understands this mode for `kind`.
    pub fn min_version(&self, kind: DirKind) -> &'static str {
        match (self, kind) {
            (Self::Local, DirKind::Dashboard) => "2.6.5",
            (Self::Local, DirKind::Wbs | DirKind::Disseminate) => "4.3.0",
        }
    }
}

impl std::str::FromStr for BundleMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            other => Err(format!("unknown bundle mode: {other}")),
        }
    }
}

/// The bundle mode of `dir`, or `None` if it holds flat files.
pub fn bundle_mode(dir: &Path, kind: DirKind) -> Result<Option<BundleMode>> {
    match compatibility_stubs(kind, BundleMode::Local).first() {
        Some(stub) => Ok(read_stub_value(&dir.join(stub.filename), BUNDLE_MODE_KEY)?
            .and_then(|mode| mode.parse().ok())),
        None => Ok(dir
            .join(BundlePath::HeadsDir)
            .is_dir()
            .then_some(BundleMode::Local)),
    }
}

/// One migration step over one directory.
pub trait Migrator {
    fn bundle(&mut self) -> Result<()>;
    fn unbundle(&mut self) -> Result<()>;
    /// Release locks and retry leftover cleanup. Safe to call more than once.
    fn dispose(&mut self);
}

/// Run `direction` on `migrator`, disposing it afterwards in every case.
pub fn run_migration(migrator: &mut dyn Migrator, direction: MigrationDirection) -> Result<()> {
    let result = match direction {
        MigrationDirection::Bundle => migrator.bundle(),
        MigrationDirection::Unbundle => migrator.unbundle(),
    };
    migrator.dispose();
    result
}

/// Convert flat `dir` to bundles. Returns `false` if it already is bundled.
pub fn migrate(dir: &Path, kind: DirKind, mode: BundleMode, settings: &SyncSettings) -> Result<bool> {
    if let Some(current) = bundle_mode(dir, kind)? {
        debug!(dir = %dir.display(), mode = current.as_str(), "Already bundled");
        return Ok(false);
    }
    let mut migrator = LocalMigrator::new(dir, kind, mode, settings.clone());
    run_migration(&mut migrator, MigrationDirection::Bundle)?;
    Ok(true)
}

/// Convert bundled `dir` back to flat files. Returns `false` if it is not
/// bundled.
pub fn unmigrate(dir: &Path, kind: DirKind, settings: &SyncSettings) -> Result<bool> {
    let Some(mode) = bundle_mode(dir, kind)? else {
        debug!(dir = %dir.display(), "Not bundled");
        return Ok(false);
    };
    let mut migrator = LocalMigrator::new(dir, kind, mode, settings.clone());
    run_migration(&mut migrator, MigrationDirection::Unbundle)?;
    Ok(true)
}

/// Migrates a directory whose bundles live inside it.
pub struct LocalMigrator {
    dir: PathBuf,
    kind: DirKind,
    mode: BundleMode,
    settings: SyncSettings,
    enforce_locks: bool,
    write_lock: Option<WriteLock>,
    directory: Option<WorkingDirectory>,
    nested: Option<Box<LocalMigrator>>,
    undeleted: Vec<PathBuf>,
}

impl LocalMigrator {
    pub fn new(dir: impl Into<PathBuf>, kind: DirKind, mode: BundleMode, settings: SyncSettings) -> Self {
        Self {
            dir: dir.into(),
            kind,
            mode,
            settings,
            enforce_locks: true,
            write_lock: None,
            directory: None,
            nested: None,
            undeleted: Vec::new(),
        }
    }

    /// Skip the write lock, for a step inside an already locked migration.
    pub fn without_locks(mut self) -> Self {
        self.enforce_locks = false;
        self
    }

    /// Files that could not be deleted yet.
    pub fn undeleted_files(&self) -> &[PathBuf] {
        &self.undeleted
    }

    fn lock(&mut self) -> Result<()> {
        if !self.enforce_locks || self.write_lock.is_some() {
            return Ok(());
        }
        let policy = if self.kind.is_contention_prone() {
            self.settings.shared_lock_retry
        } else {
            self.settings.lock_retry
        };
        let dir = self.dir.clone();
        let lock = policy
            .run(Error::is_lock_failure, || WriteLock::acquire(&dir, MIGRATION_OWNER))
            .map_err(|e| self.failure(format!("cannot lock directory: {e}")))?;
        self.write_lock = Some(lock);
        Ok(())
    }

    fn open_directory(&mut self) -> Result<&mut WorkingDirectory> {
        let mut directory = WorkingDirectory::in_place(&self.dir, self.kind, self.settings.clone())?;
        // the migrator holds the write lock itself
        directory.set_enforce_locks(false);
        directory.set_enable_background_flush(false);
        directory.prepare()?;
        directory.acquire_write_lock(Arc::new(LoggingLockHandler), MIGRATION_OWNER)?;
        Ok(self.directory.insert(directory))
    }

    fn nested_migrator(&self) -> Option<LocalMigrator> {
        let (subdir, kind) = self.kind.nested_directory()?;
        let path = self.dir.join(subdir);
        path.is_dir().then(|| {
            LocalMigrator::new(path, kind, self.mode, self.settings.clone()).without_locks()
        })
    }

    fn failure(&self, message: impl Into<String>) -> Error {
        Error::Migration {
            path: self.dir.clone(),
            message: message.into(),
        }
    }

    fn delete_legacy_file(&mut self, name: &str) {
        let path = self.dir.join(name);
        if let Err(e) = io::remove_file_if_exists(&path) {
            warn!(path = %path.display(), error = %e, "Could not delete legacy file; will retry");
            self.undeleted.push(path);
        }
    }

    fn write_stubs(&self) -> Result<()> {
        for stub in compatibility_stubs(self.kind, self.mode) {
            let path = self.dir.join(stub.filename);
            io::write_atomic(&path, stub.content.as_bytes())?;
            io::set_readonly(&path, true)?;
            debug!(path = %path.display(), "Wrote compatibility stub");
        }
        Ok(())
    }

    fn move_aside(&self, name: BundlePath, prefix: &str) -> Result<()> {
        let source = self.dir.join(name);
        if !source.exists() {
            return Ok(());
        }
        let backup_dir = self.dir.join(BundlePath::BackupDir);
        fs::create_dir_all(&backup_dir).map_err(|e| Error::io(&backup_dir, e))?;
        let dest = backup_dir.join(format!("{prefix}{name}"));
        fs::rename(&source, &dest).map_err(|e| Error::io(&source, e))?;
        info!(from = %source.display(), to = %dest.display(), "Moved bundle data aside");
        Ok(())
    }
}

impl Migrator for LocalMigrator {
    fn bundle(&mut self) -> Result<()> {
        info!(dir = %self.dir.display(), kind = ?self.kind, "Bundling directory");
        self.lock()?;

        let directory = self.open_directory()?;
        directory.do_backup("before-bundle")?;
        if !directory.flush_data()? {
            return Err(self.failure("could not publish every file"));
        }
        let legacy = directory.collection().list_resource_names()?;
        directory.release_write_lock();
        directory.delete_metadata()?;

        for name in &legacy {
            self.delete_legacy_file(name);
        }
        self.write_stubs()?;

        if let Some(mut nested) = self.nested_migrator() {
            let result = nested.bundle();
            self.nested = Some(Box::new(nested));
            result?;
        }
        info!(dir = %self.dir.display(), files = legacy.len(), "Bundled directory");
        Ok(())
    }

    fn unbundle(&mut self) -> Result<()> {
        info!(dir = %self.dir.display(), kind = ?self.kind, "Unbundling directory");
        self.lock()?;

        let stubs = compatibility_stubs(self.kind, self.mode);
        for stub in &stubs {
            let path = self.dir.join(stub.filename);
            if path.exists() {
                io::set_readonly(&path, false)?;
            }
        }

        let backup = crate::backup::BackupManager::new(&self.dir, self.kind.name_filter())
            .create_backup("before-unbundle")?;

        // stubs would otherwise count as local edits and shadow the bundled files
        for stub in &stubs {
            let path = self.dir.join(stub.filename);
            if io::read_text(&path).is_ok_and(|c| c == stub.content) {
                io::remove_file_if_exists(&path)?;
            }
        }

        let directory = self.open_directory()?;
        directory.release_write_lock();
        directory.delete_metadata()?;
        self.directory = None;

        self.move_aside(BundlePath::BundlesDir, &backup.prefix)?;
        self.move_aside(BundlePath::HeadsDir, &backup.prefix)?;

        if let Some(mut nested) = self.nested_migrator()
            && bundle_mode(&nested.dir, nested.kind)?.is_some()
        {
            let result = nested.unbundle();
            self.nested = Some(Box::new(nested));
            result?;
        }
        info!(dir = %self.dir.display(), "Unbundled directory");
        Ok(())
    }

    fn dispose(&mut self) {
        if let Some(mut nested) = self.nested.take() {
            nested.dispose();
        }
        if let Some(mut directory) = self.directory.take() {
            directory.dispose();
        }

        let pending = std::mem::take(&mut self.undeleted);
        for path in pending {
            match io::remove_file_if_exists(&path) {
                Ok(()) => debug!(path = %path.display(), "Deleted legacy file on retry"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Legacy file could not be deleted");
                    self.undeleted.push(path);
                }
            }
        }

        if let Some(lock) = self.write_lock.take() {
            lock.release();
        }
    }
}

impl Drop for LocalMigrator {
    fn drop(&mut self) {
        self.dispose();
    }
}
