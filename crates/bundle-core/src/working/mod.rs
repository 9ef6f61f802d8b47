//! The live working copy of a bundled dataset.
//!
//! A [`WorkingDirectory`] moves through three states:
//!
//! ```text
//! Uninitialized --prepare--> Prepared --acquire_write_lock--> Locked
//!                                ^                              |
//!                                +------release_write_lock------+
//! ```
//!
//! Callers must hold the write lock before writing files into the working
//! directory. While the lock is held, a background worker may publish
//! changes periodically.

mod lock;
mod worker;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bundle_fs::{BundlePath, FileResourceCollection, ReadableResourceCollection};
use tracing::{debug, info, warn};

pub use lock::{LockMessage, LockMessageHandler, LoggingLockHandler, WriteLock};

use crate::backup::{Backup, BackupManager};
use crate::bundle::{BundleId, BundleStore};
use crate::device::DeviceId;
use crate::device_lock::DeviceLockManager;
use crate::heads::{HeadRefs, HeadRefsMerger, HeadRefsPegFiles, HeadRefsPropertiesFile};
use crate::settings::{RetryPolicy, SyncSettings};
use crate::strategy::DirKind;
use crate::sync::{SyncClient, run_until_settled};
use crate::{Error, Result};
use worker::{FlushJob, FlushSchedule, FlushWorker, lock_client, publish_changes, save_auxiliary_state};

/// Qualifier of the peg files holding per-file data bundle heads.
const PEG_QUALIFIER: &str = "pdash";

/// The published head refs of `target_dir`.
///
/// Kinds with per-file data bundles keep those heads in peg files; every
/// other ref lives in `heads/heads.txt`.
pub fn published_head_refs(target_dir: &Path, kind: DirKind) -> Result<Box<dyn HeadRefs>> {
    let heads_dir = target_dir.join(BundlePath::HeadsDir);
    let shared_heads = HeadRefsPropertiesFile::new(heads_dir.join(BundlePath::HeadsFile));
    if kind.uses_peg_refs() {
        Ok(Box::new(
            HeadRefsMerger::new()
                .add_patterned_refs(
                    DirKind::peg_ref_pattern()?,
                    HeadRefsPegFiles::new(heads_dir, PEG_QUALIFIER),
                )
                .add_default_refs(shared_heads),
        ))
    } else {
        Ok(Box::new(shared_heads))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Uninitialized,
    Prepared,
    Locked,
}

pub struct WorkingDirectory {
    kind: DirKind,
    target_dir: PathBuf,
    working_dir: PathBuf,
    settings: SyncSettings,
    device_id: DeviceId,
    enforce_locks: bool,
    background_flush: bool,
    state: DirectoryState,
    collection: Arc<FileResourceCollection>,
    client: Option<Arc<Mutex<SyncClient>>>,
    write_lock: Option<WriteLock>,
    worker: Option<FlushWorker>,
    device_locks: Option<Arc<DeviceLockManager>>,
}

impl std::fmt::Debug for WorkingDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingDirectory")
            .field("kind", &self.kind)
            .field("target_dir", &self.target_dir)
            .field("working_dir", &self.working_dir)
            .field("state", &self.state)
            .field("enforce_locks", &self.enforce_locks)
            .field("background_flush", &self.background_flush)
            .finish_non_exhaustive()
    }
}

impl WorkingDirectory {
    /// A working copy in `working_dir` of the bundles under `target_dir`.
    pub fn new(
        target_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        kind: DirKind,
        settings: SyncSettings,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        let device_id = DeviceId::resolve(settings.device_id.as_deref())?;
        let collection = Arc::new(FileResourceCollection::new(
            &working_dir,
            kind.name_filter(),
            settings.cache_staleness(),
        ));
        let background_flush = settings
            .background_flush
            .unwrap_or_else(|| kind.background_flush_default());

        Ok(Self {
            kind,
            target_dir: target_dir.into(),
            working_dir,
            settings,
            device_id,
            enforce_locks: true,
            background_flush,
            state: DirectoryState::Uninitialized,
            collection,
            client: None,
            write_lock: None,
            worker: None,
            device_locks: None,
        })
    }

    /// Bundles stored next to the flat files they were made from.
    pub fn in_place(dir: impl Into<PathBuf>, kind: DirKind, settings: SyncSettings) -> Result<Self> {
        let dir = dir.into();
        Self::new(dir.clone(), dir, kind, settings)
    }

    pub fn kind(&self) -> DirKind {
        self.kind
    }

    pub fn state(&self) -> DirectoryState {
        self.state
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn collection(&self) -> &FileResourceCollection {
        &self.collection
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.target_dir.join(BundlePath::BundlesDir)
    }

    pub fn heads_dir(&self) -> PathBuf {
        self.target_dir.join(BundlePath::HeadsDir)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.working_dir.join(BundlePath::MetadataDir)
    }

    fn cache_path(&self) -> PathBuf {
        self.metadata_dir().join(BundlePath::FileDataCache)
    }

    pub fn set_enforce_locks(&mut self, enforce: bool) {
        self.enforce_locks = enforce;
    }

    pub fn enforce_locks(&self) -> bool {
        self.enforce_locks
    }

    pub fn set_enable_background_flush(&mut self, enabled: bool) {
        self.background_flush = enabled;
    }

    /// Record this device's lock file whenever the write lock is taken.
    pub fn set_device_lock_manager(&mut self, manager: Arc<DeviceLockManager>) {
        self.device_locks = Some(manager);
    }

    /// Load caches, repair corruption and bring the working files up to the
    /// published heads.
    pub fn prepare(&mut self) -> Result<()> {
        fs::create_dir_all(&self.working_dir).map_err(|e| Error::io(&self.working_dir, e))?;
        self.collection.validate()?;
        fs::create_dir_all(self.metadata_dir()).map_err(|e| Error::io(self.metadata_dir(), e))?;

        if self.client.is_none() {
            self.collection.load_file_data_cache(&self.cache_path())?;
            let client = self.build_client()?;
            self.client = Some(Arc::new(Mutex::new(client)));
            debug!(dir = %self.working_dir.display(), kind = ?self.kind, "Created sync client");
        }

        self.repair_corrupt_files();
        self.repair_damaged_bundles();
        self.update()?;

        if self.state == DirectoryState::Uninitialized {
            self.state = DirectoryState::Prepared;
        }
        info!(dir = %self.working_dir.display(), "Prepared working directory");
        Ok(())
    }

    fn build_client(&self) -> Result<SyncClient> {
        let store = BundleStore::open(self.bundles_dir(), self.device_id.clone())?;
        let working_heads =
            HeadRefsPropertiesFile::new(self.metadata_dir().join(BundlePath::HeadsFile));

        Ok(SyncClient::new(
            self.kind,
            Arc::clone(&self.collection),
            Box::new(working_heads),
            store,
            published_head_refs(&self.target_dir, self.kind)?,
        ))
    }

    fn client(&self) -> Result<&Arc<Mutex<SyncClient>>> {
        self.client.as_ref().ok_or_else(|| Error::NotPrepared {
            path: self.working_dir.clone(),
        })
    }

    /// Restore truncated working files from their last bundle. Failures are
    /// logged; the files stay as they are.
    fn repair_corrupt_files(&self) {
        let corrupt: Vec<String> = match self.collection.list_resource_names() {
            Ok(names) => names
                .into_iter()
                .filter(|n| self.kind.is_possibly_corrupt(&self.working_dir.join(n)))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not scan for corrupt files");
                return;
            }
        };
        if corrupt.is_empty() {
            return;
        }

        warn!(files = ?corrupt, "Restoring possibly corrupt files");
        let result = self
            .client()
            .and_then(|c| lock_client(c, &self.working_dir))
            .and_then(|mut client| client.restore_files(&corrupt));
        if let Err(e) = result {
            warn!(error = %e, "Could not restore corrupt files");
        }
    }

    fn repair_damaged_bundles(&self) {
        let result = self
            .client()
            .and_then(|c| lock_client(c, &self.working_dir))
            .and_then(|mut client| client.repair_damaged_bundles());
        match result {
            Ok(repaired) if !repaired.is_empty() => {
                info!(count = repaired.len(), "Republished damaged bundles");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not repair damaged bundles"),
        }
    }

    /// Pull newer bundles into the working directory.
    pub fn update(&self) -> Result<()> {
        let mut client = lock_client(self.client()?, &self.working_dir)?;
        client.collection().recheck_all_file_timestamps();
        run_until_settled(&self.settings.sync_retry, "sync down", || client.sync_down())
    }

    fn lock_retry(&self) -> &RetryPolicy {
        if self.kind.is_contention_prone() {
            &self.settings.shared_lock_retry
        } else {
            &self.settings.lock_retry
        }
    }

    /// Take the write lock for `owner`, then start background flushing if it
    /// is enabled.
    pub fn acquire_write_lock(
        &mut self,
        handler: Arc<dyn LockMessageHandler>,
        owner: &str,
    ) -> Result<()> {
        if self.state == DirectoryState::Uninitialized {
            return Err(Error::NotPrepared {
                path: self.working_dir.clone(),
            });
        }
        if self.state == DirectoryState::Locked {
            return Err(Error::AlreadyLocked {
                path: self.target_dir.join(BundlePath::WriteLock),
                owner: self
                    .write_lock
                    .as_ref()
                    .map_or_else(String::new, |l| l.owner().to_string()),
            });
        }

        if self.enforce_locks {
            let target = self.target_dir.clone();
            let lock = self
                .lock_retry()
                .run(Error::is_lock_failure, || WriteLock::acquire(&target, owner))?;

            if let Some(device_locks) = &self.device_locks
                && let Err(e) = device_locks.write_lock_file(owner)
            {
                warn!(error = %e, "Could not write device lock");
            }

            if self.background_flush {
                let job = FlushJob {
                    client: Arc::clone(self.client()?),
                    cache_path: self.cache_path(),
                    lock_path: lock.path().to_path_buf(),
                    owner: owner.to_string(),
                    handler,
                };
                self.worker = Some(FlushWorker::start(job, FlushSchedule::from_settings(&self.settings))?);
            }
            self.write_lock = Some(lock);
        }

        self.state = DirectoryState::Locked;
        Ok(())
    }

    /// Fail unless the write lock is held and still valid.
    pub fn assert_write_lock(&self) -> Result<()> {
        if !self.enforce_locks {
            return Ok(());
        }
        match &self.write_lock {
            Some(lock) => lock.verify(),
            None => Err(Error::NotLocked {
                path: self.target_dir.join(BundlePath::WriteLock),
            }),
        }
    }

    /// Publish every local change.
    ///
    /// Returns `false` if the changes could not be published within the
    /// retry bound; a later flush may still succeed. Excluded files are
    /// best effort and never turn a published flush into a failure.
    pub fn flush_data(&self) -> Result<bool> {
        self.assert_write_lock()?;
        let mut client = lock_client(self.client()?, &self.working_dir)?;
        let retry = self.settings.sync_retry;

        match publish_changes(&mut client, &retry) {
            Ok(()) => {}
            Err(e @ Error::SyncFailed { .. }) => {
                warn!(error = %e, "Changes not published yet");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        if let Some(worker) = &self.worker {
            worker.reset_countdown();
        }

        save_auxiliary_state(&mut client, &retry, &self.cache_path())?;
        Ok(true)
    }

    /// Stop background flushing, then release the write lock.
    pub fn release_write_lock(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        if let Some(lock) = self.write_lock.take() {
            lock.release();
        }
        if let Some(device_locks) = &self.device_locks
            && let Err(e) = device_locks.delete_lock_file()
        {
            warn!(error = %e, "Could not remove device lock");
        }
        if self.state == DirectoryState::Locked {
            self.state = DirectoryState::Prepared;
        }
    }

    /// Re-extract `filenames` from the last synced bundles.
    pub fn restore_files(&self, filenames: &[String]) -> Result<()> {
        let mut client = lock_client(self.client()?, &self.working_dir)?;
        client.restore_files(filenames)
    }

    /// Published heads of the target directory.
    pub fn published_heads(&self) -> Result<BTreeMap<String, BundleId>> {
        let client = lock_client(self.client()?, &self.working_dir)?;
        client.bundle_heads().heads()
    }

    /// Heads this working copy was last synced with.
    pub fn working_heads(&self) -> Result<BTreeMap<String, BundleId>> {
        let client = lock_client(self.client()?, &self.working_dir)?;
        client.working_heads().heads()
    }

    /// Zip the dataset files into `backup/`.
    pub fn do_backup(&self, qualifier: &str) -> Result<Backup> {
        BackupManager::new(&self.working_dir, self.kind.name_filter()).create_backup(qualifier)
    }

    /// Delete the private metadata directory. The next `prepare` rebuilds it.
    pub fn delete_metadata(&mut self) -> Result<()> {
        self.client = None;
        let metadata = self.metadata_dir();
        match fs::remove_dir_all(&metadata) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(metadata, e)),
        }
    }

    /// Release everything this directory holds.
    pub fn dispose(&mut self) {
        self.release_write_lock();
        self.client = None;
        self.state = DirectoryState::Uninitialized;
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        self.release_write_lock();
    }
}
