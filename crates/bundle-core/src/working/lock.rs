//! The per-directory write lock.

use std::fs;
use std::path::{Path, PathBuf};

use bundle_fs::{BundlePath, FileLock};
use tracing::{debug, info};

use crate::{Error, Result};

/// Something the lock holder wants to hear about while it holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockMessage {
    /// The lock file vanished or now names another owner.
    LockInvalid { path: PathBuf, reason: String },
    /// A background flush failed for a reason a retry will not fix.
    FlushFailed { message: String },
}

/// Receives [`LockMessage`]s from the background worker.
pub trait LockMessageHandler: Send + Sync {
    fn handle_message(&self, message: LockMessage);
}

impl<F> LockMessageHandler for F
where
    F: Fn(LockMessage) + Send + Sync,
{
    fn handle_message(&self, message: LockMessage) {
        self(message)
    }
}

/// Logs messages and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLockHandler;

impl LockMessageHandler for LoggingLockHandler {
    fn handle_message(&self, message: LockMessage) {
        tracing::warn!(?message, "Write lock message");
    }
}

/// Exclusive write access to a target directory.
///
/// Held through an advisory lock on `<dir>/write.lock`, whose content names
/// the owner. Released on drop.
#[derive(Debug)]
pub struct WriteLock {
    lock: FileLock,
    owner: String,
}

impl WriteLock {
    /// Take the lock without waiting.
    ///
    /// Fails with [`Error::AlreadyLocked`] if any handle, in this process or
    /// another, holds it.
    pub fn acquire(dir: &Path, owner: &str) -> Result<Self> {
        let path = dir.join(BundlePath::WriteLock);
        match FileLock::try_exclusive(&path)? {
            Some(mut lock) => {
                lock.write_content(owner)?;
                info!(path = %path.display(), owner, "Acquired write lock");
                Ok(Self {
                    lock,
                    owner: owner.to_string(),
                })
            }
            None => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(Error::AlreadyLocked {
                    path,
                    owner: holder.trim().to_string(),
                })
            }
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    /// Confirm the lock file still exists and still names this owner.
    pub fn verify(&self) -> Result<()> {
        check_lock_file(self.path(), &self.owner)
    }

    pub fn release(self) {
        debug!(path = %self.path().display(), "Released write lock");
    }
}

/// Check the lock file at `path` names `owner`.
pub(crate) fn check_lock_file(path: &Path, owner: &str) -> Result<()> {
    let content = fs::read_to_string(path).map_err(|e| Error::LockFailed {
        path: path.to_path_buf(),
        reason: format!("lock file unreadable: {e}"),
    })?;
    if content.trim() == owner {
        Ok(())
    } else {
        Err(Error::LockFailed {
            path: path.to_path_buf(),
            reason: format!("lock file names '{}'", content.trim()),
        })
    }
}
