//! Per-device lock files that warn about concurrent use from other machines.
//!
//! Each device that opens a target directory writes
//! `locks/device-lock-<device>.xml`:
//!
//! ```xml
//! <device-lock owner="Jane" username="jane" host="laptop" opened="2024-03-01T09:30:00Z"/>
//! ```
//!
//! These are advisory. The write lock is what protects the data; device
//! locks only tell a user that someone else may be working elsewhere.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bundle_fs::{BundlePath, io};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::{Error, Result};

const LOCK_PREFIX: &str = "device-lock-";
const LOCK_SUFFIX: &str = ".xml";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "device-lock")]
struct LockDocument {
    #[serde(rename = "@owner")]
    owner: String,
    #[serde(rename = "@username")]
    username: String,
    #[serde(rename = "@host")]
    host: String,
    #[serde(rename = "@opened")]
    opened: String,
}

/// A lock file written by some device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLock {
    pub device_id: String,
    pub owner: String,
    pub username: String,
    pub host: String,
    pub opened: DateTime<Utc>,
    pub path: PathBuf,
}

/// Reads and writes device lock files for one target directory.
///
/// This device's own lock file is removed when the manager is dropped.
#[derive(Debug)]
pub struct DeviceLockManager {
    locks_dir: PathBuf,
    device_id: DeviceId,
    freshness: Duration,
    written: AtomicBool,
}

impl DeviceLockManager {
    pub fn new(target_dir: &Path, device_id: DeviceId, freshness: Duration) -> Self {
        Self {
            locks_dir: target_dir.join(BundlePath::LocksDir),
            device_id,
            freshness,
            written: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Path of this device's lock file.
    pub fn lock_file_path(&self) -> PathBuf {
        self.locks_dir
            .join(format!("{LOCK_PREFIX}{}{LOCK_SUFFIX}", self.device_id))
    }

    /// Record that `owner` opened the directory on this device just now.
    pub fn write_lock_file(&self, owner: &str) -> Result<()> {
        let path = self.lock_file_path();
        let document = LockDocument {
            owner: owner.to_string(),
            username: whoami::username(),
            host: whoami::devicename(),
            opened: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let xml = quick_xml::se::to_string(&document).map_err(|e| Error::Xml {
            path: path.clone(),
            message: e.to_string(),
        })?;

        fs::create_dir_all(&self.locks_dir).map_err(|e| Error::io(&self.locks_dir, e))?;
        io::write_atomic(&path, xml.as_bytes())?;
        self.written.store(true, Ordering::SeqCst);
        debug!(path = %path.display(), owner, "Wrote device lock");
        Ok(())
    }

    /// Remove this device's lock file.
    pub fn delete_lock_file(&self) -> Result<()> {
        io::remove_file_if_exists(&self.lock_file_path())?;
        self.written.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Recent lock files of other devices, newest first.
    ///
    /// Unparsable files are skipped; they may be half-written by a
    /// concurrent writer.
    pub fn conflicting_locks(&self) -> Result<Vec<DeviceLock>> {
        if !self.locks_dir.is_dir() {
            return Ok(Vec::new());
        }
        let cutoff = chrono::Duration::from_std(self.freshness)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));

        let mut locks = Vec::new();
        let entries = fs::read_dir(&self.locks_dir).map_err(|e| Error::io(&self.locks_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&self.locks_dir, e))?.path();
            let Some(device) = lock_file_device(&path) else {
                continue;
            };
            if device == self.device_id.as_str() {
                continue;
            }
            match read_lock_file(&path, device) {
                Ok(lock) if cutoff.is_none_or(|c| lock.opened >= c) => locks.push(lock),
                Ok(lock) => debug!(path = %path.display(), opened = %lock.opened, "Ignoring stale device lock"),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable device lock"),
            }
        }
        locks.sort_by(|a, b| b.opened.cmp(&a.opened));
        Ok(locks)
    }

    /// Delete another device's lock after the user dismissed the warning.
    pub fn ignore(&self, lock: &DeviceLock) -> Result<()> {
        warn!(device = %lock.device_id, owner = %lock.owner, "Ignoring device lock");
        io::remove_file_if_exists(&lock.path)?;
        Ok(())
    }
}

impl Drop for DeviceLockManager {
    fn drop(&mut self) {
        if self.written.load(Ordering::SeqCst)
            && let Err(e) = io::remove_file_if_exists(&self.lock_file_path())
        {
            warn!(error = %e, "Could not remove device lock");
        }
    }
}

fn lock_file_device(path: &Path) -> Option<&str> {
    path.file_name()?
        .to_str()?
        .strip_prefix(LOCK_PREFIX)?
        .strip_suffix(LOCK_SUFFIX)
}

fn read_lock_file(path: &Path, device: &str) -> Result<DeviceLock> {
    let content = io::read_text(path)?;
    let document: LockDocument = quick_xml::de::from_str(&content).map_err(|e| Error::Xml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let opened = DateTime::parse_from_rfc3339(&document.opened)
        .map_err(|e| Error::DeviceLock {
            path: path.to_path_buf(),
            message: format!("bad opened timestamp: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(DeviceLock {
        device_id: device.to_string(),
        owner: document.owner,
        username: document.username,
        host: document.host,
        opened,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path, id: &str) -> DeviceLockManager {
        DeviceLockManager::new(dir, DeviceId::new(id).unwrap(), Duration::from_secs(3600))
    }

    #[test]
    fn own_lock_is_not_a_conflict() {
        let dir = tempdir().unwrap();
        let mine = manager(dir.path(), "laptop");
        mine.write_lock_file("Jane").unwrap();
        assert!(mine.conflicting_locks().unwrap().is_empty());
    }

    #[test]
    fn other_device_lock_is_reported() {
        let dir = tempdir().unwrap();
        let other = manager(dir.path(), "desktop");
        other.write_lock_file("Joe").unwrap();
        let mine = manager(dir.path(), "laptop");

        let locks = mine.conflicting_locks().unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].device_id, "desktop");
        assert_eq!(locks[0].owner, "Joe");
    }

    #[test]
    fn lock_file_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = {
            let mine = manager(dir.path(), "laptop");
            mine.write_lock_file("Jane").unwrap();
            mine.lock_file_path()
        };
        assert!(!path.exists());
    }

    #[test]
    fn garbage_lock_files_are_skipped() {
        let dir = tempdir().unwrap();
        let locks = dir.path().join("locks");
        fs::create_dir_all(&locks).unwrap();
        fs::write(locks.join("device-lock-broken.xml"), "<device-lock owner=").unwrap();

        let mine = manager(dir.path(), "laptop");
        assert!(mine.conflicting_locks().unwrap().is_empty());
    }
}
