//! Atomic I/O operations with file locking

use std::fs::{self, File, OpenOptions};
use std::io::{self as stdio, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use fs2::FileExt;

use crate::{Error, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a temp path in the same directory as `path` (same filesystem,
/// so the final rename is atomic).
fn temp_path_for(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}-{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default(),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    path.with_file_name(temp_name)
}

/// Write content atomically to a file.
///
/// Uses write-to-temp-then-rename so a reader never observes a partially
/// written file under the final name.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    write_atomic_from(path, &mut stdio::Cursor::new(content), None)
}

/// Stream `reader` into `path` atomically, optionally stamping the
/// modification time before the file becomes visible.
pub fn write_atomic_from(
    path: &Path,
    reader: &mut dyn Read,
    modified: Option<SystemTime>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::io(&temp_path, e))?;

        stdio::copy(reader, &mut temp_file).map_err(|e| Error::io(&temp_path, e))?;
        temp_file.flush().map_err(|e| Error::io(&temp_path, e))?;
        if let Some(modified) = modified {
            temp_file
                .set_modified(modified)
                .map_err(|e| Error::io(&temp_path, e))?;
        }
        temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
        drop(temp_file);

        fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Read text content from a file.
pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

/// Write text content to a file atomically.
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    write_atomic(path, content.as_bytes())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == stdio::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Create `base/name` if needed and return its path.
pub fn ensure_subdir(base: &Path, name: &str) -> Result<PathBuf> {
    let dir = base.join(name);
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    Ok(dir)
}

/// Clear or set the read-only flag on a file.
pub fn set_readonly(path: &Path, readonly: bool) -> Result<()> {
    let mut perms = fs::metadata(path)
        .map_err(|e| Error::io(path, e))?
        .permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(readonly);
    fs::set_permissions(path, perms).map_err(|e| Error::io(path, e))
}

/// An exclusive advisory lock held on a sidecar lock file.
///
/// Data files are replaced by rename, which swaps the inode, so locks are
/// taken on a separate file that is never renamed. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is acquired.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive().map_err(|_| Error::LockFailed {
            path: path.to_path_buf(),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Acquire the exclusive lock on `path` without blocking.
    ///
    /// Returns `Ok(None)` if another handle already holds it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(_) => Err(Error::LockFailed {
                path: path.to_path_buf(),
            }),
        }
    }

    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the lock file's content, e.g. with the owner's name.
    pub fn write_content(&mut self, content: &str) -> Result<()> {
        use std::io::Seek;
        self.file.set_len(0).map_err(|e| Error::io(&self.path, e))?;
        self.file
            .seek(stdio::SeekFrom::Start(0))
            .map_err(|e| Error::io(&self.path, e))?;
        self.file
            .write_all(content.as_bytes())
            .map_err(|e| Error::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| Error::io(&self.path, e))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
