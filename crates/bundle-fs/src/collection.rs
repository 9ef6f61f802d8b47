//! Resource collections: a flat directory of opaque files observed through
//! modification times and checksums.
//!
//! [`FileResourceCollection`] keeps a cache of `(mtime, size, checksum)` per
//! file so unchanged files are never rehashed. Cached timestamps are trusted
//! for a short staleness window; callers that cannot afford stale data (a
//! flush, a sync down) call [`FileResourceCollection::recheck_all_file_timestamps`]
//! first. The cache can be persisted to `metadata/fileDataCache.xml`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::name::normalize_resource_name;
use crate::{Error, Result, checksum, io};

/// Predicate deciding which file names belong to a collection.
pub type NameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Read access to a set of named byte blobs.
pub trait ReadableResourceCollection: Send + Sync {
    /// Names of every resource currently in the collection.
    fn list_resource_names(&self) -> Result<Vec<String>>;

    /// Modification time in epoch milliseconds, or `None` if the resource
    /// is missing or unreadable.
    fn last_modified(&self, name: &str) -> Option<i64>;

    /// Content checksum, or `None` if the resource is missing or unreadable.
    fn checksum(&self, name: &str) -> Option<String>;

    /// Open a resource for reading.
    fn open_resource(&self, name: &str) -> Result<Box<dyn Read + Send>>;
}

/// A collection that can also be written to.
pub trait ResourceCollection: ReadableResourceCollection {
    /// Replace `name` with the content of `reader`, stamped with `modified`.
    fn write_resource(&self, name: &str, modified: i64, reader: &mut dyn Read) -> Result<()>;

    /// Delete `name`; deleting a missing resource is not an error.
    fn delete_resource(&self, name: &str) -> Result<()>;
}

/// Convert a filesystem timestamp to epoch milliseconds.
pub fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Convert epoch milliseconds to a filesystem timestamp.
pub fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

#[derive(Debug, Clone)]
struct FileState {
    modified: i64,
    size: u64,
    checksum: Option<String>,
    checked: Option<Instant>,
}

/// One entry of the persisted file data cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFileData {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@modified")]
    pub modified: i64,
    #[serde(rename = "@size")]
    pub size: u64,
    #[serde(rename = "@checksum")]
    pub checksum: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "fileDataCache")]
struct CacheDocument {
    #[serde(rename = "file", default)]
    files: Vec<CachedFileData>,
}

/// A [`ResourceCollection`] backed by the top level of a directory.
pub struct FileResourceCollection {
    dir: PathBuf,
    filter: NameFilter,
    staleness: Duration,
    state: Mutex<HashMap<String, FileState>>,
}

impl std::fmt::Debug for FileResourceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResourceCollection")
            .field("dir", &self.dir)
            .field("staleness", &self.staleness)
            .finish_non_exhaustive()
    }
}

impl FileResourceCollection {
    pub fn new(dir: impl Into<PathBuf>, filter: NameFilter, staleness: Duration) -> Self {
        Self {
            dir: dir.into(),
            filter,
            staleness,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the collection.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// True if `name` belongs to this collection.
    pub fn accepts(&self, name: &str) -> bool {
        (self.filter)(name)
    }

    /// Ensure the backing directory exists.
    pub fn validate(&self) -> Result<()> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(Error::MissingCollection {
                path: self.dir.clone(),
            })
        }
    }

    /// Forget when each file was last checked, so the next query stats it.
    pub fn recheck_all_file_timestamps(&self) {
        for entry in self.lock_state().values_mut() {
            entry.checked = None;
        }
    }

    /// Merge a previously saved cache into memory.
    ///
    /// A missing cache is fine. An unreadable one is discarded with a
    /// warning, since it only costs a rehash.
    pub fn load_file_data_cache(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = io::read_text(path)?;
        let document: CacheDocument = match quick_xml::de::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable file data cache");
                return Ok(());
            }
        };

        let mut state = self.lock_state();
        for file in document.files {
            state.insert(
                file.name,
                FileState {
                    modified: file.modified,
                    size: file.size,
                    checksum: Some(file.checksum),
                    checked: None,
                },
            );
        }
        debug!(path = %path.display(), entries = state.len(), "Loaded file data cache");
        Ok(())
    }

    /// Persist every cached checksum.
    pub fn save_file_data_cache(&self, path: &Path) -> Result<()> {
        let mut files: Vec<CachedFileData> = self
            .lock_state()
            .iter()
            .filter_map(|(name, s)| {
                s.checksum.as_ref().map(|checksum| CachedFileData {
                    name: name.clone(),
                    modified: s.modified,
                    size: s.size,
                    checksum: checksum.clone(),
                })
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let xml = quick_xml::se::to_string(&CacheDocument { files }).map_err(|e| {
            Error::CacheParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        io::write_atomic(path, xml.as_bytes())
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, FileState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stat `name` unless its cached state is still fresh.
    fn current_state(&self, name: &str, force: bool) -> Option<FileState> {
        let mut state = self.lock_state();
        if !force
            && let Some(s) = state.get(name)
            && s.checked.is_some_and(|t| t.elapsed() < self.staleness)
        {
            return Some(s.clone());
        }

        let metadata = match fs::metadata(self.dir.join(name)) {
            Ok(m) if m.is_file() => m,
            _ => {
                state.remove(name);
                return None;
            }
        };
        let modified = metadata.modified().map(system_time_to_millis).ok()?;
        let size = metadata.len();

        let entry = state.entry(name.to_string()).or_insert(FileState {
            modified,
            size,
            checksum: None,
            checked: None,
        });
        if entry.modified != modified || entry.size != size {
            entry.modified = modified;
            entry.size = size;
            entry.checksum = None;
        }
        entry.checked = Some(Instant::now());
        Some(entry.clone())
    }
}

impl ReadableResourceCollection for FileResourceCollection {
    fn list_resource_names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string()
                && self.accepts(&name)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn last_modified(&self, name: &str) -> Option<i64> {
        self.current_state(name, false).map(|s| s.modified)
    }

    fn checksum(&self, name: &str) -> Option<String> {
        let current = self.current_state(name, false)?;
        if let Some(checksum) = current.checksum {
            return Some(checksum);
        }

        let computed = match checksum::compute_file_checksum(&self.dir.join(name)) {
            Ok(c) => c,
            Err(e) => {
                debug!(name, error = %e, "Could not checksum resource");
                return None;
            }
        };
        if let Some(entry) = self.lock_state().get_mut(name)
            && entry.modified == current.modified
            && entry.size == current.size
        {
            entry.checksum = Some(computed.clone());
        }
        Some(computed)
    }

    fn open_resource(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.dir.join(normalize_resource_name(name)?);
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

impl ResourceCollection for FileResourceCollection {
    fn write_resource(&self, name: &str, modified: i64, reader: &mut dyn Read) -> Result<()> {
        let path = self.dir.join(normalize_resource_name(name)?);
        io::write_atomic_from(&path, reader, Some(millis_to_system_time(modified)))?;
        self.lock_state().remove(name);
        Ok(())
    }

    fn delete_resource(&self, name: &str) -> Result<()> {
        let path = self.dir.join(normalize_resource_name(name)?);
        io::remove_file_if_exists(&path)?;
        self.lock_state().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn accept_all() -> NameFilter {
        Arc::new(|name: &str| !name.starts_with('.'))
    }

    #[test]
    fn lists_only_accepted_regular_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let collection = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);
        assert_eq!(collection.list_resource_names().unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn write_resource_sets_modification_time() {
        let dir = tempdir().unwrap();
        let collection = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);

        collection
            .write_resource("x.dat", 1_500_000_000_123, &mut &b"payload"[..])
            .unwrap();

        assert_eq!(collection.last_modified("x.dat"), Some(1_500_000_000_123));
        assert_eq!(
            collection.checksum("x.dat").unwrap(),
            checksum::compute_bytes_checksum(b"payload")
        );
    }

    #[test]
    fn missing_resource_has_no_data() {
        let dir = tempdir().unwrap();
        let collection = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);
        assert_eq!(collection.last_modified("nope"), None);
        assert_eq!(collection.checksum("nope"), None);
    }

    #[test]
    fn stale_cache_hides_changes_until_recheck() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "one").unwrap();
        let collection =
            FileResourceCollection::new(dir.path(), accept_all(), Duration::from_secs(3600));
        let first = collection.checksum("f.txt").unwrap();

        fs::write(&path, "two, longer").unwrap();
        assert_eq!(collection.checksum("f.txt").unwrap(), first);

        collection.recheck_all_file_timestamps();
        assert_eq!(
            collection.checksum("f.txt").unwrap(),
            checksum::compute_bytes_checksum(b"two, longer")
        );
    }

    #[test]
    fn file_data_cache_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "content").unwrap();
        let cache_path = dir.path().join("meta").join("fileDataCache.xml");

        let collection = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);
        let expected = collection.checksum("f.txt").unwrap();
        collection.save_file_data_cache(&cache_path).unwrap();

        let reloaded = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);
        reloaded.load_file_data_cache(&cache_path).unwrap();
        assert_eq!(reloaded.checksum("f.txt").unwrap(), expected);
    }

    #[test]
    fn corrupt_file_data_cache_is_ignored() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("fileDataCache.xml");
        fs::write(&cache_path, "<fileDataCache><file name=").unwrap();

        let collection = FileResourceCollection::new(dir.path(), accept_all(), Duration::ZERO);
        collection.load_file_data_cache(&cache_path).unwrap();
    }

    #[test]
    fn millis_conversion_round_trips() {
        for millis in [0, 1, 1_700_000_000_999, -5_000] {
            assert_eq!(system_time_to_millis(millis_to_system_time(millis)), millis);
        }
    }
}
