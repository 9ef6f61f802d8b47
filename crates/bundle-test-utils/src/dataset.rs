//! [`TestDataset`] builder for dataset directory scenarios.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// A temporary directory holding one or more dataset directories, with
/// helpers for writing files and asserting on their content.
///
/// # Example
///
/// ```rust,no_run
/// use bundle_test_utils::TestDataset;
///
/// let data = TestDataset::new();
/// data.write("work", "a.txt", "1");
/// data.assert_content("work", "a.txt", "1");
/// ```
pub struct TestDataset {
    temp_dir: TempDir,
}

impl Default for TestDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDataset {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of subdirectory `dir`, created if missing. `""` is the root.
    pub fn dir(&self, dir: &str) -> PathBuf {
        let path = if dir.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(dir)
        };
        fs::create_dir_all(&path).unwrap();
        path
    }

    /// Write `content` to `dir/name`.
    pub fn write(&self, dir: &str, name: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir(dir).join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Write a file and set its modification time to `secs` after the epoch.
    pub fn write_with_mtime(&self, dir: &str, name: &str, content: &str, secs: u64) -> PathBuf {
        let path = self.write(dir, name, content);
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
        path
    }

    pub fn read(&self, dir: &str, name: &str) -> String {
        let path = self.root().join(dir).join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|_| panic!("Could not read file: {}", path.display()))
    }

    pub fn remove(&self, dir: &str, name: &str) {
        fs::remove_file(self.root().join(dir).join(name)).unwrap();
    }

    /// Truncate a file to zero bytes, as a crash mid-write would.
    pub fn truncate(&self, dir: &str, name: &str) {
        fs::write(self.root().join(dir).join(name), b"").unwrap();
    }

    /// Top-level files of `dir` and their content, skipping hidden names.
    pub fn snapshot(&self, dir: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        for entry in fs::read_dir(self.root().join(dir)).unwrap() {
            let entry = entry.unwrap();
            if !entry.file_type().unwrap().is_file() {
                continue;
            }
            let name = entry.file_name().into_string().unwrap();
            if name.starts_with('.') {
                continue;
            }
            let content = String::from_utf8_lossy(&fs::read(entry.path()).unwrap()).into_owned();
            files.insert(name, content);
        }
        files
    }

    /// # Panics
    /// Panics if `dir/name` does not exist.
    pub fn assert_exists(&self, dir: &str, name: &str) {
        let path = self.root().join(dir).join(name);
        assert!(path.exists(), "Expected file to exist: {}", path.display());
    }

    /// # Panics
    /// Panics if `dir/name` exists.
    pub fn assert_missing(&self, dir: &str, name: &str) {
        let path = self.root().join(dir).join(name);
        assert!(!path.exists(), "Expected file NOT to exist: {}", path.display());
    }

    /// # Panics
    /// Panics if the file cannot be read or its content differs.
    pub fn assert_content(&self, dir: &str, name: &str, expected: &str) {
        let actual = self.read(dir, name);
        assert_eq!(
            actual,
            expected,
            "Unexpected content in {}",
            self.root().join(dir).join(name).display()
        );
    }
}
