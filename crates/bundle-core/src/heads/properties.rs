use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bundle_fs::{FileLock, io};
use tracing::debug;

use super::{HeadRefs, parse_ref_lines};
use crate::bundle::{BundleId, validate_bundle_name};
use crate::Result;

/// All refs of one namespace in a single `name=token` file.
///
/// The file itself is replaced atomically on every write; writers across
/// processes are serialized by an exclusive lock on `<file>.lock`.
#[derive(Debug, Clone)]
pub struct HeadRefsPropertiesFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl HeadRefsPropertiesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, BundleId>> {
        match io::read_text(&self.path) {
            Ok(content) => Ok(parse_ref_lines(&content, &self.path)),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, refs: &BTreeMap<String, BundleId>) -> Result<()> {
        let mut content = String::from("# head refs\n");
        for (name, id) in refs {
            content.push_str(name);
            content.push('=');
            content.push_str(&id.token());
            content.push('\n');
        }
        io::write_text(&self.path, &content)?;
        Ok(())
    }

    fn update(
        &self,
        name: &str,
        check: impl FnOnce(Option<&BundleId>) -> bool,
        id: &BundleId,
    ) -> Result<bool> {
        validate_bundle_name(name)?;
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut refs = self.read_all()?;
        if !check(refs.get(name)) {
            return Ok(false);
        }
        refs.insert(name.to_string(), id.clone());
        self.write_all(&refs)?;
        debug!(path = %self.path.display(), name, head = %id, "Updated head ref");
        Ok(true)
    }
}

impl HeadRefs for HeadRefsPropertiesFile {
    fn get_head(&self, name: &str) -> Result<Option<BundleId>> {
        Ok(self.read_all()?.remove(name))
    }

    fn set_head(&self, name: &str, id: &BundleId) -> Result<()> {
        self.update(name, |_| true, id).map(|_| ())
    }

    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&BundleId>,
        id: &BundleId,
    ) -> Result<bool> {
        self.update(name, |current| current == expected, id)
    }

    fn heads(&self) -> Result<BTreeMap<String, BundleId>> {
        self.read_all()
    }
}
