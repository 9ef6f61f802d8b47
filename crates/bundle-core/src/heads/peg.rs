use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bundle_fs::{FileLock, io};
use tracing::{debug, warn};

use super::HeadRefs;
use crate::bundle::{BundleId, validate_bundle_name};
use crate::{Error, Result};

const PEG_SUFFIX: &str = ".txt";

/// One ref per small file, `<dir>/<qualifier>-<name>.txt`.
///
/// Used for refs that must not share a file with the global refs, such as
/// one bundle per individual data file.
#[derive(Debug, Clone)]
pub struct HeadRefsPegFiles {
    dir: PathBuf,
    qualifier: String,
}

impl HeadRefsPegFiles {
    pub fn new(dir: impl Into<PathBuf>, qualifier: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            qualifier: qualifier.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn prefix(&self) -> String {
        format!("{}-", self.qualifier)
    }

    fn peg_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", self.prefix(), name, PEG_SUFFIX))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.qualifier))
    }

    fn read_peg(&self, path: &Path) -> Result<Option<BundleId>> {
        match io::read_text(path) {
            Ok(content) => match BundleId::parse(content.trim()) {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unparsable peg file");
                    Ok(None)
                }
            },
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl HeadRefs for HeadRefsPegFiles {
    fn get_head(&self, name: &str) -> Result<Option<BundleId>> {
        validate_bundle_name(name)?;
        self.read_peg(&self.peg_path(name))
    }

    fn set_head(&self, name: &str, id: &BundleId) -> Result<()> {
        validate_bundle_name(name)?;
        let _lock = FileLock::exclusive(&self.lock_path())?;
        io::write_text(&self.peg_path(name), &id.token())?;
        Ok(())
    }

    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&BundleId>,
        id: &BundleId,
    ) -> Result<bool> {
        validate_bundle_name(name)?;
        let _lock = FileLock::exclusive(&self.lock_path())?;
        let path = self.peg_path(name);
        if self.read_peg(&path)?.as_ref() != expected {
            return Ok(false);
        }
        io::write_text(&path, &id.token())?;
        debug!(path = %path.display(), head = %id, "Updated peg file");
        Ok(true)
    }

    fn heads(&self) -> Result<BTreeMap<String, BundleId>> {
        let mut refs = BTreeMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };
        let prefix = self.prefix();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(name) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(PEG_SUFFIX))
            else {
                continue;
            };
            if let Some(id) = self.read_peg(&entry.path())? {
                refs.insert(name.to_string(), id);
            }
        }
        Ok(refs)
    }
}
