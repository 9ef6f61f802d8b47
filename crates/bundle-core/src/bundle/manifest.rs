//! Per-bundle metadata: the file listing plus parent bundle references.

use std::path::{Path, PathBuf};

use bundle_fs::io;
use serde::{Deserialize, Serialize};

use super::{BundleId, ResourceListing};
use crate::{Error, Result};

/// Immutable record of one bundle version.
///
/// Stored as `<bundleDir>/<token>.json` and never rewritten; a later
/// version supersedes it by naming it as a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: BundleId,
    #[serde(default)]
    pub parents: Vec<BundleId>,
    #[serde(default)]
    pub files: ResourceListing,
}

impl BundleManifest {
    pub fn new(id: BundleId, files: ResourceListing, parents: Vec<BundleId>) -> Self {
        Self { id, parents, files }
    }

    pub fn path_for(bundle_dir: &Path, id: &BundleId) -> PathBuf {
        bundle_dir.join(format!("{}.json", id.token()))
    }

    /// Load the manifest for `id`.
    pub fn read(bundle_dir: &Path, id: &BundleId) -> Result<Self> {
        let path = Self::path_for(bundle_dir, id);
        let content = io::read_text(&path)?;
        let manifest: Self =
            serde_json::from_str(&content).map_err(|e| Error::ManifestParse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if &manifest.id != id {
            return Err(Error::ManifestParse {
                path,
                message: format!("manifest describes {} instead", manifest.id),
            });
        }
        Ok(manifest)
    }

    /// Write the manifest with write-then-rename.
    pub fn write(&self, bundle_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        io::write_atomic(&Self::path_for(bundle_dir, &self.id), content.as_bytes())?;
        Ok(())
    }
}
