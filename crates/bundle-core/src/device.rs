//! Per-device identity.

use std::path::{Path, PathBuf};

use bundle_fs::io;
use tracing::info;

use crate::{Error, Result};

const DEVICE_ID_FILE: &str = "device-id.txt";

/// A short, filename-safe identifier for this installation.
///
/// Appears in bundle tokens and device lock file names, so it may not
/// contain `-` (the token separator) or path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if valid {
            Ok(Self(id))
        } else {
            Err(Error::InvalidBundleId { token: id })
        }
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..12].to_string())
    }

    /// Read the identifier stored in `dir`, creating it on first use.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(DEVICE_ID_FILE);
        match io::read_text(&path) {
            Ok(content) => Self::new(content.trim()),
            Err(e) if e.is_not_found() => {
                let id = Self::generate();
                io::write_text(&path, &id.0)?;
                info!(device = %id, path = %path.display(), "Created device ID");
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The identifier for the current user, honoring an explicit override.
    pub fn resolve(override_id: Option<&str>) -> Result<Self> {
        match override_id {
            Some(id) => Self::new(id),
            None => Self::load_or_create(&default_config_dir()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bundle-sync")
}
