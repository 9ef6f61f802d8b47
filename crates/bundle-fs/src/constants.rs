//! Well-known names inside target and working directories.

use std::path::Path;

/// Reserved subdirectories and files used by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePath {
    /// `bundles/`: immutable ZIP archives and manifests
    BundlesDir,
    /// `heads/`: published head refs
    HeadsDir,
    /// `metadata/`: private per-working-copy state
    MetadataDir,
    /// `locks/`: advisory per-device lock files
    LocksDir,
    /// `backup/`: migration backups
    BackupDir,
    /// `heads.txt` inside `heads/` or `metadata/`
    HeadsFile,
    /// `fileDataCache.xml` inside `metadata/`
    FileDataCache,
    /// `timezone.txt` inside `bundles/`
    TimezoneFile,
    /// `write.lock` in the target directory
    WriteLock,
}

impl BundlePath {
    /// Get the string representation of the path.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BundlesDir => "bundles",
            Self::HeadsDir => "heads",
            Self::MetadataDir => "metadata",
            Self::LocksDir => "locks",
            Self::BackupDir => "backup",
            Self::HeadsFile => "heads.txt",
            Self::FileDataCache => "fileDataCache.xml",
            Self::TimezoneFile => "timezone.txt",
            Self::WriteLock => "write.lock",
        }
    }
}

impl AsRef<Path> for BundlePath {
    fn as_ref(&self) -> &Path {
        Path::new(self.as_str())
    }
}

impl AsRef<str> for BundlePath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for BundlePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
