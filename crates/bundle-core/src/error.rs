//! Error types for bundle-core

use std::path::PathBuf;

/// Result type for bundle-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in bundle-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure at a known location
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bundle archive could not be read or written
    #[error("ZIP error in {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// A bundle archive exists but is empty or truncated
    #[error("Bundle archive is corrupt: {path}")]
    CorruptBundle { path: PathBuf },

    /// A manifest could not be parsed
    #[error("Failed to parse manifest {path}: {message}")]
    ManifestParse { path: PathBuf, message: String },

    /// A bundle token did not have the expected shape
    #[error("Invalid bundle ID: {token}")]
    InvalidBundleId { token: String },

    /// A head ref name cannot be stored
    #[error("Invalid head ref name: {name}")]
    InvalidRefName { name: String },

    /// Another owner holds the write lock
    #[error("Directory {path} is already locked by {owner}")]
    AlreadyLocked { path: PathBuf, owner: String },

    /// The operation requires the write lock
    #[error("Write lock is not held for {path}")]
    NotLocked { path: PathBuf },

    /// The write lock could not be acquired or has been lost
    #[error("Lock failure for {path}: {reason}")]
    LockFailed { path: PathBuf, reason: String },

    /// A sync loop did not settle within its retry bound
    #[error("Unable to {operation} after {attempts} attempts")]
    SyncFailed { operation: String, attempts: u32 },

    /// `prepare()` must run first
    #[error("Working directory {path} has not been prepared")]
    NotPrepared { path: PathBuf },

    /// Migration could not complete
    #[error("Migration of {path} failed: {message}")]
    Migration { path: PathBuf, message: String },

    /// Device lock file handling
    #[error("Device lock error at {path}: {message}")]
    DeviceLock { path: PathBuf, message: String },

    /// Filesystem error from bundle-fs
    #[error(transparent)]
    Fs(#[from] bundle_fs::Error),

    /// XML document could not be read or written
    #[error("XML error at {path}: {message}")]
    Xml { path: PathBuf, message: String },

    /// JSON serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A ref routing pattern did not compile
    #[error("Invalid ref pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn zip(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.into(),
            source,
        }
    }

    /// True for failures a later attempt may not hit: unreachable or
    /// unreadable storage. Lock, migration and bound-exhaustion failures
    /// are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Zip { .. } | Self::CorruptBundle { .. } => true,
            Self::Fs(inner) => matches!(
                inner,
                bundle_fs::Error::Io { .. } | bundle_fs::Error::MissingCollection { .. }
            ),
            _ => false,
        }
    }

    /// True for lock-related failures.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocked { .. } | Self::NotLocked { .. } | Self::LockFailed { .. }
        ) || matches!(self, Self::Fs(bundle_fs::Error::LockFailed { .. }))
    }
}
