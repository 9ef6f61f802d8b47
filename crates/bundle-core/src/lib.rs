//! File-bundle storage and synchronization
//!
//! Turns a directory of mutable files into an append-only chain of
//! immutable bundles, and keeps working copies on many devices in step
//! with a shared bundle store.
//!
//! - [`bundle`]: bundle IDs, manifests and the [`BundleStore`]
//! - [`heads`]: named pointers to the newest bundle of each partition
//! - [`sync`]: the [`SyncClient`] that publishes and pulls changes
//! - [`working`]: the [`WorkingDirectory`] lifecycle, write lock and
//!   background flushing
//! - [`migrate`]: conversion between flat and bundled layouts
//! - [`device_lock`]: advisory per-device lock files

pub mod backup;
pub mod bundle;
pub mod device;
pub mod device_lock;
pub mod error;
pub mod heads;
pub mod migrate;
pub mod settings;
pub mod strategy;
pub mod sync;
pub mod working;

pub use backup::{Backup, BackupManager};
pub use bundle_fs::BundlePath;

pub use bundle::{
    BundleId, BundleManifest, BundleStore, FileEntry, ResourceCollectionDiff, ResourceListing,
};
pub use device::DeviceId;
pub use device_lock::{DeviceLock, DeviceLockManager};
pub use error::{Error, Result};
pub use heads::{HeadRefs, HeadRefsMerger, HeadRefsPegFiles, HeadRefsPropertiesFile};
pub use migrate::{BundleMode, LocalMigrator, MigrationDirection, Migrator, migrate, unmigrate};
pub use settings::{RetryPolicy, SyncSettings};
pub use strategy::DirKind;
pub use sync::SyncClient;
pub use working::{
    DirectoryState, LockMessage, LockMessageHandler, LoggingLockHandler, WorkingDirectory,
    WriteLock, published_head_refs,
};
