//! Immutable, content-addressed snapshots of a file collection.
//!
//! A bundle is a ZIP of files plus a [`BundleManifest`] recording each
//! file's modification time and checksum and the bundle's parents. Bundles
//! are never edited; a new version names the old one as its parent.

mod id;
mod listing;
mod manifest;
mod store;

pub use id::{BundleId, BundleTimeFormat, validate_bundle_name};
pub use listing::{FileEntry, ResourceCollectionDiff, ResourceListing};
pub use manifest::BundleManifest;
pub use store::BundleStore;
