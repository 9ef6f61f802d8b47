//! Filesystem layer for the file-bundle sync engine
//!
//! Provides atomic writes, advisory file locks, checksums, configuration
//! loading and the resource-collection abstraction the sync engine observes.

pub mod checksum;
pub mod collection;
pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod name;

pub use collection::{
    FileResourceCollection, NameFilter, ReadableResourceCollection, ResourceCollection,
    millis_to_system_time, system_time_to_millis,
};
pub use config::ConfigStore;
pub use constants::BundlePath;
pub use error::{Error, Result};
pub use io::FileLock;
pub use name::normalize_resource_name;
