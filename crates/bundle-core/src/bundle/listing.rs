//! File listings and the diff between two of them.

use std::collections::{BTreeMap, BTreeSet};

use bundle_fs::ReadableResourceCollection;
use serde::{Deserialize, Serialize};

/// What a bundle records about one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Modification time in epoch milliseconds
    pub modified: i64,
    /// Canonical `sha256:<hex>` checksum
    pub checksum: String,
}

/// Mapping from resource name to its recorded modification time and checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceListing {
    files: BTreeMap<String, FileEntry>,
}

impl ResourceListing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the named resources of a collection. Resources whose
    /// modification time or checksum cannot be read are left out.
    pub fn from_collection<'a>(
        collection: &dyn ReadableResourceCollection,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let mut listing = Self::new();
        for name in names {
            if let (Some(modified), Some(checksum)) =
                (collection.last_modified(name), collection.checksum(name))
            {
                listing.add(name.clone(), modified, checksum);
            }
        }
        listing
    }

    pub fn add(&mut self, name: impl Into<String>, modified: i64, checksum: impl Into<String>) {
        self.files.insert(
            name.into(),
            FileEntry {
                modified,
                checksum: checksum.into(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Differences between listing A (older) and listing B (newer).
///
/// The four sets partition the union of both name sets. Files are compared
/// by checksum only; a touched but unchanged file counts as unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceCollectionDiff {
    pub only_in_a: BTreeSet<String>,
    pub only_in_b: BTreeSet<String>,
    pub differing: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl ResourceCollectionDiff {
    pub fn new(a: &ResourceListing, b: &ResourceListing) -> Self {
        let mut diff = Self::default();
        for (name, entry_a) in a.iter() {
            match b.get(name) {
                None => {
                    diff.only_in_a.insert(name.clone());
                }
                Some(entry_b) if entry_b.checksum != entry_a.checksum => {
                    diff.differing.insert(name.clone());
                }
                Some(_) => {
                    diff.unchanged.insert(name.clone());
                }
            }
        }
        for name in b.names() {
            if !a.contains(name) {
                diff.only_in_b.insert(name.clone());
            }
        }
        diff
    }

    /// True when B adds, removes or changes nothing relative to A.
    pub fn no_differences(&self) -> bool {
        self.only_in_a.is_empty() && self.only_in_b.is_empty() && self.differing.is_empty()
    }

    /// Names that were added, removed or changed.
    pub fn changed_names(&self) -> BTreeSet<String> {
        self.only_in_a
            .iter()
            .chain(&self.only_in_b)
            .chain(&self.differing)
            .cloned()
            .collect()
    }
}
