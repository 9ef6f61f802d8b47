use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bundle_fs::{FileResourceCollection, ReadableResourceCollection, ResourceCollection};
use tracing::{debug, info, warn};

use crate::bundle::{BundleId, BundleStore, ResourceCollectionDiff, ResourceListing};
use crate::heads::HeadRefs;
use crate::strategy::DirKind;
use crate::{Error, Result};

/// Moves changes between a working collection and a bundle store.
///
/// Two sets of head refs are tracked: `working_heads` records which bundle
/// each partition of the working collection was last synced with, and
/// `bundle_heads` holds the published heads every device shares. A
/// partition is publishable when the working files differ from the bundle
/// its working head names.
///
/// `sync_down` and `sync_up` return `Ok(true)` when another writer moved a
/// head underneath them and the call should be repeated.
pub struct SyncClient {
    kind: DirKind,
    collection: Arc<FileResourceCollection>,
    working_heads: Box<dyn HeadRefs>,
    store: BundleStore,
    bundle_heads: Box<dyn HeadRefs>,
    /// Bundles stored but never published because a concurrent writer won
    /// the race; they become extra parents of the next bundle.
    merge_parents: BTreeMap<String, BundleId>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("kind", &self.kind)
            .field("collection", &self.collection)
            .field("store", &self.store)
            .field("merge_parents", &self.merge_parents)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    pub fn new(
        kind: DirKind,
        collection: Arc<FileResourceCollection>,
        working_heads: Box<dyn HeadRefs>,
        store: BundleStore,
        bundle_heads: Box<dyn HeadRefs>,
    ) -> Self {
        Self {
            kind,
            collection,
            working_heads,
            store,
            bundle_heads,
            merge_parents: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> DirKind {
        self.kind
    }

    pub fn collection(&self) -> &FileResourceCollection {
        &self.collection
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    pub fn working_heads(&self) -> &dyn HeadRefs {
        self.working_heads.as_ref()
    }

    pub fn bundle_heads(&self) -> &dyn HeadRefs {
        self.bundle_heads.as_ref()
    }

    /// Bring the working collection up to the published heads.
    ///
    /// Returns `false` when every partition is current, `true` if a head
    /// moved again while its bundle was being extracted.
    pub fn sync_down(&mut self) -> Result<bool> {
        let published = self.bundle_heads.heads()?;
        let mut retry = false;

        for (name, head) in &published {
            let local = self.working_heads.get_head(name)?;
            if local.as_ref() == Some(head) {
                continue;
            }
            self.pull_partition(name, head, local.as_ref())?;

            if self.bundle_heads.get_head(name)?.as_ref() != Some(head) {
                debug!(bundle = %name, "Head moved during sync down");
                retry = true;
            }
        }
        Ok(retry)
    }

    /// Publish every changed partition except the excluded ones.
    pub fn sync_up(&mut self) -> Result<bool> {
        let kind = self.kind;
        self.sync_up_partitions(|name| !kind.is_excluded_bundle(name))
    }

    /// Publish only the partitions regular flushes leave out.
    pub fn save_default_excluded_files(&mut self) -> Result<bool> {
        let kind = self.kind;
        self.sync_up_partitions(|name| kind.is_excluded_bundle(name))
    }

    /// Overwrite `filenames` in the working collection with their content
    /// from the last synced bundle.
    pub fn restore_files(&mut self, filenames: &[String]) -> Result<()> {
        let mut by_bundle: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for filename in filenames {
            by_bundle
                .entry(self.kind.bundle_name_for(filename))
                .or_default()
                .insert(filename.clone());
        }

        for (name, files) in by_bundle {
            let head = match self.working_heads.get_head(&name)? {
                Some(head) => Some(head),
                None => self.bundle_heads.get_head(&name)?,
            };
            let Some(head) = head else {
                warn!(bundle = %name, "No bundle to restore files from");
                continue;
            };
            self.store.extract_files(&head, self.target(), &files)?;
            info!(bundle = %head, files = files.len(), "Restored files from bundle");
        }
        Ok(())
    }

    /// Republish head bundles whose archives can no longer be read, as long
    /// as the working files still match their manifests.
    ///
    /// Returns the replacement bundles.
    pub fn repair_damaged_bundles(&mut self) -> Result<Vec<BundleId>> {
        let mut repaired = Vec::new();

        for (name, head) in self.working_heads.heads()? {
            if self.bundle_heads.get_head(&name)?.as_ref() != Some(&head) {
                continue;
            }
            match self.store.check_archive(&head) {
                Ok(()) => continue,
                Err(Error::CorruptBundle { .. } | Error::Zip { .. }) => {}
                Err(Error::Io { ref source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound
                        && self.store.manifest(&head).is_ok() => {}
                Err(e) => {
                    warn!(bundle = %head, error = %e, "Cannot check bundle");
                    continue;
                }
            }

            let manifest = self.store.manifest(&head)?;
            let working = ResourceListing::from_collection(self.source(), manifest.files.names());
            if !ResourceCollectionDiff::new(&manifest.files, &working).no_differences() {
                warn!(bundle = %head, "Damaged bundle cannot be repaired: working files have changed");
                continue;
            }

            let names: Vec<String> = manifest.files.names().cloned().collect();
            let id = self
                .store
                .store_bundle(&name, self.source(), &names, vec![head.clone()], None)?;
            if self.bundle_heads.compare_and_set(&name, Some(&head), &id)? {
                self.working_heads.set_head(&name, &id)?;
                warn!(damaged = %head, replacement = %id, "Replaced damaged bundle");
                repaired.push(id);
            }
        }
        Ok(repaired)
    }

    fn source(&self) -> &dyn ReadableResourceCollection {
        self.collection.as_ref()
    }

    fn target(&self) -> &dyn ResourceCollection {
        self.collection.as_ref()
    }

    fn listing_for(&self, id: Option<&BundleId>) -> Result<ResourceListing> {
        match id {
            Some(id) => Ok(self.store.manifest(id)?.files),
            None => Ok(ResourceListing::new()),
        }
    }

    /// Working files grouped by the bundle they belong to.
    fn current_partitions(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut partitions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.collection.list_resource_names()? {
            partitions
                .entry(self.kind.bundle_name_for(&name))
                .or_default()
                .push(name);
        }
        Ok(partitions)
    }

    fn working_listing(&self, name: &str) -> Result<ResourceListing> {
        let files = self.current_partitions()?.remove(name).unwrap_or_default();
        Ok(ResourceListing::from_collection(self.source(), &files))
    }

    /// Move partition `name` from `local` to the published `head`.
    ///
    /// Without local changes this is a plain incremental extraction. With
    /// them, remote changes are replayed onto the working files and the
    /// locally changed files are kept; they are republished by the next
    /// `sync_up`. A partition never synced before has an empty base, so
    /// every file already in the working copy counts as a local change.
    fn pull_partition(&mut self, name: &str, head: &BundleId, local: Option<&BundleId>) -> Result<()> {
        let base = self.listing_for(local)?;
        let working = self.working_listing(name)?;
        let local_changes = ResourceCollectionDiff::new(&base, &working).changed_names();

        if local_changes.is_empty() {
            debug!(bundle = %head, fresh = local.is_none(), "Extracting bundle");
            self.store.extract_bundle(head, self.target(), local, false, local.is_some())?;
        } else {
            let remote = self.listing_for(Some(head))?;
            let remote_diff = ResourceCollectionDiff::new(&base, &remote);

            let remote_changes = remote_diff.changed_names();
            for file in remote_changes.intersection(&local_changes) {
                let same = remote.get(file).map(|e| &e.checksum)
                    == working.get(file).map(|e| &e.checksum);
                if !same {
                    warn!(bundle = %name, file = %file, "Conflicting change; keeping local copy");
                }
            }

            let to_extract: BTreeSet<String> = remote_diff
                .differing
                .union(&remote_diff.only_in_b)
                .filter(|f| !local_changes.contains(*f))
                .cloned()
                .collect();
            self.store.extract_files(head, self.target(), &to_extract)?;

            for file in remote_diff.only_in_a.difference(&local_changes) {
                debug!(file = %file, "Deleting file removed remotely");
                self.target().delete_resource(file)?;
            }
            info!(bundle = %name, kept = local_changes.len(), "Rebased local changes onto new head");
        }

        info!(bundle = %head, "Synced down");
        self.working_heads.set_head(name, head)
    }

    fn sync_up_partitions(&mut self, include: impl Fn(&str) -> bool) -> Result<bool> {
        let mut partitions = self.current_partitions()?;
        let mut names: BTreeSet<String> = partitions.keys().cloned().collect();
        // partitions whose files were all deleted still need a new bundle
        names.extend(self.working_heads.heads()?.into_keys());

        let mut retry = false;
        for name in names.into_iter().filter(|n| include(n)) {
            let files = partitions.remove(&name).unwrap_or_default();
            if self.sync_up_partition(&name, &files)? {
                retry = true;
            }
        }
        Ok(retry)
    }

    fn sync_up_partition(&mut self, name: &str, files: &[String]) -> Result<bool> {
        let base = self.working_heads.get_head(name)?;
        let published = self.bundle_heads.get_head(name)?;

        if published != base
            && let Some(head) = &published
        {
            debug!(bundle = %name, "Published head moved; syncing down first");
            self.pull_partition(name, head, base.as_ref())?;
            return Ok(true);
        }

        let base_files = self.listing_for(base.as_ref())?;
        let working = ResourceListing::from_collection(self.source(), files);
        if ResourceCollectionDiff::new(&base_files, &working).no_differences() {
            return Ok(false);
        }

        let mut parents: Vec<BundleId> = base.into_iter().collect();
        if let Some(orphan) = self.merge_parents.remove(name) {
            parents.push(orphan);
        }
        let names: Vec<String> = working.names().cloned().collect();
        let id = self
            .store
            .store_bundle(name, self.source(), &names, parents, None)?;

        if self
            .bundle_heads
            .compare_and_set(name, published.as_ref(), &id)?
        {
            self.working_heads.set_head(name, &id)?;
            info!(bundle = %id, "Published bundle");
            Ok(false)
        } else {
            debug!(bundle = %id, "Lost publish race; will merge on retry");
            self.merge_parents.insert(name.to_string(), id);
            Ok(true)
        }
    }
}
