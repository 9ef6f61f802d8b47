//! The durable, append-only bundle store.
//!
//! Layout of a bundle directory:
//!
//! ```text
//! bundles/
//!   timezone.txt                      # offset used to render tokens
//!   <token>.zip                       # file contents (absent when empty)
//!   <token>.json                      # BundleManifest
//! ```
//!
//! Archives and manifests are written under temporary names and renamed
//! into place, so a reader never sees a partial bundle.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bundle_fs::name::is_compressed;
use bundle_fs::{ReadableResourceCollection, ResourceCollection, io};
use chrono::{Datelike, Timelike, Utc};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{BundleId, BundleManifest, BundleTimeFormat, ResourceCollectionDiff, ResourceListing};
use crate::device::DeviceId;
use crate::{Error, Result};

/// Writes and extracts bundles in one bundle directory.
#[derive(Debug, Clone)]
pub struct BundleStore {
    bundle_dir: PathBuf,
    device_id: DeviceId,
    time_format: BundleTimeFormat,
}

impl BundleStore {
    /// Open (creating if needed) the bundle directory.
    pub fn open(bundle_dir: impl Into<PathBuf>, device_id: DeviceId) -> Result<Self> {
        let bundle_dir = bundle_dir.into();
        fs::create_dir_all(&bundle_dir).map_err(|e| Error::io(&bundle_dir, e))?;
        let time_format = BundleTimeFormat::load_or_create(&bundle_dir)?;
        Ok(Self {
            bundle_dir,
            device_id,
            time_format,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn zip_path(&self, id: &BundleId) -> PathBuf {
        self.bundle_dir.join(format!("{}.zip", id.token()))
    }

    pub fn manifest(&self, id: &BundleId) -> Result<BundleManifest> {
        BundleManifest::read(&self.bundle_dir, id)
    }

    /// Create a new bundle from `filenames` in `source`.
    ///
    /// Files whose modification time or checksum cannot be read are treated
    /// as already deleted and left out; the manifest records exactly what
    /// was written. `timestamp` defaults to now.
    pub fn store_bundle(
        &self,
        name: &str,
        source: &dyn ReadableResourceCollection,
        filenames: &[String],
        parents: Vec<BundleId>,
        timestamp: Option<i64>,
    ) -> Result<BundleId> {
        let id = self.allocate_id(name, timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()))?;
        let files = self.write_files_to_zip(&id, source, filenames)?;

        let manifest = BundleManifest::new(id.clone(), files, parents);
        manifest.write(&self.bundle_dir)?;
        info!(bundle = %id, files = manifest.files.len(), "Stored bundle");
        Ok(id)
    }

    /// Pick an ID not used yet in this directory. Two bundles stored in the
    /// same millisecond would otherwise collide.
    fn allocate_id(&self, name: &str, mut millis: i64) -> Result<BundleId> {
        loop {
            let id = BundleId::new(self.time_format.to_local(millis), &self.device_id, name)?;
            if !BundleManifest::path_for(&self.bundle_dir, &id).exists()
                && !self.zip_path(&id).exists()
            {
                return Ok(id);
            }
            millis += 1;
        }
    }

    fn write_files_to_zip(
        &self,
        id: &BundleId,
        source: &dyn ReadableResourceCollection,
        filenames: &[String],
    ) -> Result<ResourceListing> {
        let mut listing = ResourceListing::new();
        if filenames.is_empty() {
            return Ok(listing);
        }

        let zip_path = self.zip_path(id);
        let temp_path = zip_path.with_extension("zip.tmp");
        let result = self.write_zip_file(&temp_path, source, filenames, &mut listing);
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if listing.is_empty() {
            io::remove_file_if_exists(&temp_path)?;
        } else {
            fs::rename(&temp_path, &zip_path).map_err(|e| Error::io(&zip_path, e))?;
        }
        Ok(listing)
    }

    fn write_zip_file(
        &self,
        path: &Path,
        source: &dyn ReadableResourceCollection,
        filenames: &[String],
        listing: &mut ResourceListing,
    ) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        for filename in filenames {
            let (Some(modified), Some(checksum)) =
                (source.last_modified(filename), source.checksum(filename))
            else {
                debug!(file = %filename, "Skipping missing file");
                continue;
            };
            let mut reader = match source.open_resource(filename) {
                Ok(reader) => reader,
                Err(e) => {
                    debug!(file = %filename, error = %e, "Skipping unreadable file");
                    continue;
                }
            };

            // archives gain nothing from a second round of compression
            let method = if is_compressed(filename) {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Deflated
            };
            let options = SimpleFileOptions::default()
                .compression_method(method)
                .last_modified_time(self.zip_time(modified));

            zip.start_file(filename.as_str(), options)
                .map_err(|e| Error::zip(path, e))?;
            std::io::copy(&mut reader, &mut zip).map_err(|e| Error::io(path, e))?;
            listing.add(filename.clone(), modified, checksum);
        }

        let mut writer = zip.finish().map_err(|e| Error::zip(path, e))?;
        writer.flush().map_err(|e| Error::io(path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::io(path, e.into_error()))?;
        file.sync_all().map_err(|e| Error::io(path, e))
    }

    fn zip_time(&self, millis: i64) -> zip::DateTime {
        let local = self.time_format.to_local(millis);
        zip::DateTime::from_date_and_time(
            u16::try_from(local.year()).unwrap_or(1980),
            local.month() as u8,
            local.day() as u8,
            local.hour() as u8,
            local.minute() as u8,
            local.second() as u8,
        )
        .unwrap_or_default()
    }

    /// Extract every file of `id` into `target`.
    pub fn extract_all(
        &self,
        id: &BundleId,
        target: &dyn ResourceCollection,
    ) -> Result<ResourceListing> {
        self.extract_bundle(id, target, None, true, false)?;
        Ok(self.manifest(id)?.files)
    }

    /// Extract `id` into `target`, relative to the previously extracted
    /// `old_id`.
    ///
    /// With `overwrite`, every file in the new manifest is written;
    /// otherwise only files that differ or are new. With `delete`, files
    /// only in the old manifest are removed from `target`.
    pub fn extract_bundle(
        &self,
        id: &BundleId,
        target: &dyn ResourceCollection,
        old_id: Option<&BundleId>,
        overwrite: bool,
        delete: bool,
    ) -> Result<ResourceCollectionDiff> {
        let old_files = match old_id {
            Some(old) => self.manifest(old)?.files,
            None => ResourceListing::new(),
        };
        let new_files = self.manifest(id)?.files;
        let diff = ResourceCollectionDiff::new(&old_files, &new_files);

        let to_extract: BTreeSet<String> = if overwrite {
            new_files.names().cloned().collect()
        } else {
            diff.differing.union(&diff.only_in_b).cloned().collect()
        };
        self.extract_files_from_zip(id, target, &new_files, &to_extract)?;

        if delete {
            for name in &diff.only_in_a {
                debug!(file = %name, "Deleting file absent from new bundle");
                target.delete_resource(name)?;
            }
        }
        Ok(diff)
    }

    /// Extract only `names` from `id`. Names not in its manifest are ignored.
    pub fn extract_files(
        &self,
        id: &BundleId,
        target: &dyn ResourceCollection,
        names: &BTreeSet<String>,
    ) -> Result<()> {
        let files = self.manifest(id)?.files;
        let wanted: BTreeSet<String> = names
            .iter()
            .filter(|n| files.contains(n))
            .cloned()
            .collect();
        self.extract_files_from_zip(id, target, &files, &wanted)
    }

    fn extract_files_from_zip(
        &self,
        id: &BundleId,
        target: &dyn ResourceCollection,
        files: &ResourceListing,
        to_extract: &BTreeSet<String>,
    ) -> Result<()> {
        if to_extract.is_empty() {
            return Ok(());
        }

        let zip_path = self.zip_path(id);
        let mut archive = self.open_archive(&zip_path)?;
        let mut extracted = 0usize;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| Error::zip(&zip_path, e))?;
            let name = entry.name().to_string();

            // entries missing from the manifest may be metadata written by
            // a newer producer
            let Some(info) = files.get(&name) else {
                continue;
            };
            if !to_extract.contains(&name) {
                continue;
            }

            target.write_resource(&name, info.modified, &mut entry)?;
            extracted += 1;
        }

        if extracted < to_extract.len() {
            warn!(bundle = %id, expected = to_extract.len(), extracted, "Bundle archive is missing entries");
            return Err(Error::CorruptBundle { path: zip_path });
        }
        debug!(bundle = %id, extracted, "Extracted files");
        Ok(())
    }

    fn open_archive(&self, zip_path: &Path) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(zip_path).map_err(|e| Error::io(zip_path, e))?;
        let len = file.metadata().map_err(|e| Error::io(zip_path, e))?.len();
        if len == 0 {
            return Err(Error::CorruptBundle {
                path: zip_path.to_path_buf(),
            });
        }
        ZipArchive::new(BufReader::new(file)).map_err(|e| match e {
            zip::result::ZipError::Io(source) => Error::io(zip_path, source),
            _ => Error::CorruptBundle {
                path: zip_path.to_path_buf(),
            },
        })
    }

    /// Verify that the archive of `id` is readable and holds every file its
    /// manifest lists.
    pub fn check_archive(&self, id: &BundleId) -> Result<()> {
        let manifest = self.manifest(id)?;
        if manifest.files.is_empty() {
            return Ok(());
        }
        let zip_path = self.zip_path(id);
        let archive = self.open_archive(&zip_path)?;
        let present: HashSet<&str> = archive.file_names().collect();
        if manifest.files.names().all(|n| present.contains(n.as_str())) {
            Ok(())
        } else {
            Err(Error::CorruptBundle { path: zip_path })
        }
    }

    /// Length of the parent chain starting at `id`, following first parents.
    pub fn history_depth(&self, id: &BundleId) -> Result<usize> {
        let mut depth = 1;
        let mut current = self.manifest(id)?;
        while let Some(parent) = current.parents.first() {
            current = self.manifest(parent)?;
            depth += 1;
        }
        Ok(depth)
    }
}
