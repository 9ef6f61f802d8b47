//! Zip backups of a dataset directory
//!
//! Taken before a migration touches anything, so every migration step can
//! be re-run from a known state.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bundle_fs::{BundlePath, NameFilter, io};
use chrono::{Duration, Local, NaiveDateTime};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Error, Result};

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A backup archive that was written.
#[derive(Debug, Clone)]
pub struct Backup {
    /// Path to the zip file
    pub path: PathBuf,
    /// `backup-<stamp>-`, shared by everything moved aside with this backup
    pub prefix: String,
    /// Files in the archive
    pub files: Vec<String>,
}

/// Creates and restores backups under `<dir>/backup/`.
pub struct BackupManager {
    dir: PathBuf,
    backup_dir: PathBuf,
    filter: NameFilter,
}

impl BackupManager {
    /// Back up the top-level files of `dir` accepted by `filter`.
    pub fn new(dir: impl Into<PathBuf>, filter: NameFilter) -> Self {
        let dir = dir.into();
        let backup_dir = dir.join(BundlePath::BackupDir);
        Self {
            dir,
            backup_dir,
            filter,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Write `backup-<YYYYMMDDHHMMSS>-<qualifier>.zip`.
    pub fn create_backup(&self, qualifier: &str) -> Result<Backup> {
        fs::create_dir_all(&self.backup_dir).map_err(|e| Error::io(&self.backup_dir, e))?;

        let (prefix, path) = self.unused_name(qualifier);
        let files = self.dataset_files()?;
        self.write_archive(&path, &files).inspect_err(|_| {
            let _ = fs::remove_file(&path);
        })?;

        info!(path = %path.display(), files = files.len(), "Created backup");
        Ok(Backup {
            path,
            prefix,
            files,
        })
    }

    /// Backups in this directory, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir).map_err(|e| Error::io(&self.backup_dir, e))? {
            let path = entry.map_err(|e| Error::io(&self.backup_dir, e))?.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("backup-") && n.ends_with(".zip"));
            if is_backup {
                backups.push(path);
            }
        }
        backups.sort();
        Ok(backups)
    }

    /// Extract every file of `backup` back into the directory.
    pub fn restore_backup(&self, backup: &Path) -> Result<Vec<String>> {
        let file = File::open(backup).map_err(|e| Error::io(backup, e))?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| Error::zip(backup, e))?;

        let mut restored = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| Error::zip(backup, e))?;
            let name = bundle_fs::normalize_resource_name(entry.name())?;
            io::write_atomic_from(&self.dir.join(&name), &mut entry, None)?;
            restored.push(name);
        }
        info!(backup = %backup.display(), files = restored.len(), "Restored backup");
        Ok(restored)
    }

    fn unused_name(&self, qualifier: &str) -> (String, PathBuf) {
        let mut stamp: NaiveDateTime = Local::now().naive_local();
        loop {
            let prefix = format!("backup-{}-", stamp.format(STAMP_FORMAT));
            let path = self.backup_dir.join(format!("{prefix}{qualifier}.zip"));
            if !path.exists() {
                return (prefix, path);
            }
            stamp += Duration::seconds(1);
        }
    }

    fn dataset_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))? {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string()
                && (self.filter)(&name)
            {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    fn write_archive(&self, path: &Path, files: &[String]) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for name in files {
            let source = self.dir.join(name);
            let mut reader = match File::open(&source) {
                Ok(f) => BufReader::new(f),
                Err(e) => {
                    debug!(file = %name, error = %e, "Skipping file that vanished");
                    continue;
                }
            };
            zip.start_file(name.as_str(), options)
                .map_err(|e| Error::zip(path, e))?;
            std::io::copy(&mut reader, &mut zip).map_err(|e| Error::io(&source, e))?;
        }

        let mut writer = zip.finish().map_err(|e| Error::zip(path, e))?;
        writer.flush().map_err(|e| Error::io(path, e))
    }
}
