//! Command context
//!
//! Resolves the target and working directories, the dataset kind and the
//! settings once, so every command opens directories the same way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundle_core::migrate::bundle_mode;
use bundle_core::{BundleMode, DeviceId, DeviceLockManager, DirKind, SyncSettings, WorkingDirectory};

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Owner name recorded in the write lock by CLI commands.
pub const CLI_OWNER: &str = "bundlectl";

#[derive(Debug, Clone)]
pub struct Context {
    pub target: PathBuf,
    pub working: PathBuf,
    pub kind: DirKind,
    pub settings: SyncSettings,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Self::new(&cli.target, cli.working.as_deref(), cli.kind, cli.device.as_deref())
    }

    pub fn new(
        target: &Path,
        working: Option<&Path>,
        kind: DirKind,
        device: Option<&str>,
    ) -> Result<Self> {
        if !target.is_dir() {
            return Err(CliError::user(format!(
                "Target directory does not exist: {}",
                target.display()
            )));
        }

        let mut settings = SyncSettings::load(target)?;
        if let Some(device) = device {
            settings.device_id = Some(device.to_string());
        }
        // one-shot commands flush explicitly
        settings.background_flush = Some(false);

        Ok(Self {
            target: target.to_path_buf(),
            working: working.map_or_else(|| target.to_path_buf(), Path::to_path_buf),
            kind,
            settings,
        })
    }

    pub fn is_in_place(&self) -> bool {
        self.working == self.target
    }

    /// Bundle mode of the target, `None` for a flat directory.
    pub fn bundle_mode(&self) -> Result<Option<BundleMode>> {
        Ok(bundle_mode(&self.target, self.kind)?)
    }

    pub fn device_id(&self) -> Result<DeviceId> {
        Ok(DeviceId::resolve(self.settings.device_id.as_deref())?)
    }

    pub fn device_locks(&self) -> Result<DeviceLockManager> {
        Ok(DeviceLockManager::new(
            &self.target,
            self.device_id()?,
            self.settings.device_lock_freshness(),
        ))
    }

    /// Open and prepare the working copy.
    ///
    /// A bundled target holds only bundles and compatibility stubs, so the
    /// working copy must live elsewhere; opening it in place would unpack
    /// the flat files next to the stubs.
    pub fn open(&self) -> Result<WorkingDirectory> {
        if self.is_in_place() {
            return Err(CliError::user(
                "this command needs a separate working copy; pass --working <dir>",
            ));
        }

        let mut dir = WorkingDirectory::new(
            &self.target,
            &self.working,
            self.kind,
            self.settings.clone(),
        )?;
        dir.set_device_lock_manager(Arc::new(self.device_locks()?));
        dir.prepare()?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_target_is_a_user_error() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        let err = Context::new(&missing, None, DirKind::Dashboard, Some("dev1")).unwrap_err();
        assert!(matches!(err, CliError::User { .. }));
    }

    #[test]
    fn working_defaults_to_target() {
        let temp = TempDir::new().unwrap();
        let ctx = Context::new(temp.path(), None, DirKind::Dashboard, Some("dev1")).unwrap();
        assert!(ctx.is_in_place());
        assert_eq!(ctx.settings.device_id.as_deref(), Some("dev1"));
        assert_eq!(ctx.settings.background_flush, Some(false));
    }

    #[test]
    fn in_place_directory_is_not_opened() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("state"), "x").unwrap();
        let ctx = Context::new(temp.path(), None, DirKind::Dashboard, Some("dev1")).unwrap();

        let err = ctx.open().unwrap_err();
        assert!(err.to_string().contains("--working"));
        assert!(!temp.path().join("bundles").exists());
    }

    #[test]
    fn separate_working_directory_opens_empty_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target");
        let working = temp.path().join("working");
        std::fs::create_dir_all(&target).unwrap();

        let ctx = Context::new(&target, Some(&working), DirKind::Dashboard, Some("dev1")).unwrap();
        let dir = ctx.open().unwrap();
        assert_eq!(dir.working_dir(), working.as_path());
        assert!(dir.published_heads().unwrap().is_empty());
    }
}
