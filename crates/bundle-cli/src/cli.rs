//! CLI argument parsing using clap derive

use std::path::PathBuf;

use bundle_core::DirKind;
use clap::{Parser, Subcommand};

/// bundlectl - Inspect and maintain bundled dataset directories
#[derive(Parser, Debug)]
#[command(name = "bundlectl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding bundles/ and heads/
    #[arg(long, global = true, env = "BUNDLE_TARGET_DIR", default_value = ".")]
    pub target: PathBuf,

    /// Working copy of the target; defaults to the target itself
    #[arg(long, global = true, env = "BUNDLE_WORKING_DIR")]
    pub working: Option<PathBuf>,

    /// Kind of dataset directory (dashboard, wbs or disseminate)
    #[arg(long, global = true, default_value = "dashboard")]
    pub kind: DirKind,

    /// Override the identifier of this device
    #[arg(long, global = true, env = "BUNDLE_DEVICE_ID")]
    pub device: Option<String>,

    /// The command to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show bundle mode, heads and device locks
    Status {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Pull newer bundles into the working copy
    Update,

    /// Publish local changes as new bundles
    Flush,

    /// Convert a flat directory into bundles
    ///
    /// Examples:
    ///   bundlectl migrate --target data/          # dashboard directory
    ///   bundlectl migrate --kind wbs --target wbs/
    Migrate,

    /// Convert a bundled directory back into flat files
    Unmigrate,

    /// List recent lock files written by other devices
    Locks,

    /// Dismiss the lock file of another device
    IgnoreLock {
        /// Device identifier, as shown by `locks`
        #[arg(value_name = "DEVICE")]
        lock_device: String,
    },
}
