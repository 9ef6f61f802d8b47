//! Compatibility stubs left in a bundled directory.
//!
//! Older clients read these `key=value` files first. Seeing a version
//! requirement they do not meet, they refuse to open the flat layout that
//! no longer holds the data.

use std::path::Path;

use bundle_fs::io;

use super::BundleMode;
use crate::Result;
use crate::strategy::DirKind;

pub const REQUIRES_VERSION_KEY: &str = "requiresVersion";
pub const BUNDLE_MODE_KEY: &str = "bundleMode";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityStub {
    pub filename: &'static str,
    pub content: String,
}

/// The stubs written for `kind` after bundling. The first one carries the
/// bundle mode.
pub fn compatibility_stubs(kind: DirKind, mode: BundleMode) -> Vec<CompatibilityStub> {
    let version = mode.min_version(kind);
    let settings = format!(
        "# This dataset is stored in bundles; open it with version {version} or later.\n\
         {REQUIRES_VERSION_KEY}={version}\n\
         {BUNDLE_MODE_KEY}={}\n",
        mode.as_str()
    );
    match kind {
        DirKind::Dashboard => vec![
            CompatibilityStub {
                filename: "pspdash.ini",
                content: settings,
            },
            CompatibilityStub {
                filename: "global.dat",
                content: format!(
                    "# Placeholder. Data is stored in bundles.\n{REQUIRES_VERSION_KEY}={version}\n"
                ),
            },
        ],
        DirKind::Wbs => vec![CompatibilityStub {
            filename: "user-settings.ini",
            content: settings,
        }],
        DirKind::Disseminate => Vec::new(),
    }
}

/// Parse a `key=value` stub, ignoring comments.
pub fn read_stub_value(path: &Path, key: &str) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = io::read_text(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string()))
}
