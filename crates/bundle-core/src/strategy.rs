//! Directory kinds: which files belong to a dataset and how they are split
//! into bundles.

use std::path::Path;
use std::sync::Arc;

use bundle_fs::NameFilter;
use bundle_fs::name::extension;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::settings::SETTINGS_FILE;

/// Bundle name suffix for per-file data bundles.
pub const PDASH_BUNDLE_SUFFIX: &str = ",pdash";

/// Name of the nested directory migrated along with a WBS directory.
pub const DISSEMINATE_SUBDIR: &str = "disseminate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirKind {
    /// A personal dataset
    Dashboard,
    /// A team work-breakdown directory
    Wbs,
    /// The `disseminate` directory nested in a WBS directory
    Disseminate,
}

impl DirKind {
    /// True if `name` is a dataset file of this kind.
    pub fn accepts(&self, name: &str) -> bool {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.ends_with(".lock")
            || name.ends_with(".tmp")
            || name == SETTINGS_FILE
        {
            return false;
        }
        match self {
            Self::Dashboard => true,
            Self::Wbs => matches!(
                extension(name).as_deref(),
                Some("xml" | "pdash" | "ini" | "txt" | "json")
            ),
            Self::Disseminate => matches!(extension(name).as_deref(), Some("xml" | "pdash")),
        }
    }

    pub fn name_filter(&self) -> NameFilter {
        let kind = *self;
        Arc::new(move |name: &str| kind.accepts(name))
    }

    /// Files that were probably truncated by a crash and should be restored
    /// from the last bundle.
    pub fn is_possibly_corrupt(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !self.accepts(name) {
            return false;
        }
        let suspicious = name == "state"
            || matches!(extension(name).as_deref(), Some("pdash" | "zip" | "dat"));
        suspicious && path.metadata().map(|m| m.is_file() && m.len() == 0).unwrap_or(false)
    }

    /// The bundle a file is stored in.
    pub fn bundle_name_for(&self, filename: &str) -> String {
        match self {
            Self::Dashboard if filename == "log.txt" => "log".to_string(),
            Self::Dashboard => "core".to_string(),
            Self::Wbs | Self::Disseminate
                if extension(filename).as_deref() == Some("pdash") =>
            {
                let stem = &filename[..filename.len() - ".pdash".len()];
                let stem: String = stem
                    .chars()
                    .map(|c| {
                        if c.is_whitespace() || matches!(c, '/' | '\\' | '=' | ':' | '#') {
                            '_'
                        } else {
                            c
                        }
                    })
                    .collect();
                format!("{stem}{PDASH_BUNDLE_SUFFIX}")
            }
            Self::Wbs | Self::Disseminate => "wbs".to_string(),
        }
    }

    /// Bundles left out of regular flushes and only saved by a full flush.
    pub fn is_excluded_bundle(&self, bundle: &str) -> bool {
        matches!(self, Self::Dashboard) && bundle == "log"
    }

    /// Whether write-locked directories of this kind flush in the
    /// background by default.
    pub fn background_flush_default(&self) -> bool {
        matches!(self, Self::Dashboard)
    }

    /// Whether per-file data bundles keep their heads in peg files.
    pub fn uses_peg_refs(&self) -> bool {
        matches!(self, Self::Wbs | Self::Disseminate)
    }

    /// Pattern of ref names routed to peg files.
    pub fn peg_ref_pattern() -> Result<Regex> {
        Ok(Regex::new(&format!("{}$", regex::escape(PDASH_BUNDLE_SUFFIX)))?)
    }

    /// Shared team directories see more lock contention.
    pub fn is_contention_prone(&self) -> bool {
        matches!(self, Self::Wbs | Self::Disseminate)
    }

    /// A nested directory migrated together with this one.
    pub fn nested_directory(&self) -> Option<(&'static str, DirKind)> {
        match self {
            Self::Wbs => Some((DISSEMINATE_SUBDIR, Self::Disseminate)),
            _ => None,
        }
    }
}

impl std::str::FromStr for DirKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dashboard" => Ok(Self::Dashboard),
            "wbs" => Ok(Self::Wbs),
            "disseminate" => Ok(Self::Disseminate),
            other => Err(format!("unknown directory kind: {other}")),
        }
    }
}
