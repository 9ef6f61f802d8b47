//! Head refs: named pointers to the latest bundle of each bundle name.
//!
//! Three backends compose behind the [`HeadRefs`] trait:
//!
//! - [`HeadRefsPropertiesFile`]: every ref in one `name=token` file, with
//!   writers serialized by an exclusive file lock
//! - [`HeadRefsPegFiles`]: one small file per ref in a directory
//! - [`HeadRefsMerger`]: routes refs matching a pattern to one backend and
//!   everything else to a default
//!
//! Reads take no lock (last-writer-wins visibility). Writes, including the
//! compare-and-set used to publish a new bundle, happen under the lock.

mod merger;
mod peg;
mod properties;

use std::collections::BTreeMap;

pub use merger::HeadRefsMerger;
pub use peg::HeadRefsPegFiles;
pub use properties::HeadRefsPropertiesFile;

use crate::Result;
use crate::bundle::BundleId;

pub trait HeadRefs: Send + Sync {
    /// The bundle `name` currently points at.
    fn get_head(&self, name: &str) -> Result<Option<BundleId>>;

    /// Point `name` at `id` unconditionally.
    fn set_head(&self, name: &str, id: &BundleId) -> Result<()>;

    /// Point `name` at `id` only if it still points at `expected`.
    ///
    /// Returns `false` (and changes nothing) if another writer moved the
    /// ref first.
    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&BundleId>,
        id: &BundleId,
    ) -> Result<bool>;

    /// Every ref this source knows about.
    fn heads(&self) -> Result<BTreeMap<String, BundleId>>;
}

/// Parse `name=token` lines, skipping comments and malformed entries.
fn parse_ref_lines(content: &str, source: &std::path::Path) -> BTreeMap<String, BundleId> {
    let mut refs = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, token)) = line.split_once('=') else {
            tracing::warn!(path = %source.display(), line, "Ignoring malformed head ref line");
            continue;
        };
        match BundleId::parse(token.trim()) {
            Ok(id) => {
                refs.insert(name.trim().to_string(), id);
            }
            Err(e) => {
                tracing::warn!(path = %source.display(), error = %e, "Ignoring unparsable head ref");
            }
        }
    }
    refs
}
