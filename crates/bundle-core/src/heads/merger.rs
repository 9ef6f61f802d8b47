use std::collections::BTreeMap;

use regex::Regex;

use super::HeadRefs;
use crate::bundle::BundleId;
use crate::{Error, Result};

/// Routes each ref to the first source whose pattern matches its name,
/// falling back to a default source.
#[derive(Default)]
pub struct HeadRefsMerger {
    patterned: Vec<(Regex, Box<dyn HeadRefs>)>,
    default: Option<Box<dyn HeadRefs>>,
}

impl std::fmt::Debug for HeadRefsMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadRefsMerger")
            .field(
                "patterns",
                &self.patterned.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl HeadRefsMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patterned_refs(mut self, pattern: Regex, refs: impl HeadRefs + 'static) -> Self {
        self.patterned.push((pattern, Box::new(refs)));
        self
    }

    pub fn add_default_refs(mut self, refs: impl HeadRefs + 'static) -> Self {
        self.default = Some(Box::new(refs));
        self
    }

    fn route(&self, name: &str) -> Result<&dyn HeadRefs> {
        self.patterned
            .iter()
            .find(|(pattern, _)| pattern.is_match(name))
            .map(|(_, refs)| refs.as_ref())
            .or(self.default.as_deref())
            .ok_or_else(|| Error::InvalidRefName {
                name: name.to_string(),
            })
    }

    fn owns(&self, name: &str, source: usize) -> bool {
        self.patterned
            .iter()
            .position(|(pattern, _)| pattern.is_match(name))
            .map_or(source == self.patterned.len(), |i| i == source)
    }
}

impl HeadRefs for HeadRefsMerger {
    fn get_head(&self, name: &str) -> Result<Option<BundleId>> {
        self.route(name)?.get_head(name)
    }

    fn set_head(&self, name: &str, id: &BundleId) -> Result<()> {
        self.route(name)?.set_head(name, id)
    }

    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&BundleId>,
        id: &BundleId,
    ) -> Result<bool> {
        self.route(name)?.compare_and_set(name, expected, id)
    }

    /// Union of every source, each contributing only the names routed to it.
    fn heads(&self) -> Result<BTreeMap<String, BundleId>> {
        let sources = self
            .patterned
            .iter()
            .map(|(_, refs)| refs.as_ref())
            .chain(self.default.as_deref());

        let mut merged = BTreeMap::new();
        for (index, source) in sources.enumerate() {
            for (name, id) in source.heads()? {
                if self.owns(&name, index) {
                    merged.insert(name, id);
                }
            }
        }
        Ok(merged)
    }
}
