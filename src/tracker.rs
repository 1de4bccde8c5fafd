use crate::types::AdminLevel;
use std::collections::{BTreeMap, BTreeSet};

/// Countries whose counts were freshly computed this run, per admin level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTracker {
    updated: BTreeMap<AdminLevel, BTreeSet<String>>,
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `level` was attempted, so it shows up in `all_levels`
    /// even if every country at it ends up skipped.
    pub fn register_level(&mut self, level: AdminLevel) {
        self.updated.entry(level).or_default();
    }

    pub fn mark_updated(&mut self, level: AdminLevel, country: &str) {
        self.updated
            .entry(level)
            .or_default()
            .insert(country.to_string());
    }

    pub fn updated_countries(&self, level: AdminLevel) -> BTreeSet<String> {
        self.updated.get(&level).cloned().unwrap_or_default()
    }

    pub fn is_updated(&self, level: AdminLevel, country: &str) -> bool {
        self.updated
            .get(&level)
            .is_some_and(|countries| countries.contains(country))
    }

    pub fn all_levels(&self) -> BTreeSet<AdminLevel> {
        self.updated.keys().copied().collect()
    }

    /// True when no country was updated at any level.
    pub fn is_empty(&self) -> bool {
        self.updated.values().all(BTreeSet::is_empty)
    }
}
