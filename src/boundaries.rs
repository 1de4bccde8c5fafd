use crate::config::ColumnConfig;
use crate::types::{AdminLevel, BoundaryRow, JoinResult, PolygonFeature};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{info, warn};

/// Boundary polygons for every administrative level, with the running
/// facility count for each place.
#[derive(Debug, Clone, Default)]
pub struct BoundaryStore {
    levels: BTreeMap<AdminLevel, Vec<BoundaryRow>>,
}

impl BoundaryStore {
    /// Builds the store from one polygon layer per level.
    ///
    /// The level-specific code and name fields (`ADM2_PCODE`, `ADM2_REF`, ...)
    /// are promoted to the common place code and place name columns. All other
    /// attributes pass through, and the attribute keys are aligned across levels
    /// so every level publishes the same set of columns.
    pub fn from_layers(
        layers: Vec<(AdminLevel, Vec<PolygonFeature>)>,
        columns: &ColumnConfig,
    ) -> Self {
        let mut levels: BTreeMap<AdminLevel, Vec<BoundaryRow>> = BTreeMap::new();

        for (level, features) in layers {
            let code_field = columns.source_place_code_for(level);
            let name_field = columns.source_place_name_for(level);
            let rows = levels.entry(level).or_default();
            let mut seen: HashSet<String> = rows.iter().map(|r| r.place_code.clone()).collect();

            for feature in features {
                let mut attributes = feature.attributes;

                let country_code = match attributes.remove(&columns.country_code) {
                    Some(c) if !c.trim().is_empty() => c.trim().to_uppercase(),
                    _ => {
                        warn!("adm{}: skipping boundary without '{}'", level, columns.country_code);
                        continue;
                    }
                };
                let place_code = match attributes.get(&code_field) {
                    Some(c) if !c.is_empty() => c.clone(),
                    _ => {
                        warn!("{}: skipping adm{} boundary without '{}'", country_code, level, code_field);
                        continue;
                    }
                };
                if !seen.insert(place_code.clone()) {
                    warn!("{}: duplicate place code {} at adm{}, keeping the first", country_code, place_code, level);
                    continue;
                }

                let place_name = attributes.get(&name_field).cloned().unwrap_or_default();
                attributes.insert(columns.place_name.clone(), place_name);
                // These are carried by dedicated fields
                attributes.remove(&columns.admin_level);
                attributes.remove(&columns.place_code);
                attributes.remove(&columns.health_facilities);

                rows.push(BoundaryRow {
                    country_code,
                    admin_level: level,
                    place_code,
                    geometry: feature.geometry,
                    health_facility_count: None,
                    attributes,
                });
            }
        }

        // Align attribute keys across all levels
        let keys: BTreeSet<String> = levels
            .values()
            .flatten()
            .flat_map(|row| row.attributes.keys().cloned())
            .collect();
        for row in levels.values_mut().flatten() {
            for key in &keys {
                row.attributes.entry(key.clone()).or_default();
            }
        }

        for (level, rows) in &levels {
            info!("Loaded {} boundaries at adm{}", rows.len(), level);
        }

        Self { levels }
    }

    pub fn levels(&self) -> Vec<AdminLevel> {
        self.levels.keys().copied().collect()
    }

    /// Every country with at least one boundary at any level.
    pub fn countries(&self) -> BTreeSet<String> {
        self.levels
            .values()
            .flatten()
            .map(|row| row.country_code.clone())
            .collect()
    }

    pub fn rows(&self, level: AdminLevel) -> &[BoundaryRow] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn country_rows(&self, level: AdminLevel, country: &str) -> Vec<&BoundaryRow> {
        self.rows(level)
            .iter()
            .filter(|row| row.country_code == country)
            .collect()
    }

    /// Writes the counts of a successful join onto the country's rows at
    /// `level`. Places missing from `counts` are left unset.
    pub fn record_counts(&mut self, level: AdminLevel, country: &str, counts: &JoinResult) {
        if let Some(rows) = self.levels.get_mut(&level) {
            for row in rows.iter_mut().filter(|r| r.country_code == country) {
                if let Some(&n) = counts.get(&row.place_code) {
                    row.health_facility_count = Some(n);
                }
            }
        }
    }
}
