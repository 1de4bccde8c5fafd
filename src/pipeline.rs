use crate::aggregate::aggregate;
use crate::boundaries::BoundaryStore;
use crate::catalog::{LayerLoader, PublishedStore, ResourceLocator};
use crate::config::{ColumnConfig, InputConfig};
use crate::error::SourceError;
use crate::reconcile::{finalize_level, merge_into_published, FinalRows};
use crate::table::PublishedTable;
use crate::tracker::UpdateTracker;
use crate::types::{AdminLevel, Attributes, FacilityPoint, LayerKind};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{error, info, warn};

/// What happened to one country at one admin level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryOutcome {
    Updated { places: usize, facilities: u64 },
    Skipped(SourceError),
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub tracker: UpdateTracker,
    pub outcomes: BTreeMap<(AdminLevel, String), CountryOutcome>,
}

impl RunReport {
    pub fn outcome(&self, level: AdminLevel, country: &str) -> Option<&CountryOutcome> {
        self.outcomes.get(&(level, country.to_string()))
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&(AdminLevel, String), &SourceError)> {
        self.outcomes.iter().filter_map(|(key, outcome)| match outcome {
            CountryOutcome::Skipped(reason) => Some((key, reason)),
            CountryOutcome::Updated { .. } => None,
        })
    }
}

/// Drives a run: finds each country's facility layer, joins it against
/// each level's boundaries and keeps track of what was updated.
pub struct Pipeline<'a> {
    inputs: &'a InputConfig,
    locator: &'a dyn ResourceLocator,
    loader: &'a dyn LayerLoader,
    // One load per country per run, failures included. Entries are dropped
    // once a country's last level has been processed.
    facilities: HashMap<String, Result<Rc<Vec<FacilityPoint>>, SourceError>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        inputs: &'a InputConfig,
        locator: &'a dyn ResourceLocator,
        loader: &'a dyn LayerLoader,
    ) -> Self {
        Self {
            inputs,
            locator,
            loader,
            facilities: HashMap::new(),
        }
    }

    /// Loads every boundary level from the boundaries dataset. Levels that
    /// fail to load are skipped; having none at all is fatal.
    pub fn load_boundaries(&self, columns: &ColumnConfig) -> Result<BoundaryStore> {
        info!("Loading subnational boundaries from {}", self.inputs.boundaries);
        let keyword = &self.inputs.boundary_resource_keyword;
        let resources = self
            .locator
            .list_resources(&self.inputs.boundaries)
            .context("Could not list boundary resources")?;

        let mut layers = Vec::new();
        for resource in resources {
            let Some(level) = boundary_level(&resource.name, keyword) else {
                continue;
            };
            match self.loader.load_layer(&resource, LayerKind::Polygons) {
                Ok(layer) => match layer.into_polygons() {
                    Some(features) => layers.push((level, features)),
                    None => error!("adm{}: {} is not a polygon layer, dropping it", level, resource.name),
                },
                Err(e) => error!("adm{}: {}", level, e),
            }
        }

        if layers.is_empty() {
            bail!(
                "No '{}' boundary layers could be loaded from {}",
                keyword,
                self.inputs.boundaries
            );
        }
        Ok(BoundaryStore::from_layers(layers, columns))
    }

    fn facilities_for(&mut self, iso: &str) -> Result<Rc<Vec<FacilityPoint>>, SourceError> {
        if let Some(cached) = self.facilities.get(iso) {
            return cached.clone();
        }

        let dataset = self.inputs.facility_dataset_for(iso);
        let loaded = self
            .locator
            .find_resource(
                &dataset,
                &self.inputs.facility_file_type,
                self.inputs.facility_keyword_for(iso),
            )
            .and_then(|resource| {
                let layer = self.loader.load_layer(&resource, LayerKind::Points)?;
                let found = layer.kind();
                let points = layer.into_points().ok_or(SourceError::LayerKindMismatch {
                    resource: resource.name.clone(),
                    expected: LayerKind::Points,
                    found,
                })?;
                // Only geometry is needed for counting
                Ok(Rc::new(
                    points
                        .into_iter()
                        .map(|p| FacilityPoint {
                            geometry: p.geometry,
                            attributes: Attributes::new(),
                        })
                        .collect::<Vec<_>>(),
                ))
            });

        self.facilities.insert(iso.to_string(), loaded.clone());
        loaded
    }

    #[cfg(test)]
    fn is_cached(&self, iso: &str) -> bool {
        self.facilities.contains_key(iso)
    }

    /// Counts one country's facilities per place at one level and writes
    /// the counts into the store.
    pub fn process_country(
        &mut self,
        store: &mut BoundaryStore,
        level: AdminLevel,
        iso: &str,
    ) -> CountryOutcome {
        if store.country_rows(level, iso).is_empty() {
            return CountryOutcome::Skipped(SourceError::NoMatchingCountryLevelRows {
                country: iso.to_string(),
                level,
            });
        }

        let points = match self.facilities_for(iso) {
            Ok(points) => points,
            Err(reason) => return CountryOutcome::Skipped(reason),
        };

        info!("{}: Processing health facilities at adm{}", iso, level);
        let counts = aggregate(&points, &store.country_rows(level, iso));
        store.record_counts(level, iso, &counts);

        CountryOutcome::Updated {
            places: counts.len(),
            facilities: counts.values().sum(),
        }
    }

    /// Processes every requested country at every level, level by level.
    pub fn summarize(&mut self, store: &mut BoundaryStore, countries: &[String]) -> RunReport {
        let mut report = RunReport::default();

        let mut last_level: HashMap<&str, AdminLevel> = HashMap::new();
        for level in store.levels() {
            for iso in countries {
                if !store.country_rows(level, iso).is_empty() {
                    last_level.insert(iso.as_str(), level);
                }
            }
        }

        for level in store.levels() {
            report.tracker.register_level(level);
            for iso in countries {
                let outcome = self.process_country(store, level, iso);
                match &outcome {
                    CountryOutcome::Updated { places, facilities } => {
                        info!("{}: {} facilities in {} places at adm{}", iso, facilities, places, level);
                        report.tracker.mark_updated(level, iso);
                    }
                    CountryOutcome::Skipped(SourceError::NoMatchingCountryLevelRows { .. }) => {
                        warn!("{}: no boundaries at adm{}", iso, level);
                    }
                    CountryOutcome::Skipped(reason) => error!("{}: {}", iso, reason),
                }
                report.outcomes.insert((level, iso.clone()), outcome);
                if last_level.get(iso.as_str()) == Some(&level) {
                    self.facilities.remove(iso.as_str());
                }
            }
            info!(
                "adm{}: updated {} of {} countries",
                level,
                report.tracker.updated_countries(level).len(),
                countries.len()
            );
        }

        report
    }
}

/// Resource names look like `polbnda_adm2_1m_ocha`; the digits after the
/// keyword are the level.
fn boundary_level(name: &str, keyword: &str) -> Option<AdminLevel> {
    let start = name.find(keyword)? + keyword.len();
    let digits: String = name[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub fn finalize_levels(store: &BoundaryStore, tracker: &UpdateTracker) -> Vec<FinalRows> {
    tracker
        .all_levels()
        .into_iter()
        .map(|level| finalize_level(level, store.rows(level), &tracker.updated_countries(level)))
        .collect()
}

/// Reads the published table and merges this run's counts into it.
pub fn merge_with_published(
    store: &dyn PublishedStore,
    dataset: &str,
    finalized: &[FinalRows],
) -> Result<PublishedTable> {
    let published = store
        .read_published_table(dataset)
        .with_context(|| format!("Could not read published dataset {}", dataset))?;
    Ok(merge_into_published(published, finalized))
}

/// Merges and writes back the published table. Returns `None` without
/// touching the published dataset when nothing was updated.
pub fn publish(
    store: &dyn PublishedStore,
    dataset: &str,
    boundaries: &BoundaryStore,
    report: &RunReport,
) -> Result<Option<PublishedTable>> {
    if report.tracker.is_empty() {
        warn!("No country was updated, leaving {} as is", dataset);
        return Ok(None);
    }

    let finalized = finalize_levels(boundaries, &report.tracker);
    let merged = merge_with_published(store, dataset, &finalized)?;
    store
        .write_published_table(dataset, &merged)
        .map_err(|e| anyhow!("Could not update resource in {}: {:#}", dataset, e))?;
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundaries::tests::square;
    use crate::catalog::ResourceDescriptor;
    use crate::config::AppConfig;
    use crate::types::{Attributes, Layer, PolygonFeature};
    use geo::Point;
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;

    /// In-memory catalog: datasets of named resources, each resource a ready layer.
    #[derive(Default)]
    struct FakeCatalog {
        datasets: HashMap<String, Vec<ResourceDescriptor>>,
        layers: HashMap<String, Layer>,
        loads: Cell<usize>,
        published: RefCell<Option<PublishedTable>>,
        fail_writes: bool,
    }

    impl FakeCatalog {
        fn add(&mut self, dataset: &str, name: &str, file_type: &str, layer: Option<Layer>) {
            self.datasets
                .entry(dataset.to_string())
                .or_default()
                .push(ResourceDescriptor {
                    dataset: dataset.to_string(),
                    name: name.to_string(),
                    file_type: file_type.to_string(),
                    location: PathBuf::from(name),
                });
            if let Some(layer) = layer {
                self.layers.insert(name.to_string(), layer);
            }
        }
    }

    impl ResourceLocator for FakeCatalog {
        fn list_resources(&self, dataset_name: &str) -> Result<Vec<ResourceDescriptor>, SourceError> {
            self.datasets
                .get(dataset_name)
                .cloned()
                .ok_or_else(|| SourceError::DatasetNotFound {
                    dataset: dataset_name.to_string(),
                })
        }
    }

    impl LayerLoader for FakeCatalog {
        fn load_layer(&self, resource: &ResourceDescriptor, kind: LayerKind) -> Result<Layer, SourceError> {
            self.loads.set(self.loads.get() + 1);
            let layer = self.layers.get(&resource.name).cloned().ok_or_else(|| {
                SourceError::DownloadFailed {
                    resource: resource.name.clone(),
                    reason: "404".to_string(),
                }
            })?;
            if layer.kind() != kind {
                return Err(SourceError::LayerKindMismatch {
                    resource: resource.name.clone(),
                    expected: kind,
                    found: layer.kind(),
                });
            }
            Ok(layer)
        }
    }

    impl PublishedStore for FakeCatalog {
        fn read_published_table(&self, dataset_name: &str) -> Result<PublishedTable> {
            self.published
                .borrow()
                .clone()
                .ok_or_else(|| anyhow!("no dataset {}", dataset_name))
        }

        fn write_published_table(&self, _dataset_name: &str, table: &PublishedTable) -> Result<()> {
            if self.fail_writes {
                bail!("upload rejected");
            }
            *self.published.borrow_mut() = Some(table.clone());
            Ok(())
        }
    }

    fn config() -> AppConfig {
        AppConfig::from_toml(
            r#"
            [catalog]
            root = "unused"

            [inputs]
            boundaries = "boundaries"
            dataset = "published"
            "#,
        )
        .unwrap()
    }

    fn boundary(level: AdminLevel, iso: &str, pcode: &str, x0: f64) -> PolygonFeature {
        let mut attributes = Attributes::new();
        attributes.insert("alpha_3".to_string(), iso.to_string());
        attributes.insert(format!("ADM{level}_PCODE"), pcode.to_string());
        attributes.insert(format!("ADM{level}_REF"), pcode.to_lowercase());
        PolygonFeature {
            geometry: square(x0, 0.0, 1.0),
            attributes,
        }
    }

    fn points(coords: &[(f64, f64)]) -> Layer {
        Layer::Points(
            coords
                .iter()
                .map(|&(x, y)| crate::types::FacilityPoint {
                    geometry: Point::new(x, y),
                    attributes: Attributes::new(),
                })
                .collect(),
        )
    }

    /// COL has two provinces at adm1 and one district at adm2; XYZ has no
    /// facility dataset at all.
    fn catalog() -> FakeCatalog {
        let mut catalog = FakeCatalog::default();
        catalog.add(
            "boundaries",
            "polbnda_adm1_1m_ocha",
            "shp",
            Some(Layer::Polygons(vec![
                boundary(1, "COL", "CO01", 0.0),
                boundary(1, "COL", "CO02", 1.0),
                boundary(1, "XYZ", "XY01", 10.0),
            ])),
        );
        catalog.add(
            "boundaries",
            "polbnda_adm2_1m_ocha",
            "shp",
            Some(Layer::Polygons(vec![boundary(2, "COL", "CO0101", 0.0)])),
        );
        catalog.add("boundaries", "readme", "txt", None);
        catalog.add(
            "hotosm_col_health_facilities",
            "hotosm_col_health_facilities_points_shp.zip",
            "shp",
            Some(points(&[(0.2, 0.2), (0.5, 0.5), (0.7, 0.9)])),
        );
        let csv = "alpha_3,ADM_LEVEL,ADM_PCODE,ADM_REF,Health_Facilities\n\
                   XYZ,1,XY01,old,5\n\
                   COL,1,CO01,co01,1\n";
        *catalog.published.borrow_mut() =
            Some(PublishedTable::from_csv(csv.as_bytes(), &ColumnConfig::default()).unwrap());
        catalog
    }

    fn run(catalog: &FakeCatalog, countries: &[&str]) -> (BoundaryStore, RunReport) {
        let config = config();
        let mut pipeline = Pipeline::new(&config.inputs, catalog, catalog);
        let mut store = pipeline.load_boundaries(&config.columns).unwrap();
        let countries: Vec<String> = countries.iter().map(|c| c.to_string()).collect();
        let report = pipeline.summarize(&mut store, &countries);
        (store, report)
    }

    #[test]
    fn parses_boundary_levels_from_names() {
        assert_eq!(boundary_level("polbnda_adm1_1m_ocha", "polbnda_adm"), Some(1));
        assert_eq!(boundary_level("wld_polbnda_adm12.shp", "polbnda_adm"), Some(12));
        assert_eq!(boundary_level("polbnda_admX", "polbnda_adm"), None);
        assert_eq!(boundary_level("polbndl_adm1", "polbnda_adm"), None);
    }

    #[test]
    fn counts_and_defaults_for_processed_country() {
        let catalog = catalog();
        let (store, report) = run(&catalog, &["COL"]);

        assert_eq!(
            report.outcome(1, "COL"),
            Some(&CountryOutcome::Updated {
                places: 1,
                facilities: 3
            })
        );
        assert_eq!(report.tracker.updated_countries(1).len(), 1);

        let finalized = finalize_levels(&store, &report.tracker);
        let level1: Vec<_> = finalized[0]
            .rows
            .iter()
            .map(|r| (r.place_code.as_str(), r.health_facility_count))
            .collect();
        assert_eq!(level1, vec![("CO01", 3), ("CO02", 0)]);
        assert_eq!(finalized[1].rows[0].health_facility_count, 3);
    }

    #[test]
    fn missing_dataset_skips_country_and_keeps_published_rows() {
        let catalog = catalog();
        let (store, report) = run(&catalog, &["COL", "XYZ"]);

        assert_eq!(
            report.outcome(1, "XYZ"),
            Some(&CountryOutcome::Skipped(SourceError::DatasetNotFound {
                dataset: "hotosm_xyz_health_facilities".to_string()
            }))
        );
        assert!(!report.tracker.is_updated(1, "XYZ"));
        assert_eq!(
            report.outcome(2, "XYZ"),
            Some(&CountryOutcome::Skipped(SourceError::NoMatchingCountryLevelRows {
                country: "XYZ".to_string(),
                level: 2
            }))
        );
        assert_eq!(report.skipped().count(), 2);

        let merged = publish(&catalog, "published", &store, &report).unwrap().unwrap();
        let xyz = merged.rows.iter().find(|r| r.key.country_code == "XYZ").unwrap();
        assert_eq!(xyz.fields[4], "5");
        assert_eq!(xyz.fields[3], "old");
        assert_eq!(catalog.published.borrow().as_ref(), Some(&merged));
        assert_eq!(merged.rows.len(), 4);
    }

    #[test]
    fn facility_layer_is_loaded_once_per_country() {
        let catalog = catalog();
        let before = catalog.loads.get();
        let (_, report) = run(&catalog, &["COL"]);

        // Two boundary layers plus one facility layer
        assert_eq!(catalog.loads.get() - before, 3);
        assert!(report.tracker.is_updated(1, "COL"));
        assert!(report.tracker.is_updated(2, "COL"));
    }

    /// Hands back polygons whatever kind was asked for.
    struct AlwaysPolygons;

    impl LayerLoader for AlwaysPolygons {
        fn load_layer(&self, _resource: &ResourceDescriptor, _kind: LayerKind) -> Result<Layer, SourceError> {
            Ok(Layer::Polygons(vec![boundary(1, "COL", "CO01", 0.0)]))
        }
    }

    #[test]
    fn loader_returning_wrong_kind_is_not_an_update() {
        let catalog = catalog();
        let config = config();
        let mut store = Pipeline::new(&config.inputs, &catalog, &catalog)
            .load_boundaries(&config.columns)
            .unwrap();

        let mut pipeline = Pipeline::new(&config.inputs, &catalog, &AlwaysPolygons);
        let report = pipeline.summarize(&mut store, &["COL".to_string()]);

        assert_eq!(
            report.outcome(1, "COL"),
            Some(&CountryOutcome::Skipped(SourceError::LayerKindMismatch {
                resource: "hotosm_col_health_facilities_points_shp.zip".to_string(),
                expected: LayerKind::Points,
                found: LayerKind::Polygons,
            }))
        );
        assert!(report.tracker.is_empty());
        assert!(finalize_levels(&store, &report.tracker).iter().all(|l| l.rows.is_empty()));
        assert!(store.rows(1).iter().all(|r| r.health_facility_count.is_none()));
    }

    #[test]
    fn facility_cache_is_released_after_last_level() {
        let catalog = catalog();
        let config = config();
        let mut pipeline = Pipeline::new(&config.inputs, &catalog, &catalog);
        let mut store = pipeline.load_boundaries(&config.columns).unwrap();

        pipeline.process_country(&mut store, 1, "COL");
        assert!(pipeline.is_cached("COL"));

        let report = pipeline.summarize(&mut store, &["COL".to_string(), "XYZ".to_string()]);
        assert!(report.tracker.is_updated(2, "COL"));
        assert!(!pipeline.is_cached("COL"));
        assert!(!pipeline.is_cached("XYZ"));
    }

    #[test]
    fn wrong_geometry_family_is_a_skip() {
        let mut catalog = catalog();
        catalog.add(
            "hotosm_abc_health_facilities",
            "hotosm_abc_health_facilities_points_shp.zip",
            "shp",
            Some(Layer::Polygons(Vec::new())),
        );
        catalog.add(
            "boundaries",
            "polbnda_adm3",
            "shp",
            Some(Layer::Polygons(vec![boundary(3, "ABC", "AB001", 0.0)])),
        );

        let (_, report) = run(&catalog, &["ABC"]);

        assert!(matches!(
            report.outcome(3, "ABC"),
            Some(CountryOutcome::Skipped(SourceError::LayerKindMismatch { .. }))
        ));
        assert!(report.tracker.is_empty());
    }

    #[test]
    fn nothing_updated_publishes_nothing() {
        let catalog = catalog();
        let (store, report) = run(&catalog, &["XYZ"]);

        let before = catalog.published.borrow().clone();
        assert!(publish(&catalog, "published", &store, &report).unwrap().is_none());
        assert_eq!(*catalog.published.borrow(), before);
    }

    #[test]
    fn failed_write_is_reported_and_store_survives() {
        let mut catalog = catalog();
        catalog.fail_writes = true;
        let (store, report) = run(&catalog, &["COL"]);

        let err = publish(&catalog, "published", &store, &report).unwrap_err();
        assert!(err.to_string().contains("upload rejected"));
        assert_eq!(store.rows(1)[0].health_facility_count, Some(3));
    }

    #[test]
    fn missing_boundaries_dataset_is_fatal() {
        let catalog = FakeCatalog::default();
        let config = config();
        let pipeline = Pipeline::new(&config.inputs, &catalog, &catalog);
        assert!(pipeline.load_boundaries(&config.columns).is_err());
    }
}
