use crate::types::AdminLevel;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub catalog: CatalogConfig,
    pub inputs: InputConfig,
    #[serde(default)]
    pub columns: ColumnConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub root: PathBuf,
    pub scratch_dir: Option<PathBuf>, // Defaults to the system temp dir
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub boundaries: String,
    #[serde(default = "default_boundary_keyword")]
    pub boundary_resource_keyword: String,
    pub dataset: String,
    #[serde(default = "default_facility_template")]
    pub facility_dataset_template: String,
    #[serde(default = "default_facility_file_type")]
    pub facility_file_type: String,
    #[serde(default = "default_facility_keyword")]
    pub facility_keyword: String,
    #[serde(default)]
    pub dataset_exceptions: HashMap<String, String>,
    #[serde(default)]
    pub resource_exceptions: HashMap<String, String>,
}

/// Column names of the published table and the per-level source fields of
/// the boundary layers. `{level}` is replaced by the admin level number.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ColumnConfig {
    pub country_code: String,
    pub admin_level: String,
    pub place_code: String,
    pub place_name: String,
    pub health_facilities: String,
    pub source_place_code: String,
    pub source_place_name: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            country_code: "alpha_3".to_string(),
            admin_level: "ADM_LEVEL".to_string(),
            place_code: "ADM_PCODE".to_string(),
            place_name: "ADM_REF".to_string(),
            health_facilities: "Health_Facilities".to_string(),
            source_place_code: "ADM{level}_PCODE".to_string(),
            source_place_name: "ADM{level}_REF".to_string(),
        }
    }
}

impl ColumnConfig {
    pub fn source_place_code_for(&self, level: AdminLevel) -> String {
        self.source_place_code.replace("{level}", &level.to_string())
    }

    pub fn source_place_name_for(&self, level: AdminLevel) -> String {
        self.source_place_name.replace("{level}", &level.to_string())
    }
}

fn default_boundary_keyword() -> String {
    "polbnda_adm".to_string()
}

fn default_facility_template() -> String {
    "hotosm_{iso}_health_facilities".to_string()
}

fn default_facility_file_type() -> String {
    "shp".to_string()
}

fn default_facility_keyword() -> String {
    "points".to_string()
}

impl InputConfig {
    /// Dataset holding the facility points for one country.
    pub fn facility_dataset_for(&self, iso: &str) -> String {
        match self.dataset_exceptions.get(iso) {
            Some(name) => name.clone(),
            None => self
                .facility_dataset_template
                .replace("{iso}", &iso.to_lowercase()),
        }
    }

    pub fn facility_keyword_for(&self, iso: &str) -> &str {
        self.resource_exceptions
            .get(iso)
            .map(String::as_str)
            .unwrap_or(&self.facility_keyword)
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
