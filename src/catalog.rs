//! Data catalog access.
//!
//! The pipeline only talks to the catalog through the traits below, so the
//! backing store can be swapped (or faked in tests). [`LocalCatalog`] serves
//! datasets from a directory tree: one sub-directory per dataset, one file
//! per resource, with an optional `resources.toml` manifest.

use crate::config::ColumnConfig;
use crate::error::SourceError;
use crate::table::PublishedTable;
use crate::types::{Layer, LayerKind};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST: &str = "resources.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub dataset: String,
    pub name: String,
    pub file_type: String,
    pub location: PathBuf,
}

pub trait ResourceLocator {
    /// All resources of a dataset, in catalog order.
    fn list_resources(&self, dataset_name: &str) -> Result<Vec<ResourceDescriptor>, SourceError>;

    /// First resource of the dataset with the given file type whose name
    /// contains `keyword`.
    fn find_resource(
        &self,
        dataset_name: &str,
        file_type: &str,
        keyword: &str,
    ) -> Result<ResourceDescriptor, SourceError> {
        self.list_resources(dataset_name)?
            .into_iter()
            .find(|r| r.file_type.eq_ignore_ascii_case(file_type) && r.name.contains(keyword))
            .ok_or_else(|| SourceError::ResourceNotFound {
                dataset: dataset_name.to_string(),
                file_type: file_type.to_string(),
                keyword: keyword.to_string(),
            })
    }
}

pub trait LayerLoader {
    /// Fetches, unpacks and parses a resource. Fails with
    /// [`SourceError::LayerKindMismatch`] if the file holds the other geometry family.
    fn load_layer(&self, resource: &ResourceDescriptor, kind: LayerKind) -> Result<Layer, SourceError>;
}

pub trait PublishedStore {
    fn read_published_table(&self, dataset_name: &str) -> Result<PublishedTable>;
    fn write_published_table(&self, dataset_name: &str, table: &PublishedTable) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    resource: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    format: String,
    file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LocalCatalog {
    root: PathBuf,
    columns: ColumnConfig,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>, columns: ColumnConfig) -> Self {
        Self {
            root: root.into(),
            columns,
        }
    }

    fn dataset_dir(&self, dataset_name: &str) -> Result<PathBuf, SourceError> {
        let dir = self.root.join(dataset_name);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(SourceError::DatasetNotFound {
                dataset: dataset_name.to_string(),
            })
        }
    }

    fn published_resource(&self, dataset_name: &str) -> Result<ResourceDescriptor> {
        let resources = self.list_resources(dataset_name)?;
        resources
            .into_iter()
            .find(|r| r.file_type == "csv")
            .ok_or_else(|| anyhow!("Dataset '{}' has no csv resource", dataset_name))
    }
}

impl ResourceLocator for LocalCatalog {
    fn list_resources(&self, dataset_name: &str) -> Result<Vec<ResourceDescriptor>, SourceError> {
        let dir = self.dataset_dir(dataset_name)?;
        let unreadable = |reason: String| SourceError::DatasetNotFound {
            dataset: format!("{} ({})", dataset_name, reason),
        };

        let manifest_path = dir.join(MANIFEST);
        if manifest_path.is_file() {
            let content = fs::read_to_string(&manifest_path).map_err(|e| unreadable(e.to_string()))?;
            let manifest: Manifest = toml::from_str(&content).map_err(|e| unreadable(e.to_string()))?;
            return Ok(manifest
                .resource
                .into_iter()
                .map(|entry| ResourceDescriptor {
                    dataset: dataset_name.to_string(),
                    name: entry.name,
                    file_type: entry.format.to_lowercase(),
                    location: dir.join(entry.file),
                })
                .collect());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| unreadable(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        Ok(files
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                let file_type = infer_file_type(&name)?;
                Some(ResourceDescriptor {
                    dataset: dataset_name.to_string(),
                    name,
                    file_type,
                    location: path,
                })
            })
            .collect())
    }
}

impl PublishedStore for LocalCatalog {
    fn read_published_table(&self, dataset_name: &str) -> Result<PublishedTable> {
        let resource = self.published_resource(dataset_name)?;
        info!("Reading published table {:?}", resource.location);
        let file = File::open(&resource.location)
            .with_context(|| format!("Failed to open published table: {:?}", resource.location))?;
        PublishedTable::from_csv(BufReader::new(file), &self.columns)
            .with_context(|| format!("Failed to parse published table: {:?}", resource.location))
    }

    fn write_published_table(&self, dataset_name: &str, table: &PublishedTable) -> Result<()> {
        let resource = self.published_resource(dataset_name)?;
        let dir = resource
            .location
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        // Write beside the target, then swap it in
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        table.write_csv(tmp.as_file_mut())?;
        tmp.persist(&resource.location)
            .with_context(|| format!("Failed to replace {:?}", resource.location))?;

        info!("Published {} rows to {:?}", table.rows.len(), resource.location);
        Ok(())
    }
}

/// `x_shp.zip` is a zipped shapefile, `x_geojson.zip` zipped GeoJSON,
/// otherwise the extension decides.
fn infer_file_type(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if lower == MANIFEST {
        return None;
    }
    let (stem, ext) = lower.rsplit_once('.')?;
    if ext == "zip" {
        if let Some((_, inner)) = stem.rsplit_once('_') {
            if matches!(inner, "shp" | "geojson") {
                return Some(inner.to_string());
            }
        }
    }
    debug!("Resource {} has type {}", name, ext);
    Some(ext.to_string())
}
