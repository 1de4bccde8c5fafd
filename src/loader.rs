use crate::catalog::{LayerLoader, ResourceDescriptor};
use crate::error::SourceError;
use crate::types::{Attributes, FacilityPoint, Layer, LayerKind, PolygonFeature};
use geo::{MultiPolygon, Point};
use geojson::GeoJson;
use serde_json::Value as JsonValue;
use shapefile::dbase::FieldValue;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Loads catalog resources from disk: zipped resources are unpacked into a
/// scratch directory, then the first shapefile (or GeoJSON) inside is parsed.
#[derive(Debug, Clone, Default)]
pub struct FileLayerLoader {
    scratch_dir: Option<PathBuf>,
}

impl FileLayerLoader {
    pub fn new(scratch_dir: Option<PathBuf>) -> Self {
        Self { scratch_dir }
    }

    fn scratch(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("health-facilities-");
        match &self.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

impl LayerLoader for FileLayerLoader {
    fn load_layer(&self, resource: &ResourceDescriptor, kind: LayerKind) -> Result<Layer, SourceError> {
        let path = &resource.location;
        if !path.is_file() {
            return Err(SourceError::DownloadFailed {
                resource: resource.name.clone(),
                reason: format!("{:?} does not exist", path),
            });
        }

        let unreadable = |reason: String| SourceError::LayerUnreadable {
            resource: resource.name.clone(),
            reason,
        };

        // The scratch directory is kept alive until parsing is done
        let (_scratch, layer_path) = if extension(path).as_deref() == Some("zip") {
            let dir = self.scratch().map_err(|e| SourceError::DownloadFailed {
                resource: resource.name.clone(),
                reason: e.to_string(),
            })?;
            extract_archive(path, dir.path()).map_err(|reason| SourceError::ArchiveCorrupt {
                resource: resource.name.clone(),
                reason,
            })?;
            let found = find_layer_file(dir.path())
                .ok_or_else(|| unreadable("no layer file in archive".to_string()))?;
            (Some(dir), found)
        } else {
            (None, path.clone())
        };

        debug!("Reading {} layer from {:?}", kind, layer_path);
        let layer = match extension(&layer_path).as_deref() {
            Some("shp") => read_shapefile(&layer_path, kind),
            Some("geojson") | Some("json") => read_geojson(&layer_path, kind),
            other => Err(format!("unsupported layer format: {:?}", other)),
        }
        .map_err(unreadable)?;

        if layer.kind() != kind {
            return Err(SourceError::LayerKindMismatch {
                resource: resource.name.clone(),
                expected: kind,
                found: layer.kind(),
            });
        }

        info!("Loaded {} {} from {}", layer.len(), kind, resource.name);
        Ok(layer)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
}

fn extract_archive(archive: &Path, into: &Path) -> Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    zip.extract(into).map_err(|e| e.to_string())
}

/// First shapefile under `dir` (recursive, sorted), else the first GeoJSON.
fn find_layer_file(dir: &Path) -> Option<PathBuf> {
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    for ext in ["shp", "geojson", "json"] {
        let pattern = format!("{}/**/*.{}", base, ext);
        let mut found: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().collect(),
            Err(_) => continue,
        };
        found.sort();
        if let Some(first) = found.into_iter().next() {
            return Some(first);
        }
    }
    None
}

/// Collects features of one geometry family: whichever family the first
/// feature has. Features of the other family are counted and dropped.
struct LayerBuilder {
    kind: Option<LayerKind>,
    points: Vec<FacilityPoint>,
    polygons: Vec<PolygonFeature>,
    dropped: usize,
}

impl LayerBuilder {
    fn new() -> Self {
        Self {
            kind: None,
            points: Vec::new(),
            polygons: Vec::new(),
            dropped: 0,
        }
    }

    fn accepts(&mut self, kind: LayerKind) -> bool {
        match self.kind {
            None => {
                self.kind = Some(kind);
                true
            }
            Some(k) if k == kind => true,
            Some(_) => {
                self.dropped += 1;
                false
            }
        }
    }

    fn push_points(&mut self, points: impl IntoIterator<Item = Point<f64>>, attributes: &Attributes) {
        if self.accepts(LayerKind::Points) {
            for geometry in points {
                self.points.push(FacilityPoint {
                    geometry,
                    attributes: attributes.clone(),
                });
            }
        }
    }

    fn push_polygon(&mut self, geometry: MultiPolygon<f64>, attributes: Attributes) {
        if self.accepts(LayerKind::Polygons) {
            self.polygons.push(PolygonFeature { geometry, attributes });
        }
    }

    /// An empty file takes the kind the caller asked for.
    fn finish(self, default_kind: LayerKind) -> Layer {
        if self.dropped > 0 {
            debug!("Dropped {} features of a different geometry type", self.dropped);
        }
        match self.kind.unwrap_or(default_kind) {
            LayerKind::Points => Layer::Points(self.points),
            LayerKind::Polygons => Layer::Polygons(self.polygons),
        }
    }
}

fn read_shapefile(path: &Path, default_kind: LayerKind) -> Result<Layer, String> {
    let mut reader = shapefile::Reader::from_path(path).map_err(|e| e.to_string())?;
    let mut builder = LayerBuilder::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(|e| e.to_string())?;

        let mut attributes = Attributes::new();
        for (name, value) in record {
            if let Some(value) = field_to_string(value) {
                attributes.insert(name, value);
            }
        }

        match shape {
            shapefile::Shape::Point(p) => builder.push_points([Point::new(p.x, p.y)], &attributes),
            shapefile::Shape::PointM(p) => builder.push_points([Point::new(p.x, p.y)], &attributes),
            shapefile::Shape::PointZ(p) => builder.push_points([Point::new(p.x, p.y)], &attributes),
            shapefile::Shape::Multipoint(mp) => builder.push_points(
                mp.points().iter().map(|p| Point::new(p.x, p.y)),
                &attributes,
            ),
            shapefile::Shape::Polygon(polygon) => {
                let geometry: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| format!("Failed to convert polygon: {:?}", e))?;
                builder.push_polygon(geometry, attributes);
            }
            shapefile::Shape::PolygonM(polygon) => {
                let geometry: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| format!("Failed to convert polygonM: {:?}", e))?;
                builder.push_polygon(geometry, attributes);
            }
            shapefile::Shape::PolygonZ(polygon) => {
                let geometry: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| format!("Failed to convert polygonZ: {:?}", e))?;
                builder.push_polygon(geometry, attributes);
            }
            _ => continue, // Lines, patches and null shapes
        }
    }

    Ok(builder.finish(default_kind))
}

fn field_to_string(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Character(s) => s,
        FieldValue::Memo(s) => Some(s),
        FieldValue::Numeric(n) => n.map(format_number),
        FieldValue::Double(n) => Some(format_number(n)),
        FieldValue::Float(n) => n.map(|n| format_number(n as f64)),
        FieldValue::Integer(n) => Some(n.to_string()),
        FieldValue::Logical(b) => b.map(|b| b.to_string()),
        _ => None,
    }
}

// dBase stores integer codes as numerics; print them without a trailing ".0"
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn read_geojson(path: &Path, default_kind: LayerKind) -> Result<Layer, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).map_err(|e| e.to_string())?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err("GeoJSON must be a FeatureCollection".to_string()),
    };

    let mut builder = LayerBuilder::new();

    for feature in collection.features {
        let mut attributes = Attributes::new();
        if let Some(props) = &feature.properties {
            for (name, value) in props {
                let value = match value {
                    JsonValue::Null => continue,
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                attributes.insert(name.clone(), value);
            }
        }

        let geometry: geo::Geometry<f64> = match feature.geometry {
            Some(geom) => geom
                .value
                .try_into()
                .map_err(|e| format!("Failed to convert geojson geometry: {:?}", e))?,
            None => continue,
        };

        match geometry {
            geo::Geometry::Point(p) => builder.push_points([p], &attributes),
            geo::Geometry::MultiPoint(mp) => builder.push_points(mp, &attributes),
            geo::Geometry::Polygon(p) => builder.push_polygon(MultiPolygon::new(vec![p]), attributes),
            geo::Geometry::MultiPolygon(mp) => builder.push_polygon(mp, attributes),
            _ => continue, // Skip lines
        }
    }

    Ok(builder.finish(default_kind))
}
