use geo::{MultiPolygon, Point};
use std::collections::BTreeMap;
use std::fmt;

/// Tier in a country's subdivision hierarchy (1 = province, 2 = district, ...).
pub type AdminLevel = u8;

/// Non-geometry feature attributes, stringified.
pub type Attributes = BTreeMap<String, String>;

/// Facility count per place code for one (country, level) pair.
/// An absent place code means zero facilities.
pub type JoinResult = BTreeMap<String, u64>;

#[derive(Debug, Clone)]
pub struct BoundaryRow {
    pub country_code: String,
    pub admin_level: AdminLevel,
    pub place_code: String,
    pub geometry: MultiPolygon<f64>,
    pub health_facility_count: Option<u64>,
    // Everything else from the boundary feature (place names, parent codes, ...)
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
pub struct FacilityPoint {
    pub geometry: Point<f64>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
pub struct PolygonFeature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Points,
    Polygons,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Points => write!(f, "points"),
            LayerKind::Polygons => write!(f, "polygons"),
        }
    }
}

/// A parsed vector layer. The geometry family is decided once, when the file
/// is read, so callers never have to probe features for their shape.
#[derive(Debug, Clone)]
pub enum Layer {
    Points(Vec<FacilityPoint>),
    Polygons(Vec<PolygonFeature>),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Points(_) => LayerKind::Points,
            Layer::Polygons(_) => LayerKind::Polygons,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Layer::Points(p) => p.len(),
            Layer::Polygons(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_points(self) -> Option<Vec<FacilityPoint>> {
        match self {
            Layer::Points(p) => Some(p),
            Layer::Polygons(_) => None,
        }
    }

    pub fn into_polygons(self) -> Option<Vec<PolygonFeature>> {
        match self {
            Layer::Polygons(p) => Some(p),
            Layer::Points(_) => None,
        }
    }
}
