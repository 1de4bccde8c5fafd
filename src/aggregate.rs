use crate::types::{BoundaryRow, FacilityPoint, JoinResult};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::intersects::Intersects;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};

// Envelope of one boundary row, pointing back into the input slice
struct BoundaryEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for BoundaryEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Counts the facility points falling in each boundary polygon.
///
/// A point on a polygon's edge or vertex belongs to that polygon, so a point
/// inside several (overlapping) polygons or on a shared edge counts toward
/// each of them. Places that contain no point are absent from the result.
pub fn aggregate(points: &[FacilityPoint], boundaries: &[&BoundaryRow]) -> JoinResult {
    if points.is_empty() || boundaries.is_empty() {
        return JoinResult::new();
    }

    let envelopes: Vec<BoundaryEnvelope> = boundaries
        .iter()
        .enumerate()
        .filter_map(|(index, row)| {
            // Empty geometries have no extent and can contain nothing
            let rect = row.geometry.bounding_rect()?;
            Some(BoundaryEnvelope {
                index,
                aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            })
        })
        .collect();
    let tree = RTree::bulk_load(envelopes);

    points
        .par_iter()
        .fold(JoinResult::new, |mut counts, point| {
            let envelope = AABB::from_point([point.geometry.x(), point.geometry.y()]);
            for candidate in tree.locate_in_envelope_intersecting(&envelope) {
                let row = boundaries[candidate.index];
                if row.geometry.intersects(&point.geometry) {
                    *counts.entry(row.place_code.clone()).or_insert(0) += 1;
                }
            }
            counts
        })
        .reduce(JoinResult::new, |mut left, right| {
            for (code, n) in right {
                *left.entry(code).or_insert(0) += n;
            }
            left
        })
}
