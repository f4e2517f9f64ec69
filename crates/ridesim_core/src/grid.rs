//! Coarse spatial index of vehicle positions.
//!
//! A fixed 100x100 bucket grid over the road-network bounding box. The
//! matching thread owns the grid exclusively: it is cleared at the top of
//! every round and refilled from that round's vehicle snapshots, so the
//! grid stores only ids plus the position they were inserted at.

use crate::roadnet::haversine;
use crate::types::{BoundingBox, Point, TripId};

/// Buckets per axis.
pub const GRID_DIM: usize = 100;

pub struct SpatialGrid {
    origin: Point,
    lng_step: f64,
    lat_step: f64,
    buckets: Vec<Vec<TripId>>,
}

impl SpatialGrid {
    pub fn new(bbox: BoundingBox) -> Self {
        // Degenerate extents (single node, straight-line networks) still
        // need a nonzero step to keep bucket arithmetic finite.
        let lng_span = (bbox.upper_right.lng - bbox.lower_left.lng).max(1e-9);
        let lat_span = (bbox.upper_right.lat - bbox.lower_left.lat).max(1e-9);
        Self {
            origin: bbox.lower_left,
            lng_step: lng_span / GRID_DIM as f64,
            lat_step: lat_span / GRID_DIM as f64,
            buckets: vec![Vec::new(); GRID_DIM * GRID_DIM],
        }
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    fn bucket_index(&self, pos: Point) -> usize {
        let col = ((pos.lng - self.origin.lng) / self.lng_step) as isize;
        let row = ((pos.lat - self.origin.lat) / self.lat_step) as isize;
        let col = col.clamp(0, GRID_DIM as isize - 1) as usize;
        let row = row.clamp(0, GRID_DIM as isize - 1) as usize;
        row * GRID_DIM + col
    }

    fn bucket_center(&self, index: usize) -> Point {
        let row = index / GRID_DIM;
        let col = index % GRID_DIM;
        Point {
            lng: self.origin.lng + (col as f64 + 0.5) * self.lng_step,
            lat: self.origin.lat + (row as f64 + 0.5) * self.lat_step,
        }
    }

    /// Insert a vehicle at the coordinates of its last-visited node.
    pub fn insert(&mut self, id: TripId, pos: Point) {
        let idx = self.bucket_index(pos);
        self.buckets[idx].push(id);
    }

    /// Ids of all vehicles in buckets whose center lies within
    /// `radius_m` meters of `origin`.
    pub fn within(&self, radius_m: f64, origin: Point) -> Vec<TripId> {
        let mut out = Vec::new();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            if haversine(self.bucket_center(idx), origin) <= radius_m {
                out.extend_from_slice(bucket);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox {
            lower_left: Point { lng: 13.0, lat: 52.0 },
            upper_right: Point { lng: 14.0, lat: 53.0 },
        }
    }

    #[test]
    fn within_returns_nearby_vehicles_only() {
        let mut grid = SpatialGrid::new(bbox());
        let near = Point { lng: 13.105, lat: 52.105 };
        let far = Point { lng: 13.9, lat: 52.9 };
        grid.insert(1, near);
        grid.insert(2, far);

        let found = grid.within(5_000.0, near);
        assert!(found.contains(&1));
        assert!(!found.contains(&2));

        // A planet-sized radius finds everything.
        let all = grid.within(1e9, near);
        assert!(all.contains(&1) && all.contains(&2));
    }

    #[test]
    fn clear_empties_every_bucket() {
        let mut grid = SpatialGrid::new(bbox());
        grid.insert(1, Point { lng: 13.2, lat: 52.2 });
        grid.clear();
        assert!(grid.within(1e9, Point { lng: 13.2, lat: 52.2 }).is_empty());
    }

    #[test]
    fn out_of_box_positions_clamp_to_the_border_bucket() {
        let mut grid = SpatialGrid::new(bbox());
        let outside = Point { lng: 12.0, lat: 51.0 };
        grid.insert(3, outside);
        let found = grid.within(500_000.0, Point { lng: 13.0, lat: 52.0 });
        assert!(found.contains(&3));
    }
}
