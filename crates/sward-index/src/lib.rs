//! Toroidal bucket-grid arithmetic for locating plants on a square plot.
//!
//! The plot is a torus: both axes wrap, so every bucket has a full
//! neighborhood and distances are measured along the shorter way around.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted when constructing grid geometry.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Configuration values that cannot describe a usable grid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Bucket coordinate on the plot grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Column, in `0..width`.
    pub x: u32,
    /// Row, in `0..height`.
    pub y: u32,
}

/// Flattened row-major bucket index (`y * width + x`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIndex(pub u32);

impl CellIndex {
    /// Index as a `usize` for slot lookups.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Validated toroidal grid geometry for a square plot of `side_m` metres.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorusGrid {
    side_m: f64,
    width: u32,
    height: u32,
    cell_x_m: f64,
    cell_y_m: f64,
}

impl TorusGrid {
    /// Build a grid of `width x height` buckets over a `side_m` metre plot.
    pub fn new(side_m: f64, width: u32, height: u32) -> Result<Self, IndexError> {
        if !side_m.is_finite() || side_m <= 0.0 {
            return Err(IndexError::InvalidConfig("side_m must be positive and finite"));
        }
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig("grid dimensions must be non-zero"));
        }
        Ok(Self {
            side_m,
            width,
            height,
            cell_x_m: side_m / f64::from(width),
            cell_y_m: side_m / f64::from(height),
        })
    }

    /// Plot edge length in metres.
    #[must_use]
    pub const fn side_m(&self) -> f64 {
        self.side_m
    }

    /// Buckets along the x axis.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Buckets along the y axis.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total bucket count.
    #[must_use]
    pub const fn bucket_count(&self) -> u32 {
        self.width * self.height
    }

    /// Bucket edge length along x, in metres.
    #[must_use]
    pub const fn cell_x_m(&self) -> f64 {
        self.cell_x_m
    }

    /// Bucket edge length along y, in metres.
    #[must_use]
    pub const fn cell_y_m(&self) -> f64 {
        self.cell_y_m
    }

    /// Map a continuous coordinate to its bucket, wrapping onto the torus.
    ///
    /// Coordinates are divided by the bucket edge, rounded half away from
    /// zero, then folded into range with Euclidean modulo, so out-of-range
    /// inputs land on the bucket they would occupy after wrapping.
    #[must_use]
    pub fn cell_of(&self, x_m: f64, y_m: f64) -> Cell {
        let cx = (x_m / self.cell_x_m).round() as i64;
        let cy = (y_m / self.cell_y_m).round() as i64;
        Cell {
            x: cx.rem_euclid(i64::from(self.width)) as u32,
            y: cy.rem_euclid(i64::from(self.height)) as u32,
        }
    }

    /// Flatten a bucket coordinate to its row-major index.
    #[must_use]
    pub const fn index_of(&self, cell: Cell) -> CellIndex {
        CellIndex(cell.y * self.width + cell.x)
    }

    /// Recover the bucket coordinate from a row-major index.
    #[must_use]
    pub const fn cell_at(&self, index: CellIndex) -> Cell {
        Cell {
            x: index.0 % self.width,
            y: index.0 / self.width,
        }
    }

    /// Bucket index for a continuous coordinate.
    #[must_use]
    pub fn bucket_of(&self, x_m: f64, y_m: f64) -> CellIndex {
        self.index_of(self.cell_of(x_m, y_m))
    }

    /// Bucket a point occupies, truncating toward the bucket origin.
    ///
    /// Unlike [`cell_of`](Self::cell_of), which rounds to the nearest bucket
    /// centre, this treats each bucket as owning the half-open interval
    /// starting at its origin, so a point standing exactly on a bucket
    /// centre (`(i + 0.5) * cell`) occupies bucket `i`.
    #[must_use]
    pub fn occupant_cell(&self, x_m: f64, y_m: f64) -> Cell {
        let cx = (x_m / self.cell_x_m) as i64;
        let cy = (y_m / self.cell_y_m) as i64;
        Cell {
            x: cx.rem_euclid(i64::from(self.width)) as u32,
            y: cy.rem_euclid(i64::from(self.height)) as u32,
        }
    }

    /// Convert a detection distance to a whole number of buckets (truncating).
    #[must_use]
    pub fn span_cells(&self, distance_m: f64) -> u32 {
        (distance_m.max(0.0) / self.cell_x_m) as u32
    }

    /// The Chebyshev window of buckets within `radius_cells` of `center`.
    ///
    /// Scan order is row-major over offsets (`dy` outer from `-r`, `dx`
    /// inner from `-r`), each offset wrapped by Euclidean modulo. When the
    /// window spans an axis the whole axis is visited once, so no bucket
    /// ever appears twice.
    #[must_use]
    pub fn neighborhood(&self, center: Cell, radius_cells: u32) -> Vec<CellIndex> {
        let xs = Self::axis_window(center.x, radius_cells, self.width);
        let ys = Self::axis_window(center.y, radius_cells, self.height);
        let mut out = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                out.push(self.index_of(Cell { x, y }));
            }
        }
        out
    }

    fn axis_window(center: u32, radius: u32, extent: u32) -> Vec<u32> {
        let span = 2 * u64::from(radius) + 1;
        if span >= u64::from(extent) {
            return (0..extent).collect();
        }
        let r = i64::from(radius);
        (-r..=r)
            .map(|d| (i64::from(center) + d).rem_euclid(i64::from(extent)) as u32)
            .collect()
    }

    /// Shortest toroidal distance between two continuous points.
    #[must_use]
    pub fn wrapped_distance(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        let dx = (a.0 - b.0).abs();
        let dy = (a.1 - b.1).abs();
        let dx = dx.min(self.side_m - dx);
        let dy = dy.min(self.side_m - dy);
        (dx * dx + dy * dy).sqrt()
    }

    /// Fold a coordinate back into `[0, side)` after a single-step move.
    ///
    /// Movement never overshoots by more than one plot length, so one
    /// add or subtract suffices.
    #[must_use]
    pub fn wrap_coord(&self, x_m: f64) -> f64 {
        if x_m > self.side_m {
            x_m - self.side_m
        } else if x_m < 0.0 {
            x_m + self.side_m
        } else {
            x_m
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn grid() -> TorusGrid {
        TorusGrid::new(100.0, 10, 10).unwrap()
    }

    #[test]
    fn rejects_unusable_geometry() {
        assert!(TorusGrid::new(0.0, 10, 10).is_err());
        assert!(TorusGrid::new(f64::NAN, 10, 10).is_err());
        assert!(TorusGrid::new(100.0, 0, 10).is_err());
        assert!(TorusGrid::new(100.0, 10, 0).is_err());
    }

    #[test]
    fn cell_round_trips_through_index() {
        let grid = grid();
        for y in 0..grid.height() {
            for x in 0..grid.width() {
                let cell = Cell { x, y };
                assert_eq!(grid.cell_at(grid.index_of(cell)), cell);
            }
        }
    }

    #[test]
    fn cell_of_wraps_out_of_range_coordinates() {
        let grid = grid();
        // One plot length to the right lands on the same bucket.
        assert_eq!(grid.cell_of(23.0, 47.0), grid.cell_of(123.0, 47.0));
        assert_eq!(grid.cell_of(23.0, 47.0), grid.cell_of(23.0, -53.0));
        // Rounding: 14.9 / 10 rounds to bucket 1, 15.1 to bucket 2.
        assert_eq!(grid.cell_of(14.9, 0.0).x, 1);
        assert_eq!(grid.cell_of(15.1, 0.0).x, 2);
    }

    #[test]
    fn occupant_cell_owns_the_half_open_interval() {
        let grid = grid();
        // A point on a bucket centre occupies that bucket.
        assert_eq!(grid.occupant_cell(15.0, 25.0), Cell { x: 1, y: 2 });
        assert_eq!(grid.occupant_cell(19.9, 0.0).x, 1);
        assert_eq!(grid.occupant_cell(20.0, 0.0).x, 2);
        // The far edge folds back onto the first bucket.
        assert_eq!(grid.occupant_cell(100.0, 0.0).x, 0);
    }

    #[test]
    fn neighborhood_is_window_sized_and_unique() {
        let grid = grid();
        let cells = grid.neighborhood(Cell { x: 5, y: 5 }, 1);
        assert_eq!(cells.len(), 9);
        let unique: HashSet<_> = cells.iter().collect();
        assert_eq!(unique.len(), 9);
    }

    #[test]
    fn neighborhood_wraps_at_corners() {
        let grid = grid();
        let cells = grid.neighborhood(Cell { x: 0, y: 0 }, 1);
        assert_eq!(cells.len(), 9);
        let far_corner = grid.index_of(Cell { x: 9, y: 9 });
        assert!(cells.contains(&far_corner));
        // Offsets scan row-major from (-1, -1).
        assert_eq!(cells[0], far_corner);
    }

    #[test]
    fn oversized_neighborhood_covers_grid_once() {
        let grid = grid();
        let cells = grid.neighborhood(Cell { x: 3, y: 7 }, 20);
        assert_eq!(cells.len(), 100);
        let unique: HashSet<_> = cells.iter().collect();
        assert_eq!(unique.len(), 100);
    }

    #[test]
    fn wrapped_distance_takes_the_short_way_around() {
        let grid = grid();
        let d = grid.wrapped_distance((1.0, 1.0), (99.0, 99.0));
        assert!((d - 8.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(
            grid.wrapped_distance((1.0, 1.0), (99.0, 99.0)),
            grid.wrapped_distance((99.0, 99.0), (1.0, 1.0)),
        );
        // No two points are further apart than half the diagonal.
        let bound = 100.0 * 2.0_f64.sqrt() / 2.0;
        assert!(grid.wrapped_distance((0.0, 0.0), (50.0, 50.0)) <= bound);
    }

    #[test]
    fn span_cells_truncates() {
        let grid = grid();
        assert_eq!(grid.span_cells(10.0), 1);
        assert_eq!(grid.span_cells(9.9), 0);
        assert_eq!(grid.span_cells(25.0), 2);
        assert_eq!(grid.span_cells(-3.0), 0);
    }

    #[test]
    fn wrap_coord_folds_one_step() {
        let grid = grid();
        assert_eq!(grid.wrap_coord(103.5), 3.5);
        assert_eq!(grid.wrap_coord(-4.0), 96.0);
        assert_eq!(grid.wrap_coord(42.0), 42.0);
    }
}
