//! Spatial grid for progressively loading worksites around a point

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::models::{BoundingBox, LatLng};

/// One cell of a [`BoundedGrid`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
    pub bounds: BoundingBox,
}

/// Bounding box split into `divisions x divisions` cells.
///
/// Row 0 is the southern edge, column 0 the western edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundedGrid {
    bounds: BoundingBox,
    divisions: u32,
}

impl BoundedGrid {
    #[must_use]
    pub fn new(bounds: BoundingBox, divisions: u32) -> Self {
        Self {
            bounds,
            divisions: divisions.max(1),
        }
    }

    #[must_use]
    pub const fn divisions(&self) -> u32 {
        self.divisions
    }

    #[must_use]
    pub fn cell(&self, row: u32, col: u32) -> GridCell {
        let cell_height = self.bounds.height() / f64::from(self.divisions);
        let cell_width = self.bounds.width() / f64::from(self.divisions);
        let south = self.bounds.south + cell_height * f64::from(row);
        let west = self.bounds.west + cell_width * f64::from(col);
        GridCell {
            row,
            col,
            bounds: BoundingBox {
                south,
                west,
                north: south + cell_height,
                east: west + cell_width,
            },
        }
    }

    /// Cell coordinates containing `point`, clamped to the grid
    #[must_use]
    pub fn locate(&self, point: LatLng) -> (u32, u32) {
        let last = self.divisions - 1;
        let index = |offset: f64, extent: f64| {
            if extent <= 0.0 {
                return 0;
            }
            let scaled = (offset / extent * f64::from(self.divisions)).floor();
            scaled.clamp(0.0, f64::from(last)) as u32
        };
        (
            index(point.latitude - self.bounds.south, self.bounds.height()),
            index(point.longitude - self.bounds.west, self.bounds.width()),
        )
    }

    /// Every cell ordered outward from the cell containing `center`.
    ///
    /// Cells sort by Euclidean distance in cell coordinates. Equal distances
    /// break by quadrant (north-east, north-west, south-west, south-east),
    /// so the scan spirals outward.
    #[must_use]
    pub fn cells_nearest_first(&self, center: LatLng) -> Vec<GridCell> {
        let (center_row, center_col) = self.locate(center);
        let mut cells: Vec<(i64, u8, GridCell)> = (0..self.divisions)
            .flat_map(|row| (0..self.divisions).map(move |col| (row, col)))
            .map(|(row, col)| {
                let d_row = i64::from(row) - i64::from(center_row);
                let d_col = i64::from(col) - i64::from(center_col);
                (
                    d_row * d_row + d_col * d_col,
                    quadrant(d_row, d_col),
                    self.cell(row, col),
                )
            })
            .collect();
        cells.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.row.cmp(&b.2.row))
                .then(a.2.col.cmp(&b.2.col))
        });
        cells.into_iter().map(|(_, _, cell)| cell).collect()
    }
}

const fn quadrant(d_row: i64, d_col: i64) -> u8 {
    match (d_row >= 0, d_col >= 0) {
        (true, true) => 0,
        (true, false) => 1,
        (false, false) => 2,
        (false, true) => 3,
    }
}
