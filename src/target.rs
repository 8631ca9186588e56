//! Planar calibration targets.
//!
//! The target frame has its origin at the first corner (chessboard) or the
//! first tag center (AprilTag grid), x along the columns, y along the rows and
//! z normal to the board. All lengths are meters.

use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Chessboard,
    AprilGrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetGeometry {
    pub kind: TargetKind,
    /// Interior corner rows (chessboard) or tag rows (AprilTag grid).
    pub rows: usize,
    pub cols: usize,
    /// Square edge or tag edge length.
    pub square_size: f64,
    /// Gap between tags as a fraction of the tag size.
    pub tag_spacing: f64,
}

/// Axis-aligned extent of the physical board in the target plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetFootprint {
    pub min: Vector2<f64>,
    pub max: Vector2<f64>,
}

impl TargetFootprint {
    pub fn contains<T: RealField>(&self, x: &T, y: &T) -> bool {
        *x >= nalgebra::convert::<f64, T>(self.min.x)
            && *x <= nalgebra::convert::<f64, T>(self.max.x)
            && *y >= nalgebra::convert::<f64, T>(self.min.y)
            && *y <= nalgebra::convert::<f64, T>(self.max.y)
    }
}

impl TargetGeometry {
    pub fn chessboard(rows: usize, cols: usize, square_size: f64) -> Self {
        TargetGeometry {
            kind: TargetKind::Chessboard,
            rows,
            cols,
            square_size,
            tag_spacing: 0.0,
        }
    }

    pub fn april_grid(rows: usize, cols: usize, tag_size: f64, tag_spacing: f64) -> Self {
        TargetGeometry {
            kind: TargetKind::AprilGrid,
            rows,
            cols,
            square_size: tag_size,
            tag_spacing,
        }
    }

    /// Distance between neighbouring tag centers.
    pub fn tag_pitch(&self) -> f64 {
        self.square_size * (1.0 + self.tag_spacing)
    }

    /// Number of tags (AprilTag grid) or corners (chessboard).
    pub fn num_features(&self) -> usize {
        self.rows * self.cols
    }

    /// Center of tag `id`, numbered row-major from the origin.
    ///
    /// `cols` counts tag columns, so row `r` starts at id `r * cols`. A grid
    /// with 10 rows and 7 columns holds ids 0 to 69; there is no spare column
    /// at `cols + 1`.
    pub fn tag_center(&self, id: usize) -> Vector2<f64> {
        let pitch = self.tag_pitch();
        Vector2::new(
            (id % self.cols) as f64 * pitch,
            (id / self.cols) as f64 * pitch,
        )
    }

    /// Corners of tag `id` in detector order: (-,-), (+,-), (+,+), (-,+).
    pub fn tag_corners(&self, id: usize) -> [Vector3<f64>; 4] {
        let center = self.tag_center(id);
        let half = self.square_size / 2.0;
        [
            Vector3::new(center.x - half, center.y - half, 0.0),
            Vector3::new(center.x + half, center.y - half, 0.0),
            Vector3::new(center.x + half, center.y + half, 0.0),
            Vector3::new(center.x - half, center.y + half, 0.0),
        ]
    }

    /// All target points in detection order: chessboard corners row by row,
    /// or the four corners of every tag in id order.
    pub fn corner_positions(&self) -> Vec<Vector3<f64>> {
        match self.kind {
            TargetKind::Chessboard => (0..self.rows)
                .flat_map(|i| {
                    (0..self.cols).map(move |j| {
                        Vector3::new(
                            j as f64 * self.square_size,
                            i as f64 * self.square_size,
                            0.0,
                        )
                    })
                })
                .collect(),
            TargetKind::AprilGrid => (0..self.num_features())
                .flat_map(|id| self.tag_corners(id))
                .collect(),
        }
    }

    pub fn footprint(&self) -> TargetFootprint {
        match self.kind {
            // Interior corners are one square in from the board edge.
            TargetKind::Chessboard => TargetFootprint {
                min: Vector2::new(-self.square_size, -self.square_size),
                max: Vector2::new(
                    self.cols as f64 * self.square_size,
                    self.rows as f64 * self.square_size,
                ),
            },
            TargetKind::AprilGrid => {
                let half = self.square_size / 2.0;
                let pitch = self.tag_pitch();
                TargetFootprint {
                    min: Vector2::new(-half, -half),
                    max: Vector2::new(
                        (self.cols.saturating_sub(1)) as f64 * pitch + half,
                        (self.rows.saturating_sub(1)) as f64 * pitch + half,
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chessboard_corners_are_row_major() {
        let board = TargetGeometry::chessboard(3, 4, 0.1);
        let corners = board.corner_positions();
        assert_eq!(corners.len(), 12);
        assert_eq!(corners[1], Vector3::new(0.1, 0.0, 0.0));
        assert_relative_eq!(corners[4], Vector3::new(0.0, 0.1, 0.0), epsilon = 1e-12);
        assert_relative_eq!(corners[11], Vector3::new(0.3, 0.2, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_april_grid_layout() {
        let grid = TargetGeometry::april_grid(2, 3, 0.08, 0.25);
        assert_relative_eq!(grid.tag_pitch(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(grid.tag_center(4), Vector2::new(0.1, 0.1), epsilon = 1e-12);

        let corners = grid.corner_positions();
        assert_eq!(corners.len(), 24);
        assert_relative_eq!(corners[0], Vector3::new(-0.04, -0.04, 0.0), epsilon = 1e-12);
        assert_relative_eq!(corners[2], Vector3::new(0.04, 0.04, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_april_grid_rows_start_at_multiples_of_cols() {
        let grid = TargetGeometry::april_grid(10, 7, 0.08, 0.25);
        assert_eq!(grid.num_features(), 70);
        assert_relative_eq!(grid.tag_center(6), Vector2::new(0.6, 0.0), epsilon = 1e-12);
        assert_relative_eq!(grid.tag_center(7), Vector2::new(0.0, 0.1), epsilon = 1e-12);
        assert_relative_eq!(grid.tag_center(69), Vector2::new(0.6, 0.9), epsilon = 1e-12);
    }

    #[test]
    fn test_footprint_contains() {
        let board = TargetGeometry::chessboard(10, 7, 0.098);
        let footprint = board.footprint();
        assert!(footprint.contains(&0.3, &0.5));
        assert!(footprint.contains(&-0.05, &-0.05));
        assert!(!footprint.contains(&-0.2, &0.5));
        assert!(!footprint.contains(&0.3, &1.2));
    }
}
