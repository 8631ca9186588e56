//! Point-to-plane residual for camera-to-range-sensor calibration.
//!
//! The pose being refined is camera-from-sensor. Each range point is mapped
//! into the camera frame by that pose and then into the target frame by the
//! known target-from-camera pose of its frame; its residual is the distance to
//! the target plane `z = 0`. Points whose target-frame `(x, y)` falls outside
//! the board footprint get a zero residual, so they are excluded from the cost
//! rather than penalized.

use super::PoseResidual;
use crate::correspondence::RangeScan;
use crate::geometry::{transform_with_parameters, Pose};
use crate::target::TargetFootprint;
use nalgebra::{DVector, Matrix3, RealField, Vector3};

#[derive(Debug, Clone)]
pub struct PointToPlaneResidual {
    target_from_camera: Pose,
    points: Vec<Vector3<f64>>,
    footprint: TargetFootprint,
}

impl PointToPlaneResidual {
    /// # Arguments
    ///
    /// * `camera_from_target` - Target pose solved in the camera for this frame.
    /// * `scan` - Range points in the sensor frame.
    /// * `footprint` - Physical extent of the board in the target plane.
    pub fn new(camera_from_target: &Pose, scan: &RangeScan, footprint: TargetFootprint) -> Self {
        PointToPlaneResidual {
            target_from_camera: camera_from_target.inverse(),
            points: scan.points().to_vec(),
            footprint,
        }
    }

    /// Number of points that land on the board under `camera_from_sensor`.
    pub fn points_on_target(&self, camera_from_sensor: &Pose) -> usize {
        let parameters = camera_from_sensor.to_parameters();
        self.points
            .iter()
            .filter(|p| {
                let target = self.to_target::<f64>(parameters.as_slice(), p);
                self.footprint.contains(&target.x, &target.y)
            })
            .count()
    }

    fn to_target<T: RealField>(&self, parameters: &[T], point: &Vector3<f64>) -> Vector3<T> {
        let point = point.map(nalgebra::convert::<f64, T>);
        let in_camera = transform_with_parameters(parameters, &point);
        let rotation: Matrix3<T> = self
            .target_from_camera
            .rotation()
            .matrix()
            .map(nalgebra::convert::<f64, T>);
        let translation: Vector3<T> = self
            .target_from_camera
            .translation()
            .map(nalgebra::convert::<f64, T>);
        rotation * in_camera + translation
    }
}

impl PoseResidual for PointToPlaneResidual {
    fn num_residuals(&self) -> usize {
        self.points.len()
    }

    fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>> {
        let mut residuals = DVector::zeros(self.points.len());
        for (i, point) in self.points.iter().enumerate() {
            let target = self.to_target(parameters, point);
            if self.footprint.contains(&target.x, &target.y) {
                residuals[i] = target.z.clone();
            }
        }
        Some(residuals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetGeometry;
    use nalgebra::Vector6;

    #[test]
    fn test_points_off_the_board_do_not_count() {
        let board = TargetGeometry::chessboard(4, 4, 0.1);
        let camera_from_target =
            Pose::from_quaternion([1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0]).unwrap();
        let scan = RangeScan::new(vec![
            // On the board plane.
            Vector3::new(0.2, 0.2, 1.0),
            // In front of the board by 5 cm.
            Vector3::new(0.1, 0.3, 0.95),
            // Far outside the footprint, 20 cm off the plane.
            Vector3::new(3.0, 0.2, 1.2),
        ]);
        let residual = PointToPlaneResidual::new(&camera_from_target, &scan, board.footprint());
        let identity = Vector6::<f64>::zeros();
        let r = residual.residuals(identity.as_slice()).unwrap();
        assert_eq!(r.len(), 3);
        assert!(r[0].abs() < 1e-12);
        assert!((r[1] + 0.05).abs() < 1e-12);
        assert_eq!(r[2], 0.0);
        assert_eq!(residual.points_on_target(&Pose::identity()), 2);
    }
}
