//! Reprojection residual for camera-to-target calibration.

use super::PoseResidual;
use crate::camera::CameraModel;
use crate::correspondence::CorrespondenceSet;
use crate::geometry::Pose;
use crate::reprojection::predict_pixel;
use log::debug;
use nalgebra::{DVector, RealField, Vector2, Vector3};
use std::sync::Arc;

/// `predicted - observed` for every active correspondence, two rows each.
///
/// A correspondence is active if it is flagged valid, its observed pixel lies
/// inside the calibrated field of view and its target point projects under the
/// seed pose. Inactive correspondences never contribute to the cost.
pub struct ReprojectionResidual<C> {
    camera: Arc<C>,
    points: Vec<Vector3<f64>>,
    observations: Vec<Vector2<f64>>,
    active: Vec<usize>,
    excluded: Vec<usize>,
}

impl<C> Clone for ReprojectionResidual<C> {
    fn clone(&self) -> Self {
        ReprojectionResidual {
            camera: Arc::clone(&self.camera),
            points: self.points.clone(),
            observations: self.observations.clone(),
            active: self.active.clone(),
            excluded: self.excluded.clone(),
        }
    }
}

impl<C: CameraModel> ReprojectionResidual<C> {
    pub fn new(camera: Arc<C>, correspondences: &CorrespondenceSet, seed: &Pose) -> Self {
        let seed_parameters = seed.to_parameters();
        let mut residual = ReprojectionResidual {
            camera,
            points: Vec::new(),
            observations: Vec::new(),
            active: Vec::new(),
            excluded: Vec::new(),
        };

        for (index, c) in correspondences.iter().enumerate() {
            if !c.valid {
                continue;
            }
            let observable = residual.camera.unproject(&c.pixel).is_ok();
            let projectable = observable
                && predict_pixel(residual.camera.as_ref(), seed_parameters.as_slice(), &c.point)
                    .is_ok();
            if projectable {
                residual.points.push(c.point);
                residual.observations.push(c.pixel);
                residual.active.push(index);
            } else {
                debug!("correspondence {index} excluded: outside the field of view");
                residual.excluded.push(index);
            }
        }
        residual
    }

    /// Indices of the correspondences that enter the cost.
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    /// Indices of valid correspondences dropped for leaving the field of view.
    pub fn excluded(&self) -> &[usize] {
        &self.excluded
    }
}

impl<C: CameraModel + 'static> PoseResidual for ReprojectionResidual<C> {
    fn num_residuals(&self) -> usize {
        2 * self.points.len()
    }

    fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>> {
        let mut residuals = DVector::zeros(self.num_residuals());
        for (i, (point, observed)) in self.points.iter().zip(&self.observations).enumerate() {
            let predicted = predict_pixel(self.camera.as_ref(), parameters, point).ok()?;
            residuals[2 * i] = predicted.x.clone() - nalgebra::convert::<f64, T>(observed.x);
            residuals[2 * i + 1] = predicted.y.clone() - nalgebra::convert::<f64, T>(observed.y);
        }
        Some(residuals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::OcamModel;
    use crate::correspondence::Correspondence;
    use crate::reprojection::validate;

    fn square_scene() -> (Arc<OcamModel>, CorrespondenceSet, Pose) {
        let camera = Arc::new(OcamModel::load_from_txt("samples/ocam_calib.txt").unwrap());
        let pose = Pose::from_quaternion([1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0]).unwrap();
        let points = vec![
            Vector3::new(-0.05, -0.05, 0.0),
            Vector3::new(0.05, -0.05, 0.0),
            Vector3::new(0.05, 0.05, 0.0),
            Vector3::new(-0.05, 0.05, 0.0),
        ];
        let pixels = validate(&pose, &points, camera.as_ref())
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let set = CorrespondenceSet::from_pairs(points, pixels).unwrap();
        (camera, set, pose)
    }

    #[test]
    fn test_zero_residual_at_true_pose() {
        let (camera, set, pose) = square_scene();
        let residual = ReprojectionResidual::new(camera, &set, &pose);
        assert_eq!(residual.num_residuals(), 8);
        let cost = residual.cost(&pose.to_parameters()).unwrap();
        assert!(cost < 1e-20);
    }

    #[test]
    fn test_out_of_view_observations_are_excluded() {
        let (camera, mut set, pose) = square_scene();
        set.push(Correspondence::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector2::new(-10.0, 5.0),
        ));
        let mut invalid = Correspondence::new(Vector3::new(0.1, 0.1, 0.0), Vector2::new(500.0, 380.0));
        invalid.valid = false;
        set.push(invalid);

        let residual = ReprojectionResidual::new(camera, &set, &pose);
        assert_eq!(residual.active(), &[0, 1, 2, 3]);
        assert_eq!(residual.excluded(), &[4]);
        assert_eq!(residual.num_residuals(), 8);
    }
}
