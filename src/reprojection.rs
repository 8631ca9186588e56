//! Reprojection validator.
//!
//! [`predict_pixel`] is the one transform-then-project path of the crate. The
//! reprojection residual evaluates it with dual numbers during refinement and
//! [`validate`] evaluates it with `f64` afterwards, so the reported errors are
//! exactly the quantity that was minimized.

use crate::camera::{CameraModel, CameraModelError};
use crate::correspondence::CorrespondenceSet;
use crate::error::CalibrationError;
use crate::geometry::{transform_with_parameters, Pose};
use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Projects a target-frame point through the pose parameters `[w, t]` and the
/// camera model.
pub fn predict_pixel<C, T>(
    camera: &C,
    parameters: &[T],
    point: &Vector3<f64>,
) -> Result<Vector2<T>, CameraModelError>
where
    C: CameraModel + ?Sized,
    T: RealField,
{
    let point = Vector3::new(
        nalgebra::convert::<f64, T>(point.x),
        nalgebra::convert::<f64, T>(point.y),
        nalgebra::convert::<f64, T>(point.z),
    );
    camera.project(&transform_with_parameters(parameters, &point))
}

/// Predicted pixel of every point under `pose`, in input order.
///
/// Points that leave the calibrated field of view yield their projection
/// error in place.
pub fn validate<C: CameraModel + ?Sized>(
    pose: &Pose,
    points: &[Vector3<f64>],
    camera: &C,
) -> Vec<Result<Vector2<f64>, CameraModelError>> {
    let parameters = pose.to_parameters();
    points
        .iter()
        .map(|point| predict_pixel(camera, parameters.as_slice(), point))
        .collect()
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    /// Number of correspondences the statistics were computed over.
    pub count: usize,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {}, count: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median, self.count
        )
    }
}

impl ProjectionError {
    /// Summary statistics of per-point pixel errors; `None` for an empty slice.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
            count: errors.len(),
        })
    }
}

/// Pixel distance between observation and prediction for every valid
/// correspondence that both projects and lies inside the field of view.
///
/// Returns `(index, error)` pairs.
pub fn reprojection_errors<C: CameraModel + ?Sized>(
    pose: &Pose,
    correspondences: &CorrespondenceSet,
    camera: &C,
) -> Vec<(usize, f64)> {
    let parameters = pose.to_parameters();
    correspondences
        .valid()
        .filter(|(_, c)| camera.unproject(&c.pixel).is_ok())
        .filter_map(|(i, c)| {
            predict_pixel(camera, parameters.as_slice(), &c.point)
                .ok()
                .map(|predicted| (i, (predicted - c.pixel).norm()))
        })
        .collect()
}

/// Reprojection statistics of a pose over a correspondence set.
///
/// # Errors
///
/// [`CalibrationError::InsufficientCorrespondences`] if no correspondence can
/// be evaluated.
pub fn compute_reprojection_error<C: CameraModel + ?Sized>(
    pose: &Pose,
    correspondences: &CorrespondenceSet,
    camera: &C,
) -> Result<ProjectionError, CalibrationError> {
    let errors: Vec<f64> = reprojection_errors(pose, correspondences, camera)
        .into_iter()
        .map(|(_, e)| e)
        .collect();
    ProjectionError::from_errors(&errors).ok_or(CalibrationError::InsufficientCorrespondences {
        found: 0,
        required: 1,
    })
}
