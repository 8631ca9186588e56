//! Camera projection models.
//!
//! Every model implements [`CameraModel`], which maps a 3D point expressed in
//! the camera frame to a pixel (`project`) and a pixel back to a unit ray
//! (`unproject`). The camera frame has x pointing right (image columns), y
//! pointing down (image rows) and z along the optical axis; pixels are
//! `(u, v) = (column, row)`.
//!
//! `project` is generic over [`RealField`] so the exact same code path is
//! evaluated with plain `f64` (validation, reporting) and with dual numbers
//! (Jacobians inside the refinement backends).

use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod kannala_brandt;
pub mod omnidirectional;

pub use kannala_brandt::KannalaBrandtModel;
pub use omnidirectional::{AffineCorrection, DistortionCenter, OcamModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns `true` if the pixel lies inside `[0, width) x [0, height)`.
    pub fn contains(&self, point_2d: &Vector2<f64>) -> bool {
        point_2d.x >= 0.0
            && point_2d.x < self.width as f64
            && point_2d.y >= 0.0
            && point_2d.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Point lies outside the calibrated field of view")]
    OutOfFieldOfView,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Malformed calibration file at line {line}: {reason}")]
    MalformedCalibrationFile { line: usize, reason: String },
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models.
///
/// Implementations are immutable once constructed: calibration coefficients
/// are loaded once and only ever read by the estimation and refinement code.
pub trait CameraModel: Send + Sync {
    /// Projects a 3D point in the camera frame to pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::OutOfFieldOfView`]: the ray lies beyond the
    ///   calibrated angular range of the model.
    /// * [`CameraModelError::PointAtCameraCenter`]: the point coincides with
    ///   the projection center.
    fn project<T: RealField>(&self, point_3d: &Vector3<T>) -> Result<Vector2<T>, CameraModelError>;

    /// Unprojects a pixel to a unit-length ray in the camera frame.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::OutOfFieldOfView`]: the pixel lies outside the
    ///   image or beyond the calibrated sensor radius.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    /// Largest angle between a projectable ray and the optical axis, in radians.
    fn field_of_view(&self) -> f64;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), CameraModelError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraModelError::InvalidParams(format!(
                "resolution must be non-zero, got {}x{}",
                resolution.width, resolution.height
            )));
        }
        Ok(())
    }

    pub fn validate_coefficients(name: &str, coefficients: &[f64]) -> Result<(), CameraModelError> {
        if coefficients.is_empty() {
            return Err(CameraModelError::InvalidParams(format!(
                "{name} must contain at least one coefficient"
            )));
        }
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "{name} contains non-finite coefficients"
            )));
        }
        Ok(())
    }
}

/// Evaluates `c[0] + c[1] x + c[2] x^2 + ...` with Horner's scheme.
pub(crate) fn polyval<T: RealField>(coefficients: &[f64], x: T) -> T {
    coefficients
        .iter()
        .rev()
        .fold(T::zero(), |acc, &c| acc * x.clone() + nalgebra::convert::<f64, T>(c))
}

/// Calibrated intrinsics of any supported camera.
///
/// This is the value handed to the calibration core; the concrete variant is
/// decided by whatever loaded the calibration.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CameraIntrinsics {
    Omnidirectional(OcamModel),
    Fisheye(KannalaBrandtModel),
}

impl CameraIntrinsics {
    /// Loads a calibration, choosing the model from the file extension:
    /// `.yaml`/`.yml` files hold a Kannala-Brandt model, anything else is read
    /// as an omnidirectional coefficient file.
    pub fn load(path: &Path) -> Result<Self, CameraModelError> {
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            Ok(CameraIntrinsics::Fisheye(KannalaBrandtModel::load_from_yaml(path)?))
        } else {
            Ok(CameraIntrinsics::Omnidirectional(OcamModel::load_from_txt(path)?))
        }
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            CameraIntrinsics::Omnidirectional(_) => "omnidirectional",
            CameraIntrinsics::Fisheye(_) => "kannala_brandt",
        }
    }
}

impl CameraModel for CameraIntrinsics {
    fn project<T: RealField>(&self, point_3d: &Vector3<T>) -> Result<Vector2<T>, CameraModelError> {
        match self {
            CameraIntrinsics::Omnidirectional(model) => model.project(point_3d),
            CameraIntrinsics::Fisheye(model) => model.project(point_3d),
        }
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        match self {
            CameraIntrinsics::Omnidirectional(model) => model.unproject(point_2d),
            CameraIntrinsics::Fisheye(model) => model.unproject(point_2d),
        }
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        match self {
            CameraIntrinsics::Omnidirectional(model) => model.validate_params(),
            CameraIntrinsics::Fisheye(model) => model.validate_params(),
        }
    }

    fn get_resolution(&self) -> Resolution {
        match self {
            CameraIntrinsics::Omnidirectional(model) => model.get_resolution(),
            CameraIntrinsics::Fisheye(model) => model.get_resolution(),
        }
    }

    fn field_of_view(&self) -> f64 {
        match self {
            CameraIntrinsics::Omnidirectional(model) => model.field_of_view(),
            CameraIntrinsics::Fisheye(model) => model.field_of_view(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polyval_horner() {
        let coefficients = [1.0, -2.0, 0.5];
        assert_eq!(polyval(&coefficients, 0.0_f64), 1.0);
        assert_eq!(polyval(&coefficients, 2.0_f64), 1.0 - 4.0 + 2.0);
        assert_eq!(polyval::<f64>(&[], 3.0), 0.0);
    }

    #[test]
    fn test_validate_intrinsics() {
        let good = Intrinsics {
            fx: 300.0,
            fy: 300.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert!(validation::validate_intrinsics(&good).is_ok());

        let bad = Intrinsics { fx: -1.0, ..good };
        assert!(matches!(
            validation::validate_intrinsics(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }

    #[test]
    fn test_load_dispatches_on_extension() {
        let omni = CameraIntrinsics::load(Path::new("samples/ocam_calib.txt")).unwrap();
        assert_eq!(omni.model_name(), "omnidirectional");

        let kb = CameraIntrinsics::load(Path::new("samples/kannala_brandt.yaml")).unwrap();
        assert_eq!(kb.model_name(), "kannala_brandt");
        assert_eq!(kb.get_resolution().width, 752);
    }
}
