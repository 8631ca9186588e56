//! Rigid-body poses and small geometric helpers shared by the estimator,
//! the refiner and the reprojection validator.

use crate::camera::{CameraModel, CameraModelError, Resolution};
use nalgebra::{
    Matrix3, Matrix4, Quaternion, RealField, Rotation3, UnitQuaternion, Vector2, Vector3, Vector6,
};
use serde::{Deserialize, Serialize};

/// Squared rotation angle below which the axis-angle map switches to its
/// second-order series.
const SMALL_ANGLE_SQ: f64 = 1e-10;

/// A rigid transform `p' = R p + t`.
///
/// The rotation is stored as a [`Rotation3`] and only ever built from a
/// rotation parameterization or an SVD projection, so it stays orthonormal
/// with determinant +1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    /// Builds a pose from a homogeneous 4x4 matrix.
    ///
    /// Returns `None` if the bottom row is not `[0, 0, 0, 1]` or the upper-left
    /// block is not a proper rotation (within `1e-6`).
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Option<Self> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        if (bottom - nalgebra::RowVector4::new(0.0, 0.0, 0.0, 1.0)).norm() > 1e-9 {
            return None;
        }
        let rotation: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let orthogonality = (rotation.transpose() * rotation - Matrix3::identity()).norm();
        if orthogonality > 1e-6 || (rotation.determinant() - 1.0).abs() > 1e-6 {
            return None;
        }
        Some(Pose {
            rotation: nearest_rotation(&rotation),
            translation: matrix.fixed_view::<3, 1>(0, 3).into_owned(),
        })
    }

    /// Builds a pose from a quaternion `[w, x, y, z]` and a translation.
    ///
    /// Returns `None` if the quaternion is not of unit length (within `1e-6`).
    pub fn from_quaternion(wxyz: [f64; 4], translation: [f64; 3]) -> Option<Self> {
        let q = Quaternion::new(wxyz[0], wxyz[1], wxyz[2], wxyz[3]);
        if !q.coords.iter().all(|c| c.is_finite()) || (q.norm() - 1.0).abs() > 1e-6 {
            return None;
        }
        Some(Pose {
            rotation: UnitQuaternion::from_quaternion(q).to_rotation_matrix(),
            translation: Vector3::from(translation),
        })
    }

    /// Builds a pose from `[w (axis-angle), t]`.
    pub fn from_parameters(parameters: &Vector6<f64>) -> Self {
        Pose {
            rotation: Rotation3::new(parameters.fixed_rows::<3>(0).into_owned()),
            translation: parameters.fixed_rows::<3>(3).into_owned(),
        }
    }

    /// Minimal parameterization `[w (axis-angle), t]` used by the refiner.
    pub fn to_parameters(&self) -> Vector6<f64> {
        let w = self.rotation.scaled_axis();
        Vector6::new(
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&self.rotation)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn inverse(&self) -> Pose {
        let rotation = self.rotation.inverse();
        Pose {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut matrix = Matrix4::identity();
        matrix
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.matrix());
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation);
        matrix
    }

    /// Angle in radians of the relative rotation between two poses.
    pub fn rotation_angle_to(&self, other: &Pose) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }

    pub fn translation_distance_to(&self, other: &Pose) -> f64 {
        (self.translation - other.translation).norm()
    }
}

fn skew<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -w.z.clone(),
        w.y.clone(),
        w.z.clone(),
        T::zero(),
        -w.x.clone(),
        -w.y.clone(),
        w.x.clone(),
        T::zero(),
    )
}

/// Rotation matrix of an axis-angle vector (Rodrigues' formula).
///
/// Near zero the closed form is replaced by `I + K + K^2 / 2`, which keeps
/// first derivatives exact at the identity when evaluated with dual numbers.
pub fn rodrigues<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    let k = skew(w);
    let k2 = &k * &k;
    let theta_sq = w.norm_squared();

    if theta_sq < nalgebra::convert::<f64, T>(SMALL_ANGLE_SQ) {
        return Matrix3::identity() + k + k2 * nalgebra::convert::<f64, T>(0.5);
    }

    let theta = theta_sq.clone().sqrt();
    let a = theta.clone().sin() / theta.clone();
    let b = (T::one() - theta.cos()) / theta_sq;
    Matrix3::identity() + k * a + k2 * b
}

/// Applies a `[w, t]` parameter vector to a point.
///
/// This is the single transform path shared by the residuals and the
/// reprojection validator.
pub fn transform_with_parameters<T: RealField>(parameters: &[T], point: &Vector3<T>) -> Vector3<T> {
    let w = Vector3::new(
        parameters[0].clone(),
        parameters[1].clone(),
        parameters[2].clone(),
    );
    let t = Vector3::new(
        parameters[3].clone(),
        parameters[4].clone(),
        parameters[5].clone(),
    );
    rodrigues(&w) * point + t
}

/// Projects an arbitrary 3x3 matrix onto SO(3) in the Frobenius sense.
pub fn nearest_rotation(matrix: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = matrix.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut correction = Matrix3::identity();
            if (u * v_t).determinant() < 0.0 {
                correction[(2, 2)] = -1.0;
            }
            Rotation3::from_matrix_unchecked(u * correction * v_t)
        }
        _ => Rotation3::from_matrix(matrix),
    }
}

/// Generate a grid of sample pixels that are evenly distributed across the image.
///
/// # Arguments
///
/// * `resolution` - The image size in pixels
/// * `n` - The approximate number of pixels to generate
///
/// # Returns
///
/// Pixel centers of a regular grid of cells, all inside the image.
pub fn sample_pixels(resolution: &Resolution, n: usize) -> Vec<Vector2<f64>> {
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    if n == 0 || width == 0.0 || height == 0.0 {
        return Vec::new();
    }

    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);
    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    let mut pixels = Vec::with_capacity(num_cells_x * num_cells_y);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            pixels.push(Vector2::new(
                (j as f64 + 0.5) * cell_width,
                (i as f64 + 0.5) * cell_height,
            ));
        }
    }
    pixels
}

/// Largest pixel distance between a sample pixel and the projection of its
/// unprojected ray, over roughly `n` pixels spread across the image.
///
/// Pixels that cannot be unprojected are skipped.
///
/// # Errors
///
/// Returns the projection error if a ray obtained from a valid pixel cannot be
/// projected back, which means the two mappings disagree on the field of view.
pub fn round_trip_drift<C: CameraModel + ?Sized>(
    camera: &C,
    n: usize,
) -> Result<f64, CameraModelError> {
    let mut drift: f64 = 0.0;
    for pixel in sample_pixels(&camera.get_resolution(), n) {
        let Ok(ray) = camera.unproject(&pixel) else {
            continue;
        };
        let back = camera.project(&ray)?;
        drift = drift.max((back - pixel).norm());
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

    #[test]
    fn test_sample_pixels() {
        let resolution = Resolution {
            width: 800,
            height: 600,
        };
        let n = 100;
        let pixels = sample_pixels(&resolution, n);

        let expected_count = (n as f64 * 0.8) as usize..=(n as f64 * 1.2) as usize;
        assert!(
            expected_count.contains(&pixels.len()),
            "Expected around {} pixels, got {}",
            n,
            pixels.len()
        );
        assert!(pixels.iter().all(|p| resolution.contains(p)));
    }

    #[test]
    fn test_rodrigues_matches_nalgebra() {
        for w in [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(2.0, 0.5, -1.0),
            Vector3::new(1e-7, 0.0, -1e-7),
        ] {
            let expected = Rotation3::new(w);
            let actual = rodrigues(&w);
            assert_relative_eq!(actual, *expected.matrix(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rodrigues_derivative_at_identity() {
        // d(R p)/dw_z at w = 0 is e_z x p.
        let w = Vector3::new(
            Dual64::new(0.0, 0.0),
            Dual64::new(0.0, 0.0),
            Dual64::new(0.0, 1.0),
        );
        let p = Vector3::new(
            Dual64::new(1.0, 0.0),
            Dual64::new(2.0, 0.0),
            Dual64::new(3.0, 0.0),
        );
        let rotated = rodrigues(&w) * p;
        assert_relative_eq!(rotated.x.eps, -2.0, epsilon = 1e-12);
        assert_relative_eq!(rotated.y.eps, 1.0, epsilon = 1e-12);
        assert_relative_eq!(rotated.z.eps, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_parameters_and_inverse() {
        let pose = Pose::from_parameters(&Vector6::new(0.3, -0.1, 0.2, 0.5, -0.4, 1.5));
        let recovered = Pose::from_parameters(&pose.to_parameters());
        assert!(pose.rotation_angle_to(&recovered) < 1e-12);
        assert!(pose.translation_distance_to(&recovered) < 1e-12);

        let p = Vector3::new(0.2, 0.7, -0.3);
        let round_trip = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(round_trip, p, epsilon = 1e-12);

        let composed = pose.compose(&pose.inverse());
        assert!(composed.rotation_angle_to(&Pose::identity()) < 1e-12);
        assert!(composed.translation.norm() < 1e-12);

        let params = pose.to_parameters();
        let via_params = transform_with_parameters(params.as_slice(), &p);
        assert_relative_eq!(via_params, pose.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_pose_from_matrix_and_quaternion() {
        let pose = Pose::from_quaternion([1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0]).unwrap();
        assert_eq!(pose.to_matrix()[(2, 3)], 1.0);
        assert!(Pose::from_quaternion([2.0, 0.0, 0.0, 0.0], [0.0; 3]).is_none());

        let reflected = Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, 1.0, -1.0, 1.0));
        assert!(Pose::from_matrix(&reflected).is_none());

        let matrix = Pose::from_parameters(&Vector6::new(0.0, 0.4, 0.0, 1.0, 2.0, 3.0)).to_matrix();
        let pose = Pose::from_matrix(&matrix).unwrap();
        assert_relative_eq!(pose.to_matrix(), matrix, epsilon = 1e-12);
    }

    #[test]
    fn test_nearest_rotation_fixes_reflection() {
        let noisy = Matrix3::new(1.01, 0.02, 0.0, -0.01, 0.99, 0.0, 0.0, 0.0, -1.0);
        let rotation = nearest_rotation(&noisy);
        assert_relative_eq!(rotation.matrix().determinant(), 1.0, epsilon = 1e-12);
    }
}
