//! Implements the omnidirectional (OCamCalib-style) polynomial camera model.
//!
//! The model is described by two independently calibrated polynomials:
//!
//! * the *inverse* polynomial maps a sensor-plane radius `r` to the optical
//!   component `z(r)` of the viewing ray (image-to-ray), and
//! * the *forward* polynomial maps the ray elevation angle `theta` to a
//!   sensor-plane radius (ray-to-image).
//!
//! An affine correction `[[c, d], [e, 1]]` and a distortion center relate the
//! sensor plane to pixel coordinates. The sensor plane is expressed with the
//! row axis first and the optical axis pointing towards negative z, which is
//! the layout of the calibration files; conversion to the crate's camera frame
//! (x right, y down, z forward) is a proper rotation applied at the boundary.
//!
//! Neither mapping is obtained by numerically inverting the other. They are
//! only expected to agree up to the accuracy of the calibration, see
//! [`crate::geometry::round_trip_drift`].

use crate::camera::{polyval, validation, CameraModel, CameraModelError, Resolution};
use log::debug;
use nalgebra::{DMatrix, DVector, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Rays this close (in radians) past the calibrated boundary still count as
/// boundary samples.
const FOV_TOLERANCE: f64 = 1e-9;

/// Relative lateral radius below which a ray is treated as the optical axis.
const AXIS_EPSILON: f64 = 1e-12;

/// Number of radii used when checking that the angle-from-axis is monotonic.
const MONOTONICITY_SAMPLES: usize = 512;

/// Distortion center in pixels, stored as (row, column) like the calibration file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionCenter {
    pub row: f64,
    pub col: f64,
}

/// Affine sensor-plane correction `[[c, d], [e, 1]]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineCorrection {
    pub c: f64,
    pub d: f64,
    pub e: f64,
}

impl AffineCorrection {
    pub const IDENTITY: AffineCorrection = AffineCorrection {
        c: 1.0,
        d: 0.0,
        e: 0.0,
    };

    fn determinant(&self) -> f64 {
        self.c - self.d * self.e
    }
}

/// Omnidirectional camera model.
///
/// Instances are immutable: the derived field-of-view boundary is computed
/// once in [`OcamModel::new`] and stays consistent with the coefficients.
#[derive(Debug, Clone, Serialize)]
pub struct OcamModel {
    inverse_polynomial: Vec<f64>,
    forward_polynomial: Vec<f64>,
    center: DistortionCenter,
    affine: AffineCorrection,
    resolution: Resolution,
    #[serde(skip)]
    max_radius: f64,
    #[serde(skip)]
    field_of_view: f64,
}

impl OcamModel {
    /// Creates a validated [`OcamModel`].
    ///
    /// # Arguments
    ///
    /// * `inverse_polynomial` - image-to-ray coefficients, lowest order first.
    /// * `forward_polynomial` - ray-to-image coefficients, lowest order first.
    /// * `center` - distortion center (row, column) in pixels.
    /// * `affine` - sensor-plane affine correction.
    /// * `resolution` - nominal image size.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if any coefficient is non-finite,
    /// the affine matrix is singular, the optical axis does not map forward,
    /// or the angle from the optical axis is not strictly increasing over
    /// the image.
    pub fn new(
        inverse_polynomial: Vec<f64>,
        forward_polynomial: Vec<f64>,
        center: DistortionCenter,
        affine: AffineCorrection,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let mut model = OcamModel {
            inverse_polynomial,
            forward_polynomial,
            center,
            affine,
            resolution,
            max_radius: 0.0,
            field_of_view: 0.0,
        };
        model.max_radius = model.compute_max_radius();
        model.field_of_view = model.angle_from_axis(model.max_radius);
        model.validate_params()?;
        Ok(model)
    }

    /// Creates a model from the image-to-ray polynomial alone, fitting the
    /// ray-to-image polynomial of the given degree over the calibrated range.
    pub fn from_inverse_polynomial(
        inverse_polynomial: Vec<f64>,
        center: DistortionCenter,
        affine: AffineCorrection,
        resolution: Resolution,
        forward_degree: usize,
    ) -> Result<Self, CameraModelError> {
        let provisional = OcamModel::new(inverse_polynomial, vec![0.0], center, affine, resolution)?;
        let forward = provisional.fit_forward_polynomial(forward_degree)?;
        OcamModel::new(
            provisional.inverse_polynomial,
            forward,
            center,
            affine,
            resolution,
        )
    }

    pub fn inverse_polynomial(&self) -> &[f64] {
        &self.inverse_polynomial
    }

    pub fn forward_polynomial(&self) -> &[f64] {
        &self.forward_polynomial
    }

    pub fn center(&self) -> DistortionCenter {
        self.center
    }

    pub fn affine(&self) -> AffineCorrection {
        self.affine
    }

    /// Largest sensor-plane radius reachable inside the image.
    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }

    /// Fits the ray-to-image polynomial `rho(theta)` by linear least squares
    /// over radii in `[0, max_radius]`, where `theta` is the elevation angle
    /// the image-to-ray polynomial assigns to each radius.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if the least-squares system cannot
    /// be solved.
    pub fn fit_forward_polynomial(&self, degree: usize) -> Result<Vec<f64>, CameraModelError> {
        let samples = (4 * (degree + 1)).max(200);
        let mut vandermonde = DMatrix::<f64>::zeros(samples + 1, degree + 1);
        let mut radii = DVector::<f64>::zeros(samples + 1);

        for i in 0..=samples {
            let r = self.max_radius * i as f64 / samples as f64;
            let theta = polyval(&self.inverse_polynomial, r).atan2(r);
            let mut power = 1.0;
            for k in 0..=degree {
                vandermonde[(i, k)] = power;
                power *= theta;
            }
            radii[i] = r;
        }

        let svd = vandermonde.svd(true, true);
        let solution = svd.solve(&radii, 1e-15).map_err(|e| {
            CameraModelError::InvalidParams(format!("forward polynomial fit failed: {e}"))
        })?;
        debug!(
            "fitted degree {} forward polynomial over {} radii",
            degree,
            samples + 1
        );
        Ok(solution.iter().copied().collect())
    }

    /// Loads a model from a calibration coefficient file.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: the file cannot be read.
    /// * [`CameraModelError::MalformedCalibrationFile`]: the file is truncated
    ///   or a line does not hold the expected values.
    /// * [`CameraModelError::InvalidParams`]: the values parse but do not form
    ///   a valid model.
    pub fn load_from_txt(path: impl AsRef<Path>) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Self::from_calibration_str(&contents)
    }

    /// Parses the calibration coefficient format.
    ///
    /// Lines starting with `#` and blank lines are ignored. The remaining lines
    /// must be, in order: the image-to-ray polynomial (`N c0 .. cN-1`), the
    /// ray-to-image polynomial, the distortion center (`row col`), the affine
    /// parameters (`c d e`) and the image size (`height width`).
    pub fn from_calibration_str(contents: &str) -> Result<Self, CameraModelError> {
        let end_of_file = contents.lines().count() + 1;
        let mut data_lines = contents
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let mut next_line = |what: &str| {
            data_lines
                .next()
                .ok_or_else(|| CameraModelError::MalformedCalibrationFile {
                    line: end_of_file,
                    reason: format!("file ends before the {what}"),
                })
        };

        let (line, text) = next_line("image-to-ray polynomial")?;
        let inverse_polynomial = parse_polynomial(line, text)?;
        let (line, text) = next_line("ray-to-image polynomial")?;
        let forward_polynomial = parse_polynomial(line, text)?;
        let (line, text) = next_line("distortion center")?;
        let center = parse_values(line, text, 2)?;
        let (line, text) = next_line("affine parameters")?;
        let affine = parse_values(line, text, 3)?;
        let (line, text) = next_line("image size")?;
        let size = parse_values(line, text, 2)?;

        if let Some((line, _)) = data_lines.next() {
            return Err(CameraModelError::MalformedCalibrationFile {
                line,
                reason: "unexpected data after the image size".to_string(),
            });
        }

        let resolution = Resolution {
            height: parse_dimension(line, size[0])?,
            width: parse_dimension(line, size[1])?,
        };

        OcamModel::new(
            inverse_polynomial,
            forward_polynomial,
            DistortionCenter {
                row: center[0],
                col: center[1],
            },
            AffineCorrection {
                c: affine[0],
                d: affine[1],
                e: affine[2],
            },
            resolution,
        )
    }

    /// Formats the model in the calibration coefficient layout.
    pub fn to_calibration_string(&self) -> String {
        let mut out = String::new();
        let join = |values: &[f64]| {
            values
                .iter()
                .map(|v| format!("{v:e}"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let _ = writeln!(out, "#polynomial coefficients for the image-to-ray mapping\n");
        let _ = writeln!(
            out,
            "{} {}\n",
            self.inverse_polynomial.len(),
            join(&self.inverse_polynomial)
        );
        let _ = writeln!(out, "#polynomial coefficients for the ray-to-image mapping\n");
        let _ = writeln!(
            out,
            "{} {}\n",
            self.forward_polynomial.len(),
            join(&self.forward_polynomial)
        );
        let _ = writeln!(out, "#center: \"row\" and \"column\", starting from 0\n");
        let _ = writeln!(out, "{} {}\n", self.center.row, self.center.col);
        let _ = writeln!(out, "#affine parameters \"c\", \"d\", \"e\"\n");
        let _ = writeln!(out, "{} {} {}\n", self.affine.c, self.affine.d, self.affine.e);
        let _ = writeln!(out, "#image size: \"height\" and \"width\"\n");
        let _ = writeln!(out, "{} {}", self.resolution.height, self.resolution.width);
        out
    }

    pub fn save_to_txt(&self, path: impl AsRef<Path>) -> Result<(), CameraModelError> {
        fs::write(path, self.to_calibration_string())?;
        Ok(())
    }

    /// Pixel `(u, v)` to sensor-plane coordinates (row axis, column axis).
    fn pixel_to_sensor(&self, point_2d: &Vector2<f64>) -> (f64, f64) {
        let AffineCorrection { c, d, e } = self.affine;
        let inv_det = 1.0 / self.affine.determinant();
        let du = point_2d.y - self.center.row;
        let dv = point_2d.x - self.center.col;
        (inv_det * (du - d * dv), inv_det * (-e * du + c * dv))
    }

    fn compute_max_radius(&self) -> f64 {
        let w = self.resolution.width as f64;
        let h = self.resolution.height as f64;
        [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .iter()
            .map(|&(u, v)| {
                let (xs, ys) = self.pixel_to_sensor(&Vector2::new(u, v));
                xs.hypot(ys)
            })
            .fold(0.0, f64::max)
    }

    /// Angle between the optical axis and the ray of a sensor radius.
    fn angle_from_axis(&self, radius: f64) -> f64 {
        radius.atan2(-polyval(&self.inverse_polynomial, radius))
    }
}

impl CameraModel for OcamModel {
    /// Projects a camera-frame point through the ray-to-image polynomial.
    ///
    /// A point on the optical axis maps to the distortion center. Rays up to
    /// the calibrated boundary are evaluated with the polynomial; anything
    /// past it is rejected rather than extrapolated.
    fn project<T: RealField>(&self, point_3d: &Vector3<T>) -> Result<Vector2<T>, CameraModelError> {
        let x = point_3d.x.clone();
        let y = point_3d.y.clone();
        let z = point_3d.z.clone();

        let lateral_sq = x.clone() * x.clone() + y.clone() * y.clone();
        let range_sq = lateral_sq.clone() + z.clone() * z.clone();
        if range_sq == T::zero() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let axis_eps = nalgebra::convert::<f64, T>(AXIS_EPSILON * AXIS_EPSILON);
        if lateral_sq <= axis_eps * range_sq {
            if z > T::zero() {
                return Ok(Vector2::new(
                    nalgebra::convert(self.center.col),
                    nalgebra::convert(self.center.row),
                ));
            }
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let lateral = lateral_sq.sqrt();
        let alpha = lateral.clone().atan2(z.clone());
        if alpha > nalgebra::convert::<f64, T>(self.field_of_view + FOV_TOLERANCE) {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let theta = (-z).atan2(lateral.clone());
        let rho = polyval(&self.forward_polynomial, theta);

        // Sensor plane: row axis from camera y, column axis from camera x.
        let xs = y / lateral.clone() * rho.clone();
        let ys = x / lateral * rho;

        let c = nalgebra::convert::<f64, T>(self.affine.c);
        let d = nalgebra::convert::<f64, T>(self.affine.d);
        let e = nalgebra::convert::<f64, T>(self.affine.e);
        let row = c * xs.clone() + d * ys.clone() + nalgebra::convert(self.center.row);
        let col = e * xs + ys + nalgebra::convert(self.center.col);

        Ok(Vector2::new(col, row))
    }

    /// Unprojects a pixel through the image-to-ray polynomial.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let (xs, ys) = self.pixel_to_sensor(point_2d);
        let radius = xs.hypot(ys);
        if radius > self.max_radius {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let zs = polyval(&self.inverse_polynomial, radius);
        Ok(Vector3::new(ys, xs, -zs).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_coefficients("inverse polynomial", &self.inverse_polynomial)?;
        validation::validate_coefficients("forward polynomial", &self.forward_polynomial)?;
        validation::validate_resolution(&self.resolution)?;

        if !self.center.row.is_finite() || !self.center.col.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }

        let det = self.affine.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return Err(CameraModelError::InvalidParams(
                "affine correction is singular".to_string(),
            ));
        }

        if self.inverse_polynomial[0] >= 0.0 {
            return Err(CameraModelError::InvalidParams(
                "inverse polynomial must map the distortion center to a forward ray (c0 < 0)"
                    .to_string(),
            ));
        }

        let mut previous = -1.0;
        for i in 0..=MONOTONICITY_SAMPLES {
            let radius = self.max_radius * i as f64 / MONOTONICITY_SAMPLES as f64;
            let alpha = self.angle_from_axis(radius);
            if alpha <= previous {
                return Err(CameraModelError::InvalidParams(format!(
                    "angle from the optical axis is not increasing at sensor radius {radius:.2}"
                )));
            }
            previous = alpha;
        }

        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn field_of_view(&self) -> f64 {
        self.field_of_view
    }
}

fn malformed(line: usize, reason: impl Into<String>) -> CameraModelError {
    CameraModelError::MalformedCalibrationFile {
        line,
        reason: reason.into(),
    }
}

fn parse_float(line: usize, token: &str) -> Result<f64, CameraModelError> {
    token
        .parse::<f64>()
        .map_err(|_| malformed(line, format!("'{token}' is not a number")))
}

fn parse_polynomial(line: usize, text: &str) -> Result<Vec<f64>, CameraModelError> {
    let mut tokens = text.split_whitespace();
    let count_token = tokens
        .next()
        .ok_or_else(|| malformed(line, "missing coefficient count"))?;
    let count = count_token
        .parse::<usize>()
        .map_err(|_| malformed(line, format!("'{count_token}' is not a coefficient count")))?;
    if count == 0 {
        return Err(malformed(line, "polynomial has no coefficients"));
    }

    let coefficients = tokens
        .map(|token| parse_float(line, token))
        .collect::<Result<Vec<_>, _>>()?;
    if coefficients.len() != count {
        return Err(malformed(
            line,
            format!(
                "expected {count} coefficients, found {}",
                coefficients.len()
            ),
        ));
    }
    Ok(coefficients)
}

fn parse_values(line: usize, text: &str, expected: usize) -> Result<Vec<f64>, CameraModelError> {
    let values = text
        .split_whitespace()
        .map(|token| parse_float(line, token))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(malformed(
            line,
            format!("expected {expected} values, found {}", values.len()),
        ));
    }
    Ok(values)
}

fn parse_dimension(line: usize, value: f64) -> Result<u32, CameraModelError> {
    if value < 1.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(malformed(
            line,
            format!("'{value}' is not a valid image dimension"),
        ));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{round_trip_drift, sample_pixels};
    use approx::assert_relative_eq;

    const SAMPLE_PATH: &str = "samples/ocam_calib.txt";

    fn sample_model() -> OcamModel {
        OcamModel::load_from_txt(SAMPLE_PATH).unwrap()
    }

    #[test]
    fn test_load_from_txt() {
        let model = sample_model();
        assert_eq!(model.inverse_polynomial().len(), 5);
        assert_eq!(model.forward_polynomial().len(), 13);
        assert_eq!(model.inverse_polynomial()[0], -280.0);
        assert_eq!(model.center().row, 383.5);
        assert_eq!(model.center().col, 511.5);
        assert_eq!(model.affine().c, 1.0004);
        assert_eq!(model.get_resolution().width, 1024);
        assert_eq!(model.get_resolution().height, 768);
        assert!(model.field_of_view().to_degrees() > 107.0);
        assert!(model.field_of_view().to_degrees() < 108.0);
    }

    #[test]
    fn test_optical_axis_maps_to_center() {
        let model = sample_model();
        let pixel = model.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert_eq!(pixel.x, 511.5);
        assert_eq!(pixel.y, 383.5);

        let ray = model.unproject(&Vector2::new(511.5, 383.5)).unwrap();
        assert_relative_eq!(ray.z, 1.0, epsilon = 1e-12);
    }

    /// Corners of a 0.1 m square one meter in front of the camera.
    #[test]
    fn test_project_square_corners() {
        let model = sample_model();
        let expected = [
            ((-0.05, -0.05), (497.52587401068143, 369.5132947814452)),
            ((0.05, -0.05), (525.479716757868, 369.52168093426934)),
            ((0.05, 0.05), (525.4741259893186, 397.4867052185548)),
            ((-0.05, 0.05), (497.520283242132, 397.47831906573066)),
        ];
        for ((x, y), (u, v)) in expected {
            let pixel = model.project(&Vector3::new(x, y, 1.0)).unwrap();
            assert_relative_eq!(pixel.x, u, epsilon = 1e-6);
            assert_relative_eq!(pixel.y, v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_round_trip_over_image() {
        let model = sample_model();
        let pixels = sample_pixels(&model.get_resolution(), 400);
        assert!(pixels.len() > 300);
        for pixel in &pixels {
            let ray = model.unproject(pixel).unwrap();
            assert_relative_eq!(ray.norm(), 1.0, epsilon = 1e-12);
            let back = model.project(&ray).unwrap();
            assert!(
                (back - pixel).norm() < 1e-3,
                "round trip drift {} at {:?}",
                (back - pixel).norm(),
                pixel
            );
        }
        assert!(round_trip_drift(&model, 400).unwrap() < 1e-3);
    }

    #[test]
    fn test_project_rejects_rays_past_boundary() {
        let model = sample_model();
        let fov = model.field_of_view();

        let boundary = Vector3::new(fov.sin(), 0.0, fov.cos());
        let pixel = model.project(&boundary).unwrap();
        assert!(pixel.x.is_finite() && pixel.y.is_finite());

        let beyond = Vector3::new((fov + 1e-3).sin(), 0.0, (fov + 1e-3).cos());
        assert!(matches!(
            model.project(&beyond),
            Err(CameraModelError::OutOfFieldOfView)
        ));

        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, -1.0)),
            Err(CameraModelError::OutOfFieldOfView)
        ));
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_unproject_rejects_pixels_outside_image() {
        let model = sample_model();
        for pixel in [
            Vector2::new(-1.0, 100.0),
            Vector2::new(100.0, -0.5),
            Vector2::new(1024.0, 100.0),
            Vector2::new(100.0, 900.0),
        ] {
            assert!(matches!(
                model.unproject(&pixel),
                Err(CameraModelError::OutOfFieldOfView)
            ));
        }
    }

    #[test]
    fn test_wide_rays_unproject_behind_image_plane() {
        let model = sample_model();
        // The top-left corner sits beyond 90 degrees from the axis.
        let ray = model.unproject(&Vector2::new(0.0, 0.0)).unwrap();
        assert!(ray.z < 0.0);
        assert!(ray.x < 0.0 && ray.y < 0.0);
    }

    #[test]
    fn test_fit_forward_polynomial_matches_inverse() {
        let model = sample_model();
        let refit = OcamModel::from_inverse_polynomial(
            model.inverse_polynomial().to_vec(),
            model.center(),
            model.affine(),
            model.get_resolution(),
            12,
        )
        .unwrap();
        assert_eq!(refit.forward_polynomial().len(), 13);
        assert!(round_trip_drift(&refit, 400).unwrap() < 1e-3);
    }

    #[test]
    fn test_validate_rejects_bad_coefficients() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let center = DistortionCenter {
            row: 240.0,
            col: 320.0,
        };

        let forward_ray_behind = OcamModel::new(
            vec![100.0, 0.0, 1e-3],
            vec![200.0, 100.0],
            center,
            AffineCorrection::IDENTITY,
            resolution,
        );
        assert!(matches!(
            forward_ray_behind,
            Err(CameraModelError::InvalidParams(_))
        ));

        // z(r) turns around inside the image, so the angle stops increasing.
        let folding = OcamModel::new(
            vec![-100.0, 0.0, -1e-2],
            vec![200.0, 100.0],
            center,
            AffineCorrection::IDENTITY,
            resolution,
        );
        assert!(matches!(folding, Err(CameraModelError::InvalidParams(_))));

        let singular = OcamModel::new(
            vec![-200.0, 0.0, 1e-3],
            vec![200.0, 100.0],
            center,
            AffineCorrection {
                c: 1.0,
                d: 1.0,
                e: 1.0,
            },
            resolution,
        );
        assert!(matches!(singular, Err(CameraModelError::InvalidParams(_))));
    }

    #[test]
    fn test_malformed_files_fail_fast() {
        let full = fs::read_to_string(SAMPLE_PATH).unwrap();

        let truncated: String = full.lines().take(15).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            OcamModel::from_calibration_str(&truncated),
            Err(CameraModelError::MalformedCalibrationFile { .. })
        ));

        let short_polynomial = "4 -280.0 0.0 0.0012\n2 1.0 2.0\n1 2\n1 0 0\n10 10\n";
        match OcamModel::from_calibration_str(short_polynomial) {
            Err(CameraModelError::MalformedCalibrationFile { line, reason }) => {
                assert_eq!(line, 1);
                assert!(reason.contains("expected 4"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let not_a_number = "# header\n3 -280.0 0.0 abc\n";
        match OcamModel::from_calibration_str(not_a_number) {
            Err(CameraModelError::MalformedCalibrationFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let trailing = format!("{full}\n1 2 3\n");
        assert!(matches!(
            OcamModel::from_calibration_str(&trailing),
            Err(CameraModelError::MalformedCalibrationFile { .. })
        ));

        assert!(matches!(
            OcamModel::from_calibration_str(""),
            Err(CameraModelError::MalformedCalibrationFile { line: 1, .. })
        ));
    }

    #[test]
    fn test_calibration_string_reloads() {
        let model = sample_model();
        let reloaded = OcamModel::from_calibration_str(&model.to_calibration_string()).unwrap();
        assert_eq!(reloaded.forward_polynomial().len(), 13);
        assert_relative_eq!(
            reloaded.field_of_view(),
            model.field_of_view(),
            epsilon = 1e-12
        );
        let point = Vector3::new(0.3, -0.2, 0.5);
        let a = model.project(&point).unwrap();
        let b = reloaded.project(&point).unwrap();
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
    }
}
