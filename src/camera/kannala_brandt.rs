//! Kannala-Brandt equidistant fisheye model.
//!
//! The ray angle `theta` from the optical axis is distorted with an odd
//! polynomial `theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`
//! and scaled by the focal lengths. Unprojection inverts the polynomial with
//! Newton iterations.

use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use yaml_rust::YamlLoader;

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};

const NEWTON_MAX_ITERATIONS: usize = 20;
const NEWTON_TOLERANCE: f64 = 1e-12;
const FOV_TOLERANCE: f64 = 1e-9;
const FOV_SCAN_STEPS: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KannalaBrandtModel {
    intrinsics: Intrinsics,
    resolution: Resolution,
    distortions: [f64; 4], // k1, k2, k3, k4
    #[serde(skip)]
    field_of_view: f64,
}

impl KannalaBrandtModel {
    /// Creates a validated model.
    ///
    /// # Errors
    ///
    /// Fails if the intrinsics are invalid or the distortion polynomial is not
    /// strictly increasing up to the image border.
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 4],
    ) -> Result<Self, CameraModelError> {
        let mut model = KannalaBrandtModel {
            intrinsics,
            resolution,
            distortions,
            field_of_view: 0.0,
        };
        validation::validate_intrinsics(&model.intrinsics)?;
        validation::validate_resolution(&model.resolution)?;
        validation::validate_coefficients("distortion", &model.distortions)?;
        model.field_of_view = model.compute_field_of_view()?;
        Ok(model)
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn distortions(&self) -> [f64; 4] {
        self.distortions
    }

    /// Loads a model from a Kalibr-style YAML file with a `cam0` entry holding
    /// `intrinsics: [fx, fy, cx, cy]`, `distortion: [k1, k2, k3, k4]` and
    /// `resolution: [width, height]`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`] if the file cannot be read.
    /// * [`CameraModelError::YamlError`] if it is not valid YAML.
    /// * [`CameraModelError::InvalidParams`] if an entry is missing or the
    ///   resulting model is invalid.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::YamlError("empty YAML document".to_string()))?;
        let cam = &doc["cam0"];

        let read_floats = |key: &str, expected: usize| -> Result<Vec<f64>, CameraModelError> {
            let values = cam[key].as_vec().ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Missing or invalid '{key}'"))
            })?;
            if values.len() != expected {
                return Err(CameraModelError::InvalidParams(format!(
                    "'{key}' must hold {expected} values, found {}",
                    values.len()
                )));
            }
            values
                .iter()
                .map(|v| {
                    v.as_f64()
                        .or_else(|| v.as_i64().map(|i| i as f64))
                        .ok_or_else(|| {
                            CameraModelError::InvalidParams(format!("Invalid value in '{key}'"))
                        })
                })
                .collect()
        };

        let intrinsics = read_floats("intrinsics", 4)?;
        let distortion = read_floats("distortion", 4)?;
        let resolution = cam["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        if resolution.len() != 2 {
            return Err(CameraModelError::InvalidParams(
                "resolution must be [width, height]".to_string(),
            ));
        }

        let read_dimension = |index: usize, name: &str| {
            resolution[index]
                .as_i64()
                .and_then(|value| u32::try_from(value).ok())
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };
        let resolution = Resolution {
            width: read_dimension(0, "width")?,
            height: read_dimension(1, "height")?,
        };

        KannalaBrandtModel::new(
            Intrinsics {
                fx: intrinsics[0],
                fy: intrinsics[1],
                cx: intrinsics[2],
                cy: intrinsics[3],
            },
            resolution,
            [distortion[0], distortion[1], distortion[2], distortion[3]],
        )
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CameraModelError> {
        let mut cam = serde_yaml::Mapping::new();
        cam.insert("camera_model".into(), "kannala_brandt".into());
        cam.insert(
            "intrinsics".into(),
            serde_yaml::to_value(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ])
            .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        );
        cam.insert(
            "distortion".into(),
            serde_yaml::to_value(self.distortions.to_vec())
                .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        );
        cam.insert(
            "resolution".into(),
            serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        );
        let mut root = serde_yaml::Mapping::new();
        root.insert("cam0".into(), serde_yaml::Value::Mapping(cam));

        let yaml_string =
            serde_yaml::to_string(&root).map_err(|e| CameraModelError::YamlError(e.to_string()))?;
        fs::write(path, yaml_string)?;
        Ok(())
    }

    fn distort(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta * theta;
        theta * (1.0 + theta2 * (k1 + theta2 * (k2 + theta2 * (k3 + theta2 * k4))))
    }

    fn distort_derivative(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta * theta;
        1.0 + theta2 * (3.0 * k1 + theta2 * (5.0 * k2 + theta2 * (7.0 * k3 + theta2 * 9.0 * k4)))
    }

    fn normalized_radius(&self, u: f64, v: f64) -> f64 {
        let mx = (u - self.intrinsics.cx) / self.intrinsics.fx;
        let my = (v - self.intrinsics.cy) / self.intrinsics.fy;
        mx.hypot(my)
    }

    /// Ray angle reached at the farthest image corner.
    fn compute_field_of_view(&self) -> Result<f64, CameraModelError> {
        let w = self.resolution.width as f64;
        let h = self.resolution.height as f64;
        let target = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .iter()
            .map(|&(u, v)| self.normalized_radius(u, v))
            .fold(0.0, f64::max);

        let step = std::f64::consts::PI / FOV_SCAN_STEPS as f64;
        let mut lower = 0.0;
        for i in 1..=FOV_SCAN_STEPS {
            let theta = step * i as f64;
            if self.distort_derivative(theta) <= 0.0 {
                return Err(CameraModelError::InvalidParams(format!(
                    "distortion polynomial stops increasing at {:.2} deg inside the image",
                    theta.to_degrees()
                )));
            }
            if self.distort(theta) >= target {
                let mut upper = theta;
                while upper - lower > 1e-12 {
                    let mid = 0.5 * (lower + upper);
                    if self.distort(mid) < target {
                        lower = mid;
                    } else {
                        upper = mid;
                    }
                }
                return Ok(upper);
            }
            lower = theta;
        }
        Ok(std::f64::consts::PI)
    }
}

impl CameraModel for KannalaBrandtModel {
    fn project<T: RealField>(&self, point_3d: &Vector3<T>) -> Result<Vector2<T>, CameraModelError> {
        let x = point_3d.x.clone();
        let y = point_3d.y.clone();
        let z = point_3d.z.clone();

        let r_squared = x.clone() * x.clone() + y.clone() * y.clone();
        if r_squared == T::zero() {
            if z > T::zero() {
                return Ok(Vector2::new(
                    nalgebra::convert(self.intrinsics.cx),
                    nalgebra::convert(self.intrinsics.cy),
                ));
            }
            return Err(if z == T::zero() {
                CameraModelError::PointAtCameraCenter
            } else {
                CameraModelError::OutOfFieldOfView
            });
        }

        let r = r_squared.sqrt();
        let theta = r.clone().atan2(z);
        if theta > nalgebra::convert::<f64, T>(self.field_of_view + FOV_TOLERANCE) {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta.clone() * theta.clone();
        let theta_d = theta
            * (T::one()
                + theta2.clone()
                    * (nalgebra::convert::<f64, T>(k1)
                        + theta2.clone()
                            * (nalgebra::convert::<f64, T>(k2)
                                + theta2.clone()
                                    * (nalgebra::convert::<f64, T>(k3)
                                        + theta2 * nalgebra::convert::<f64, T>(k4)))));

        let fx = nalgebra::convert::<f64, T>(self.intrinsics.fx);
        let fy = nalgebra::convert::<f64, T>(self.intrinsics.fy);
        let u = fx * theta_d.clone() * x / r.clone() + nalgebra::convert(self.intrinsics.cx);
        let v = fy * theta_d * y / r + nalgebra::convert(self.intrinsics.cy);
        Ok(Vector2::new(u, v))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let mx = (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx;
        let my = (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy;
        let theta_d = mx.hypot(my);
        if theta_d < NEWTON_TOLERANCE {
            return Ok(Vector3::new(0.0, 0.0, 1.0));
        }

        let mut theta = theta_d.min(self.field_of_view);
        let mut converged = false;
        for _ in 0..NEWTON_MAX_ITERATIONS {
            let step = (self.distort(theta) - theta_d) / self.distort_derivative(theta);
            theta -= step;
            if step.abs() < NEWTON_TOLERANCE {
                converged = true;
                break;
            }
        }

        if !converged || !theta.is_finite() || theta > self.field_of_view + FOV_TOLERANCE {
            return Err(CameraModelError::OutOfFieldOfView);
        }

        let scale = theta.sin() / theta_d;
        Ok(Vector3::new(mx * scale, my * scale, theta.cos()))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;
        validation::validate_coefficients("distortion", &self.distortions)?;
        self.compute_field_of_view().map(|_| ())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn field_of_view(&self) -> f64 {
        self.field_of_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::round_trip_drift;
    use approx::assert_relative_eq;

    fn sample_model() -> KannalaBrandtModel {
        KannalaBrandtModel::load_from_yaml("samples/kannala_brandt.yaml").unwrap()
    }

    #[test]
    fn test_kb_load_from_yaml() {
        let model = sample_model();
        assert_eq!(model.intrinsics().fx, 461.586);
        assert_eq!(model.intrinsics().cy, 249.080);
        assert_eq!(model.distortions()[0], -0.0125);
        assert_eq!(model.get_resolution().width, 752);
        assert_eq!(model.get_resolution().height, 480);
        assert!(model.field_of_view() > 0.9 && model.field_of_view() < 1.1);
    }

    #[test]
    fn test_kb_project_unproject() {
        let model = sample_model();
        let point_3d = Vector3::new(0.2, -0.1, 1.0);
        let pixel = model.project(&point_3d).unwrap();
        let ray = model.unproject(&pixel).unwrap();
        let expected = point_3d.normalize();
        assert_relative_eq!(ray.x, expected.x, epsilon = 1e-9);
        assert_relative_eq!(ray.y, expected.y, epsilon = 1e-9);
        assert_relative_eq!(ray.z, expected.z, epsilon = 1e-9);

        assert!(round_trip_drift(&model, 200).unwrap() < 1e-6);
    }

    #[test]
    fn test_kb_field_of_view_limits() {
        let model = sample_model();
        let fov = model.field_of_view();
        let inside = Vector3::new((fov - 1e-3).sin(), 0.0, (fov - 1e-3).cos());
        assert!(model.project(&inside).is_ok());
        let outside = Vector3::new((fov + 1e-3).sin(), 0.0, (fov + 1e-3).cos());
        assert!(matches!(
            model.project(&outside),
            Err(CameraModelError::OutOfFieldOfView)
        ));
        assert!(matches!(
            model.unproject(&Vector2::new(-5.0, 10.0)),
            Err(CameraModelError::OutOfFieldOfView)
        ));
    }

    #[test]
    fn test_kb_save_and_reload() {
        let model = sample_model();
        let path = std::env::temp_dir().join("fisheye_calib_kb_roundtrip.yaml");
        model.save_to_yaml(&path).unwrap();
        let reloaded = KannalaBrandtModel::load_from_yaml(&path).unwrap();
        assert_eq!(reloaded.distortions(), model.distortions());
        assert_eq!(reloaded.get_resolution(), model.get_resolution());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_kb_rejects_out_of_range_resolution() {
        let sample = fs::read_to_string("samples/kannala_brandt.yaml").unwrap();
        for (index, resolution) in ["[-752, 480]", "[752, 5000000000]"].iter().enumerate() {
            let path = std::env::temp_dir().join(format!("fisheye_calib_kb_resolution_{index}.yaml"));
            fs::write(&path, sample.replace("[752, 480]", resolution)).unwrap();
            let result = KannalaBrandtModel::load_from_yaml(&path);
            let _ = fs::remove_file(&path);
            assert!(matches!(result, Err(CameraModelError::InvalidParams(_))));
        }
    }

    #[test]
    fn test_kb_rejects_non_monotonic_distortion() {
        let result = KannalaBrandtModel::new(
            Intrinsics {
                fx: 300.0,
                fy: 300.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
            [-0.5, 0.0, 0.0, 0.0],
        );
        assert!(matches!(result, Err(CameraModelError::InvalidParams(_))));
    }
}
