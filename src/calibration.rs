//! Calibration workflows.
//!
//! [`Calibrator`] owns the validated settings and the primary camera and runs
//! the three calibration scenarios on top of the estimator and the refiner:
//!
//! * camera-from-target pose from one correspondence set,
//! * camera-to-camera extrinsics from frames seen by both cameras,
//! * camera-to-range-sensor extrinsics from frames pairing an image with a scan.

use crate::camera::CameraModel;
use crate::config::{RunMode, Settings};
use crate::correspondence::{Correspondence, CorrespondenceSet, RangeScan};
use crate::geometry::{round_trip_drift, Pose};
use crate::optimization::{
    LevenbergMarquardt, OptimizationResult, PointToPlaneResidual, Refiner, ReprojectionResidual,
    SolverBackend, StackedResidual,
};
use crate::pose_estimation::{LinearPoseEstimator, PoseEstimator, MIN_CORRESPONDENCES};
use crate::reprojection::{
    compute_reprojection_error, reprojection_errors, validate, ProjectionError,
};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

pub use crate::error::CalibrationError;

/// Number of image samples used for the round-trip drift check.
const DRIFT_SAMPLES: usize = 400;

/// Target planes needed to fix a camera-from-range-sensor pose; each plane
/// constrains one translation and two rotation parameters.
pub const MIN_RANGE_FRAMES: usize = 3;

/// Camera-from-target pose of one correspondence set.
#[derive(Debug, Clone, Serialize)]
pub struct TargetPoseReport {
    /// Linear estimate used to seed the refinement.
    pub initial_pose: Pose,
    pub optimization: OptimizationResult,
    pub projection_error: ProjectionError,
    /// Correspondences that entered the solve.
    pub used: Vec<usize>,
    /// Valid correspondences dropped for lying outside the field of view.
    pub excluded: Vec<usize>,
}

impl TargetPoseReport {
    pub fn pose(&self) -> &Pose {
        &self.optimization.pose
    }
}

/// Target observed by two cameras at the same instant.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub first: CorrespondenceSet,
    pub second: CorrespondenceSet,
}

/// Target observed by the camera together with a range scan of it.
#[derive(Debug, Clone)]
pub struct RangeFrame {
    pub image: CorrespondenceSet,
    pub scan: RangeScan,
}

/// Result of a cross-sensor calibration.
#[derive(Debug, Clone, Serialize)]
pub struct ExtrinsicsReport {
    /// Second camera (or range sensor) relative to the primary camera, as
    /// `second_from_first` for camera pairs and `camera_from_sensor` for range
    /// sensors.
    pub pose: Pose,
    pub optimization: OptimizationResult,
    pub frames_used: Vec<usize>,
    pub frames_skipped: Vec<usize>,
    /// Reprojection statistics in the second camera, camera pairs only.
    pub projection_error: Option<ProjectionError>,
    /// Range points landing on the target at the refined pose, range sensors only.
    pub points_on_target: Option<usize>,
}

/// Recovery of a known pose from synthetic observations.
#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub ground_truth: Pose,
    pub recovered: TargetPoseReport,
    pub rotation_error_deg: f64,
    pub translation_error: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CalibrationReport {
    Live(TargetPoseReport),
    Synthetic(SelfTestReport),
}

impl CalibrationReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Estimates and refines a camera-from-target pose for any camera model.
fn solve_target_pose<C, B>(
    camera: &Arc<C>,
    correspondences: &CorrespondenceSet,
    estimator: &LinearPoseEstimator,
    refiner: &Refiner<B>,
) -> Result<TargetPoseReport, CalibrationError>
where
    C: CameraModel + 'static,
    B: SolverBackend,
{
    let estimate = estimator.estimate(correspondences, camera.as_ref())?;
    let residual = ReprojectionResidual::new(Arc::clone(camera), correspondences, &estimate.pose);
    if residual.active().len() < MIN_CORRESPONDENCES {
        return Err(CalibrationError::InsufficientCorrespondences {
            found: residual.active().len(),
            required: MIN_CORRESPONDENCES,
        });
    }
    let optimization = refiner.refine(&estimate.pose, &residual)?;
    let projection_error =
        compute_reprojection_error(&optimization.pose, correspondences, camera.as_ref())?;
    info!("target pose: {projection_error:?}");

    Ok(TargetPoseReport {
        initial_pose: estimate.pose,
        optimization,
        projection_error,
        used: residual.active().to_vec(),
        excluded: residual.excluded().to_vec(),
    })
}

pub struct Calibrator<C, B = LevenbergMarquardt> {
    settings: Settings,
    camera: Arc<C>,
    refiner: Refiner<B>,
    estimator: LinearPoseEstimator,
}

impl<C: CameraModel + 'static> Calibrator<C, LevenbergMarquardt> {
    /// Validates the settings and the camera and prepares the in-crate solver.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::Config`] if the settings are not usable.
    /// * [`CalibrationError::Camera`] if the camera parameters are invalid.
    /// * [`CalibrationError::InvalidInput`] if the camera resolution differs
    ///   from the configured image size.
    pub fn new(settings: Settings, camera: C) -> Result<Self, CalibrationError> {
        let refiner = Refiner::new(settings.refinement.clone());
        Self::with_backend(settings, camera, refiner)
    }
}

impl<C: CameraModel + 'static, B: SolverBackend> Calibrator<C, B> {
    pub fn with_backend(
        settings: Settings,
        camera: C,
        refiner: Refiner<B>,
    ) -> Result<Self, CalibrationError> {
        settings.validate()?;
        camera.validate_params()?;

        let resolution = camera.get_resolution();
        if resolution.width != settings.image.width || resolution.height != settings.image.height {
            return Err(CalibrationError::InvalidInput(format!(
                "camera resolution {}x{} does not match configured image size {}x{}",
                resolution.width, resolution.height, settings.image.width, settings.image.height
            )));
        }

        let drift = round_trip_drift(&camera, DRIFT_SAMPLES)?;
        if drift > settings.round_trip_tolerance {
            warn!(
                "calibration round trip drifts by {drift:.2e} px (tolerance {:.2e}); check the coefficient file",
                settings.round_trip_tolerance
            );
        }

        Ok(Calibrator {
            settings,
            camera: Arc::new(camera),
            refiner,
            estimator: LinearPoseEstimator::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Camera-from-target pose with reprojection statistics.
    pub fn target_pose(
        &self,
        correspondences: &CorrespondenceSet,
    ) -> Result<TargetPoseReport, CalibrationError> {
        solve_target_pose(&self.camera, correspondences, &self.estimator, &self.refiner)
    }

    /// Pose of `second` relative to the calibrated camera from frames seen by
    /// both. Frames whose target pose cannot be solved in the first camera are
    /// skipped.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::NoUsableFrames`] if no frame yields a seed.
    pub fn camera_pair<S: CameraModel + 'static>(
        &self,
        second: &Arc<S>,
        frames: &[StereoFrame],
    ) -> Result<ExtrinsicsReport, CalibrationError> {
        let mut seed = None;
        let mut blocks = Vec::new();
        let mut in_first_frame = Vec::new();
        let mut frames_used = Vec::new();
        let mut frames_skipped = Vec::new();

        for (index, frame) in frames.iter().enumerate() {
            let first_from_target = match self.target_pose(&frame.first) {
                Ok(report) => *report.pose(),
                Err(e) => {
                    warn!("frame {index} skipped: {e}");
                    frames_skipped.push(index);
                    continue;
                }
            };

            if seed.is_none() {
                match solve_target_pose(second, &frame.second, &self.estimator, &self.refiner) {
                    Ok(report) => seed = Some(report.pose().compose(&first_from_target.inverse())),
                    Err(e) => {
                        warn!("frame {index} skipped: no pose in the second camera: {e}");
                        frames_skipped.push(index);
                        continue;
                    }
                }
            }

            // Target points expressed in the first camera frame.
            let observations = frame.second.transformed(&first_from_target);
            in_first_frame.push(observations);
            frames_used.push(index);
        }

        let seed = seed.ok_or(CalibrationError::NoUsableFrames)?;
        for observations in &in_first_frame {
            blocks.push(ReprojectionResidual::new(Arc::clone(second), observations, &seed));
        }
        let residual = StackedResidual::new(blocks);
        let optimization = self.refiner.refine(&seed, &residual)?;

        let mut errors = Vec::new();
        for observations in &in_first_frame {
            errors.extend(
                reprojection_errors(&optimization.pose, observations, second.as_ref())
                    .into_iter()
                    .map(|(_, e)| e),
            );
        }
        let projection_error = ProjectionError::from_errors(&errors);
        info!(
            "camera pair from {} frames ({} skipped): {projection_error:?}",
            frames_used.len(),
            frames_skipped.len()
        );

        Ok(ExtrinsicsReport {
            pose: optimization.pose,
            optimization,
            frames_used,
            frames_skipped,
            projection_error,
            points_on_target: None,
        })
    }

    /// Camera-from-range-sensor pose from frames pairing a target image with a
    /// range scan, seeded with the configured initial guess.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidInput`] if the settings carry no initial guess.
    /// * [`CalibrationError::NoUsableFrames`] if no target pose can be solved.
    /// * [`CalibrationError::DegenerateConfiguration`] if no range point lands
    ///   on the target at the initial guess, or the target planes do not fix
    ///   all six parameters (fewer than three planes with independent normals).
    pub fn camera_range(&self, frames: &[RangeFrame]) -> Result<ExtrinsicsReport, CalibrationError> {
        let seed = self.settings.initial_guess()?.ok_or_else(|| {
            CalibrationError::InvalidInput(
                "camera to range sensor calibration needs an initial_guess".to_string(),
            )
        })?;
        let footprint = self.settings.target_geometry().footprint();

        let mut blocks = Vec::new();
        let mut frames_used = Vec::new();
        let mut frames_skipped = Vec::new();
        for (index, frame) in frames.iter().enumerate() {
            if frame.scan.is_empty() {
                warn!("frame {index} skipped: empty range scan");
                frames_skipped.push(index);
                continue;
            }
            match self.target_pose(&frame.image) {
                Ok(report) => {
                    blocks.push(PointToPlaneResidual::new(report.pose(), &frame.scan, footprint));
                    frames_used.push(index);
                }
                Err(e) => {
                    warn!("frame {index} skipped: {e}");
                    frames_skipped.push(index);
                }
            }
        }
        if blocks.is_empty() {
            return Err(CalibrationError::NoUsableFrames);
        }

        if blocks.len() < MIN_RANGE_FRAMES {
            warn!(
                "{} target planes constrain at most {} of the 6 pose parameters",
                blocks.len(),
                3 * blocks.len()
            );
        }
        let on_target_at_seed: usize = blocks.iter().map(|b| b.points_on_target(&seed)).sum();
        if on_target_at_seed == 0 {
            return Err(CalibrationError::DegenerateConfiguration(
                "no range point falls on the target at the initial guess".to_string(),
            ));
        }

        let residual = StackedResidual::new(blocks);
        let optimization = self.refiner.refine(&seed, &residual)?;
        let points_on_target = residual
            .blocks()
            .iter()
            .map(|b| b.points_on_target(&optimization.pose))
            .sum();
        info!(
            "camera to range sensor from {} frames ({} skipped), {points_on_target} points on target",
            frames_used.len(),
            frames_skipped.len()
        );

        Ok(ExtrinsicsReport {
            pose: optimization.pose,
            optimization,
            frames_used,
            frames_skipped,
            projection_error: None,
            points_on_target: Some(points_on_target),
        })
    }

    /// Projects the target corners through the configured ground truth and
    /// recovers the pose from those pixels.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] outside synthetic mode.
    pub fn self_test(&self) -> Result<SelfTestReport, CalibrationError> {
        let RunMode::Synthetic { ground_truth } = self.settings.run_mode()? else {
            return Err(CalibrationError::InvalidInput(
                "self test requires mode: synthetic".to_string(),
            ));
        };

        let points = self.settings.target_geometry().corner_positions();
        let correspondences: CorrespondenceSet = points
            .iter()
            .zip(validate(&ground_truth, &points, self.camera.as_ref()))
            .filter_map(|(point, pixel)| {
                pixel.ok().map(|pixel| Correspondence::new(*point, pixel))
            })
            .collect();
        info!(
            "self test: {} of {} target points visible",
            correspondences.len(),
            points.len()
        );

        let recovered = self.target_pose(&correspondences)?;
        let rotation_error_deg = recovered.pose().rotation_angle_to(&ground_truth).to_degrees();
        let translation_error = recovered.pose().translation_distance_to(&ground_truth);
        info!(
            "self test: rotation error {rotation_error_deg:.2e} deg, translation error {translation_error:.2e} m"
        );

        Ok(SelfTestReport {
            ground_truth,
            recovered,
            rotation_error_deg,
            translation_error,
        })
    }

    /// Runs the configured mode: the self test in synthetic mode, a target
    /// pose solve on `input` in live mode.
    pub fn run(
        &self,
        input: Option<&CorrespondenceSet>,
    ) -> Result<CalibrationReport, CalibrationError> {
        match self.settings.run_mode()? {
            RunMode::Synthetic { .. } => Ok(CalibrationReport::Synthetic(self.self_test()?)),
            RunMode::Live => {
                let correspondences = input.ok_or_else(|| {
                    CalibrationError::InvalidInput(
                        "live mode needs a correspondence set".to_string(),
                    )
                })?;
                Ok(CalibrationReport::Live(self.target_pose(correspondences)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::OcamModel;
    use crate::config::ModeKind;

    fn calibrator(mode: ModeKind) -> Calibrator<OcamModel> {
        let mut settings = Settings::load("samples/settings.yaml").unwrap();
        settings.mode = mode;
        let camera = OcamModel::load_from_txt("samples/ocam_calib.txt").unwrap();
        Calibrator::new(settings, camera).unwrap()
    }

    #[test]
    fn test_self_test_recovers_ground_truth() {
        let report = calibrator(ModeKind::Synthetic).self_test().unwrap();
        assert_eq!(report.recovered.used.len(), 70);
        assert!(report.rotation_error_deg < 0.1);
        assert!(report.translation_error < 1e-3);
        assert!(report.recovered.projection_error.rmse < 1e-3);
    }

    #[test]
    fn test_live_mode_requires_input() {
        let calibrator = calibrator(ModeKind::Live);
        assert!(matches!(
            calibrator.run(None),
            Err(CalibrationError::InvalidInput(_))
        ));
        assert!(matches!(
            calibrator.self_test(),
            Err(CalibrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let mut settings = Settings::load("samples/settings.yaml").unwrap();
        settings.target.square_size = -1.0;
        let camera = OcamModel::load_from_txt("samples/ocam_calib.txt").unwrap();
        assert!(!settings.good_input());
        assert!(matches!(
            Calibrator::new(settings, camera),
            Err(CalibrationError::Config(_))
        ));
    }

    #[test]
    fn test_synthetic_report_serializes() {
        let report = calibrator(ModeKind::Synthetic).run(None).unwrap();
        let json = report.to_json().unwrap();
        assert!(json.contains("\"mode\": \"synthetic\""));
        assert!(json.contains("rotation_error_deg"));
    }
}
