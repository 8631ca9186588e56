//! Fisheye Calibration Library
//!
//! Pose calibration for wide-angle cameras: the pose of a calibration target
//! in the camera, the extrinsics between two cameras, and the extrinsics
//! between a camera and a range sensor.
//!
//! The core is built from three pieces:
//! - Camera models ([`OcamModel`] omnidirectional polynomial model and
//!   [`KannalaBrandtModel`]) mapping rays to pixels and back
//! - A linear pose estimator on unit bearing vectors ([`LinearPoseEstimator`])
//! - A nonlinear refiner over generic pose residuals ([`Refiner`]) with an
//!   in-crate Levenberg-Marquardt backend and a tiny-solver backend
//!
//! [`Calibrator`] ties them together with the settings loaded from YAML.

pub mod calibration;
pub mod camera;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod geometry;
pub mod optimization;
pub mod pose_estimation;
pub mod reprojection;
pub mod target;

// Re-export commonly used types
pub use calibration::{
    CalibrationReport, Calibrator, ExtrinsicsReport, RangeFrame, SelfTestReport, StereoFrame,
    TargetPoseReport,
};
pub use camera::{
    CameraIntrinsics, CameraModel, CameraModelError, Intrinsics, KannalaBrandtModel, OcamModel,
    Resolution,
};
pub use config::{ConfigError, RunMode, Settings, Units};
pub use correspondence::{Correspondence, CorrespondenceError, CorrespondenceSet, RangeScan};
pub use error::CalibrationError;
pub use geometry::Pose;
pub use optimization::{
    LevenbergMarquardt, OptimizationResult, PointToPlaneResidual, PoseResidual, Refiner,
    ReprojectionResidual, SolveOptions, SolverBackend, SolverStatus, StackedResidual,
    TinySolverBackend,
};
pub use pose_estimation::{LinearPoseEstimator, PoseEstimate, PoseEstimator};
pub use reprojection::{compute_reprojection_error, validate, ProjectionError};
pub use target::{TargetFootprint, TargetGeometry, TargetKind};
