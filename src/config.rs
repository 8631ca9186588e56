//! Calibration settings loaded from YAML.
//!
//! Lengths in the file are expressed in [`Units`]; every accessor that hands
//! a length to the calibration core converts it to meters first.

use crate::geometry::Pose;
use crate::optimization::SolveOptions;
use crate::target::{TargetGeometry, TargetKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Failed to parse settings: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Invalid option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IOError(err.to_string())
    }
}

fn invalid(option: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    #[default]
    Millimeters,
    Meters,
}

impl Units {
    pub fn to_meters(self, value: f64) -> f64 {
        match self {
            Units::Millimeters => value / 1000.0,
            Units::Meters => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    #[default]
    Live,
    Synthetic,
}

/// Resolved run mode. Synthetic runs carry the pose the self-test must recover.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    Live,
    Synthetic { ground_truth: Pose },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub kind: TargetKind,
    pub rows: usize,
    pub cols: usize,
    pub square_size: f64,
    #[serde(default)]
    pub tag_spacing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSettings {
    pub width: u32,
    pub height: u32,
}

/// A rigid transform as written in the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoseSettings {
    /// Unit quaternion `[w, x, y, z]`.
    pub rotation: [f64; 4],
    /// Translation in the settings' units.
    pub translation: [f64; 3],
}

impl PoseSettings {
    fn to_pose(&self, units: Units, option: &str) -> Result<Pose, ConfigError> {
        if !self.translation.iter().all(|v| v.is_finite()) {
            return Err(invalid(option, "translation must be finite"));
        }
        let translation = self.translation.map(|v| units.to_meters(v));
        Pose::from_quaternion(self.rotation, translation)
            .ok_or_else(|| invalid(option, "rotation must be a unit quaternion [w, x, y, z]"))
    }
}

fn default_round_trip_tolerance() -> f64 {
    1e-3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub target: TargetSettings,
    #[serde(default)]
    pub units: Units,
    pub image: ImageSettings,
    #[serde(default)]
    pub initial_guess: Option<PoseSettings>,
    #[serde(default)]
    pub mode: ModeKind,
    #[serde(default)]
    pub synthetic: Option<PoseSettings>,
    #[serde(default)]
    pub refinement: SolveOptions,
    /// Largest acceptable pixel drift of `project(unproject(p))`.
    #[serde(default = "default_round_trip_tolerance")]
    pub round_trip_tolerance: f64,
}

impl Settings {
    /// Loads and validates settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let target = &self.target;
        if target.rows == 0 || target.cols == 0 {
            return Err(invalid("target", "rows and cols must be positive"));
        }
        if !(target.square_size.is_finite() && target.square_size > 0.0) {
            return Err(invalid("target.square_size", "must be positive"));
        }
        if !(target.tag_spacing.is_finite() && target.tag_spacing >= 0.0) {
            return Err(invalid("target.tag_spacing", "must be non-negative"));
        }
        if target.kind == TargetKind::Chessboard && target.rows * target.cols < 4 {
            return Err(invalid("target", "a chessboard needs at least 4 corners"));
        }
        if self.image.width == 0 || self.image.height == 0 {
            return Err(invalid("image", "width and height must be positive"));
        }
        if !(self.round_trip_tolerance.is_finite() && self.round_trip_tolerance > 0.0) {
            return Err(invalid("round_trip_tolerance", "must be positive"));
        }
        self.refinement
            .validate()
            .map_err(|reason| invalid("refinement", reason))?;
        self.initial_guess()?;
        self.run_mode()?;
        Ok(())
    }

    /// `true` when the settings can drive a calibration run.
    pub fn good_input(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn square_size_m(&self) -> f64 {
        self.units.to_meters(self.target.square_size)
    }

    pub fn target_geometry(&self) -> TargetGeometry {
        match self.target.kind {
            TargetKind::Chessboard => {
                TargetGeometry::chessboard(self.target.rows, self.target.cols, self.square_size_m())
            }
            TargetKind::AprilGrid => TargetGeometry::april_grid(
                self.target.rows,
                self.target.cols,
                self.square_size_m(),
                self.target.tag_spacing,
            ),
        }
    }

    /// Seed for cross-sensor calibration, in meters.
    pub fn initial_guess(&self) -> Result<Option<Pose>, ConfigError> {
        self.initial_guess
            .as_ref()
            .map(|guess| guess.to_pose(self.units, "initial_guess"))
            .transpose()
    }

    pub fn run_mode(&self) -> Result<RunMode, ConfigError> {
        match self.mode {
            ModeKind::Live => Ok(RunMode::Live),
            ModeKind::Synthetic => {
                let pose = self
                    .synthetic
                    .as_ref()
                    .ok_or_else(|| invalid("synthetic", "required when mode is synthetic"))?;
                Ok(RunMode::Synthetic {
                    ground_truth: pose.to_pose(self.units, "synthetic")?,
                })
            }
        }
    }
}
