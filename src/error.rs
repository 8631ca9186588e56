use crate::camera::CameraModelError;
use crate::config::ConfigError;
use crate::correspondence::CorrespondenceError;

/// Failures of a pose solve or of a whole calibration workflow.
///
/// Per-point projection failures never show up here: they exclude the point
/// and the solve continues without it.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Insufficient correspondences: found {found}, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },
    #[error("Degenerate configuration: {0}")]
    DegenerateConfiguration(String),
    #[error("Refinement diverged after {iterations} iterations (cost {cost:e})")]
    Diverged { iterations: usize, cost: f64 },
    #[error("No frame could be used for calibration")]
    NoUsableFrames,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Correspondence(#[from] CorrespondenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
