//! Nonlinear pose refinement.
//!
//! A refinement problem is described by a [`PoseResidual`]: a residual vector
//! over the six pose parameters `[w (axis-angle), t]`. The residual is written
//! once, generically over [`RealField`], and evaluated with `f64` for costs and
//! with dual numbers for Jacobians. A [`SolverBackend`] turns a residual and a
//! seed into refined parameters and a convergence report; the [`Refiner`]
//! wraps a backend and maps its report to the crate's result and error types.
//!
//! Two residual families are provided:
//!
//! * [`ReprojectionResidual`]: observed pixel minus projected target point
//!   (camera-to-target and camera-to-camera calibration).
//! * [`PointToPlaneResidual`]: distance of range-sensor points to the target
//!   plane, gated by the target footprint (camera-to-range-sensor calibration).

use crate::error::CalibrationError;
use crate::geometry::Pose;
use log::{info, warn};
use nalgebra::{DVector, RealField, Vector6};
use serde::{Deserialize, Serialize};

pub mod levenberg_marquardt;
pub mod point_to_plane;
pub mod reprojection;
pub mod tiny_solver;

pub use self::levenberg_marquardt::LevenbergMarquardt;
use self::levenberg_marquardt::{linearize, normal_matrix, weakest_constraint};
pub use self::point_to_plane::PointToPlaneResidual;
pub use self::reprojection::ReprojectionResidual;
pub use self::tiny_solver::TinySolverBackend;

/// Number of pose parameters: axis-angle rotation followed by translation.
pub const POSE_DIM: usize = 6;

/// A residual vector over a pose.
///
/// Implementations must return the same number of rows for every parameter
/// vector. `None` means the residual cannot be evaluated at these parameters
/// (for example a point leaves the field of view); solvers treat such a step
/// as a failed step.
pub trait PoseResidual: Clone + Send + Sync + 'static {
    fn num_residuals(&self) -> usize;

    fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>>;

    /// Sum of squared residuals at `parameters`.
    fn cost(&self, parameters: &Vector6<f64>) -> Option<f64> {
        self.residuals(parameters.as_slice())
            .map(|r| r.norm_squared())
    }
}

/// Several residual blocks sharing one pose, stacked into one vector.
#[derive(Debug, Clone)]
pub struct StackedResidual<R> {
    blocks: Vec<R>,
}

impl<R: PoseResidual> StackedResidual<R> {
    pub fn new(blocks: Vec<R>) -> Self {
        StackedResidual { blocks }
    }

    pub fn blocks(&self) -> &[R] {
        &self.blocks
    }
}

impl<R: PoseResidual> PoseResidual for StackedResidual<R> {
    fn num_residuals(&self) -> usize {
        self.blocks.iter().map(|b| b.num_residuals()).sum()
    }

    fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>> {
        let mut stacked = DVector::zeros(self.num_residuals());
        let mut offset = 0;
        for block in &self.blocks {
            let r = block.residuals(parameters)?;
            stacked.rows_mut(offset, r.len()).copy_from(&r);
            offset += r.len();
        }
        Some(stacked)
    }
}

/// Termination criteria and damping schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolveOptions {
    /// Maximum number of accepted steps.
    pub max_iterations: usize,
    /// Relative tolerance on the (predicted or actual) cost decrease.
    pub cost_tolerance: f64,
    /// Relative tolerance on the parameter update.
    pub parameter_tolerance: f64,
    /// Absolute tolerance on the gradient norm.
    pub gradient_tolerance: f64,
    pub initial_damping: f64,
    /// Lower bound on the weakest constraint of the normal equations, see
    /// [`levenberg_marquardt::weakest_constraint`]. Problems at or below it are
    /// degenerate.
    pub degeneracy_tolerance: f64,
    /// Consecutive rejected steps after which the solve is declared diverged.
    pub max_damping_attempts: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            parameter_tolerance: 1e-12,
            gradient_tolerance: 1e-14,
            initial_damping: 1e-3,
            degeneracy_tolerance: 1e-12,
            max_damping_attempts: 12,
        }
    }
}

impl SolveOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be positive".to_string());
        }
        if self.max_damping_attempts == 0 {
            return Err("max_damping_attempts must be positive".to_string());
        }
        let tolerances = [
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.degeneracy_tolerance,
        ];
        if tolerances.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err("tolerances must be finite and non-negative".to_string());
        }
        if !(self.initial_damping.is_finite() && self.initial_damping > 0.0) {
            return Err("initial_damping must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Converged,
    MaxIterationsReached,
    Diverged,
    Degenerate,
}

/// Raw outcome of a backend run.
#[derive(Debug, Clone)]
pub struct SolverReport {
    pub parameters: Vector6<f64>,
    pub initial_cost: f64,
    pub cost: f64,
    pub iterations: usize,
    /// Initial cost followed by the cost after every accepted step.
    pub cost_history: Vec<f64>,
    pub status: SolverStatus,
}

/// Strategy interface for least-squares backends.
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve<R: PoseResidual>(
        &self,
        residual: &R,
        initial: &Vector6<f64>,
        options: &SolveOptions,
    ) -> SolverReport;
}

/// Result of a successful refinement.
///
/// `status` is either [`SolverStatus::Converged`] or
/// [`SolverStatus::MaxIterationsReached`]; the latter marks a best-effort pose.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub pose: Pose,
    pub cost: f64,
    pub initial_cost: f64,
    pub iterations: usize,
    pub cost_history: Vec<f64>,
    pub status: SolverStatus,
}

impl OptimizationResult {
    pub fn converged(&self) -> bool {
        self.status == SolverStatus::Converged
    }
}

/// Refines a seed pose with a pluggable backend.
#[derive(Debug, Clone, Default)]
pub struct Refiner<B = LevenbergMarquardt> {
    backend: B,
    options: SolveOptions,
}

impl Refiner<LevenbergMarquardt> {
    pub fn new(options: SolveOptions) -> Self {
        Refiner {
            backend: LevenbergMarquardt,
            options,
        }
    }
}

impl<B: SolverBackend> Refiner<B> {
    pub fn with_backend(backend: B, options: SolveOptions) -> Self {
        Refiner { backend, options }
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Minimizes the residual starting at `seed`.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::DegenerateConfiguration`] if the residual has no
    ///   rows, cannot be evaluated at the seed, does not constrain all six
    ///   pose parameters there, or the normal equations turn singular.
    /// * [`CalibrationError::Diverged`] if no step could reduce the cost after
    ///   repeated damping. No pose is returned in that case.
    pub fn refine<R: PoseResidual>(
        &self,
        seed: &Pose,
        residual: &R,
    ) -> Result<OptimizationResult, CalibrationError> {
        if residual.num_residuals() == 0 {
            return Err(CalibrationError::DegenerateConfiguration(
                "refinement problem has no active residuals".to_string(),
            ));
        }

        let parameters = seed.to_parameters();
        let Some((_, jacobian)) = linearize(residual, &parameters) else {
            return Err(CalibrationError::DegenerateConfiguration(
                "refinement problem cannot be evaluated at the seed".to_string(),
            ));
        };
        let constraint = weakest_constraint(&normal_matrix(&jacobian));
        if constraint <= self.options.degeneracy_tolerance {
            return Err(CalibrationError::DegenerateConfiguration(format!(
                "residual does not determine the pose at the seed (weakest constraint {constraint:e})"
            )));
        }

        let report = self.backend.solve(residual, &parameters, &self.options);

        match report.status {
            SolverStatus::Converged | SolverStatus::MaxIterationsReached => {
                if report.status == SolverStatus::MaxIterationsReached {
                    warn!(
                        "{}: stopped after {} iterations without converging (cost {:e})",
                        self.backend.name(),
                        report.iterations,
                        report.cost
                    );
                } else {
                    info!(
                        "{}: converged in {} iterations, cost {:e} -> {:e}",
                        self.backend.name(),
                        report.iterations,
                        report.initial_cost,
                        report.cost
                    );
                }
                Ok(OptimizationResult {
                    pose: Pose::from_parameters(&report.parameters),
                    cost: report.cost,
                    initial_cost: report.initial_cost,
                    iterations: report.iterations,
                    cost_history: report.cost_history,
                    status: report.status,
                })
            }
            SolverStatus::Diverged => Err(CalibrationError::Diverged {
                iterations: report.iterations,
                cost: report.cost,
            }),
            SolverStatus::Degenerate => Err(CalibrationError::DegenerateConfiguration(
                "normal equations are singular or the seed cannot be evaluated".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Linear residual `x - target`.
    #[derive(Debug, Clone)]
    struct Offset {
        target: [f64; 6],
    }

    impl PoseResidual for Offset {
        fn num_residuals(&self) -> usize {
            6
        }

        fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>> {
            Some(DVector::from_iterator(
                6,
                (0..6).map(|i| parameters[i].clone() - nalgebra::convert::<f64, T>(self.target[i])),
            ))
        }
    }

    #[test]
    fn test_stacked_residual_concatenates_blocks() {
        let a = Offset { target: [1.0; 6] };
        let b = Offset { target: [2.0; 6] };
        let stacked = StackedResidual::new(vec![a, b]);
        assert_eq!(stacked.num_residuals(), 12);
        let r = stacked.residuals(&[0.0_f64; 6]).unwrap();
        assert_eq!(r[0], -1.0);
        assert_eq!(r[6], -2.0);
        assert_eq!(stacked.cost(&Vector6::zeros()), Some(30.0));
    }

    #[test]
    fn test_refiner_reaches_linear_minimum() {
        let residual = Offset {
            target: [0.1, -0.2, 0.05, 1.0, 2.0, 3.0],
        };
        let refiner = Refiner::new(SolveOptions::default());
        let result = refiner.refine(&Pose::identity(), &residual).unwrap();
        assert!(result.converged());
        assert!(result.cost < 1e-20);
        let params = result.pose.to_parameters();
        for i in 0..6 {
            assert!((params[i] - residual.target[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(SolveOptions::default().validate().is_ok());
        let bad = SolveOptions {
            initial_damping: 0.0,
            ..SolveOptions::default()
        };
        assert!(bad.validate().is_err());
        let negative = SolveOptions {
            degeneracy_tolerance: -1.0,
            ..SolveOptions::default()
        };
        assert!(negative.validate().is_err());
    }

    /// Only `x0 + x1` and the last four parameters are observed.
    #[derive(Debug, Clone)]
    struct Underdetermined;

    impl PoseResidual for Underdetermined {
        fn num_residuals(&self) -> usize {
            5
        }

        fn residuals<T: RealField>(&self, parameters: &[T]) -> Option<DVector<T>> {
            let mut r = DVector::zeros(5);
            r[0] = parameters[0].clone() + parameters[1].clone();
            for i in 2..6 {
                r[i - 1] = parameters[i].clone() - nalgebra::convert::<f64, T>(0.5);
            }
            Some(r)
        }
    }

    #[test]
    fn test_refiner_rejects_unconstrained_pose() {
        let refiner = Refiner::new(SolveOptions::default());
        let result = refiner.refine(&Pose::identity(), &Underdetermined);
        assert!(matches!(
            result,
            Err(CalibrationError::DegenerateConfiguration(_))
        ));

        let tiny = Refiner::with_backend(TinySolverBackend, SolveOptions::default());
        assert!(matches!(
            tiny.refine(&Pose::identity(), &Underdetermined),
            Err(CalibrationError::DegenerateConfiguration(_))
        ));
    }
}
