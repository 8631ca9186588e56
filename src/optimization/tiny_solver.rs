//! Alternate refinement backend built on the `tiny_solver` crate.
//!
//! Any [`PoseResidual`] is wrapped as a single `tiny_solver` factor over one
//! six-dimensional variable; `tiny_solver` differentiates it with its own dual
//! numbers. The crate's optimizer does not report iteration counts, so the
//! report carries `iterations == 0` and a two-entry cost history.

use super::{PoseResidual, SolveOptions, SolverBackend, SolverReport, SolverStatus};
use ::tiny_solver::factors::Factor;
use ::tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};
use log::{debug, info};
use nalgebra::{DVector, RealField, Vector6};
use std::collections::HashMap;

const POSE_KEY: &str = "pose";

/// Residual value substituted for rows that cannot be evaluated.
const UNEVALUABLE_RESIDUAL: f64 = 1e6;

#[derive(Debug, Clone, Copy, Default)]
pub struct TinySolverBackend;

#[derive(Clone)]
struct PoseFactor<R> {
    residual: R,
}

impl<T: RealField, R: PoseResidual> Factor<T> for PoseFactor<R> {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        self.residual
            .residuals(params[0].as_slice())
            .unwrap_or_else(|| {
                DVector::from_element(
                    self.residual.num_residuals(),
                    nalgebra::convert::<f64, T>(UNEVALUABLE_RESIDUAL),
                )
            })
    }
}

impl SolverBackend for TinySolverBackend {
    fn name(&self) -> &'static str {
        "tiny-solver"
    }

    fn solve<R: PoseResidual>(
        &self,
        residual: &R,
        initial: &Vector6<f64>,
        _options: &SolveOptions,
    ) -> SolverReport {
        let mut report = SolverReport {
            parameters: *initial,
            initial_cost: f64::INFINITY,
            cost: f64::INFINITY,
            iterations: 0,
            cost_history: Vec::new(),
            status: SolverStatus::Diverged,
        };

        let Some(initial_cost) = residual.cost(initial) else {
            report.status = SolverStatus::Degenerate;
            return report;
        };
        report.initial_cost = initial_cost;
        report.cost = initial_cost;
        report.cost_history.push(initial_cost);

        let mut problem = ::tiny_solver::Problem::new();
        problem.add_residual_block(
            residual.num_residuals(),
            &[POSE_KEY],
            Box::new(PoseFactor {
                residual: residual.clone(),
            }),
            None,
        );

        let mut initial_values = HashMap::new();
        initial_values.insert(
            POSE_KEY.to_string(),
            DVector::from_column_slice(initial.as_slice()),
        );

        info!("Starting optimization with tiny-solver Levenberg-Marquardt...");
        let optimizer = LevenbergMarquardtOptimizer::default();
        let Some(result) = optimizer.optimize(&problem, &initial_values, None) else {
            debug!("tiny-solver returned no solution");
            return report;
        };

        let Some(solution) = result.get(POSE_KEY).filter(|v| v.len() == 6) else {
            return report;
        };
        let parameters = Vector6::from_column_slice(solution.as_slice());
        let Some(cost) = residual.cost(&parameters) else {
            return report;
        };

        if cost > initial_cost || !cost.is_finite() {
            report.cost = cost;
            return report;
        }

        report.parameters = parameters;
        report.cost = cost;
        report.cost_history.push(cost);
        report.status = SolverStatus::Converged;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::OcamModel;
    use crate::correspondence::CorrespondenceSet;
    use crate::geometry::Pose;
    use crate::optimization::{ReprojectionResidual, Refiner};
    use crate::reprojection::validate;
    use crate::target::TargetGeometry;
    use std::sync::Arc;

    #[test]
    fn test_tiny_solver_recovers_board_pose() {
        let camera = Arc::new(OcamModel::load_from_txt("samples/ocam_calib.txt").unwrap());
        let truth = Pose::from_parameters(&Vector6::new(0.1, -0.15, 0.05, -0.2, -0.15, 0.8));
        let points = TargetGeometry::chessboard(5, 6, 0.05).corner_positions();
        let pixels = validate(&truth, &points, camera.as_ref())
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let set = CorrespondenceSet::from_pairs(points, pixels).unwrap();

        let seed = Pose::from_parameters(&Vector6::new(0.12, -0.13, 0.06, -0.19, -0.16, 0.82));
        let residual = ReprojectionResidual::new(camera, &set, &seed);
        let refiner = Refiner::with_backend(TinySolverBackend, SolveOptions::default());
        let result = refiner.refine(&seed, &residual).unwrap();

        assert!(result.cost <= result.initial_cost);
        assert!(result.pose.rotation_angle_to(&truth).to_degrees() < 0.1);
        assert!(result.pose.translation_distance_to(&truth) < 1e-3);
    }
}
