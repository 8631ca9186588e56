//! Damped Gauss-Newton (Levenberg-Marquardt) backend.
//!
//! Jacobians are computed with forward-mode automatic differentiation: the
//! residual is evaluated once per parameter with [`Dual64`] numbers seeded on
//! that parameter. The normal equations use Marquardt's diagonal scaling and
//! are solved with a Cholesky factorization.

use super::{PoseResidual, SolveOptions, SolverBackend, SolverReport, SolverStatus, POSE_DIM};
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use num_dual::Dual64;

const MIN_DAMPING: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default)]
pub struct LevenbergMarquardt;

/// Residuals and their Jacobian at `parameters`.
///
/// Returns `None` if the residual cannot be evaluated there.
pub fn linearize<R: PoseResidual>(
    residual: &R,
    parameters: &Vector6<f64>,
) -> Option<(DVector<f64>, DMatrix<f64>)> {
    let rows = residual.num_residuals();
    let mut values = DVector::zeros(rows);
    let mut jacobian = DMatrix::zeros(rows, POSE_DIM);

    for k in 0..POSE_DIM {
        let seeded: Vec<Dual64> = (0..POSE_DIM)
            .map(|i| Dual64::new(parameters[i], if i == k { 1.0 } else { 0.0 }))
            .collect();
        let r = residual.residuals(seeded.as_slice())?;
        if r.len() != rows {
            return None;
        }
        for (row, value) in r.iter().enumerate() {
            jacobian[(row, k)] = value.eps;
            if k == 0 {
                values[row] = value.re;
            }
        }
    }
    Some((values, jacobian))
}

/// `JᵀJ` of a pose Jacobian.
pub fn normal_matrix(jacobian: &DMatrix<f64>) -> Matrix6<f64> {
    (jacobian.transpose() * jacobian)
        .fixed_view::<6, 6>(0, 0)
        .into_owned()
}

/// Smallest eigenvalue of `jtj` after scaling it to a unit diagonal.
///
/// The value lies in `[0, 1]` and does not depend on the units of the rotation
/// and translation parameters. It is zero when some combination of parameters
/// leaves every residual unchanged, including when a parameter has no effect
/// at all.
pub fn weakest_constraint(jtj: &Matrix6<f64>) -> f64 {
    let mut scale = Vector6::zeros();
    for i in 0..POSE_DIM {
        let diagonal = jtj[(i, i)];
        if !diagonal.is_finite() || diagonal <= 0.0 {
            return 0.0;
        }
        scale[i] = diagonal.sqrt().recip();
    }
    let normalized = Matrix6::from_fn(|r, c| jtj[(r, c)] * scale[r] * scale[c]);
    normalized.symmetric_eigenvalues().min().max(0.0)
}

impl SolverBackend for LevenbergMarquardt {
    fn name(&self) -> &'static str {
        "levenberg-marquardt"
    }

    fn solve<R: PoseResidual>(
        &self,
        residual: &R,
        initial: &Vector6<f64>,
        options: &SolveOptions,
    ) -> SolverReport {
        let mut x = *initial;
        let mut report = SolverReport {
            parameters: x,
            initial_cost: f64::INFINITY,
            cost: f64::INFINITY,
            iterations: 0,
            cost_history: Vec::new(),
            status: SolverStatus::MaxIterationsReached,
        };

        let Some(mut cost) = residual.cost(&x) else {
            report.status = SolverStatus::Degenerate;
            return report;
        };
        report.initial_cost = cost;
        report.cost = cost;
        report.cost_history.push(cost);

        let mut lambda = options.initial_damping;

        'outer: while report.iterations < options.max_iterations {
            let Some((r, j)) = linearize(residual, &x) else {
                report.status = SolverStatus::Degenerate;
                break;
            };
            let jtj = normal_matrix(&j);
            let constraint = weakest_constraint(&jtj);
            if constraint <= options.degeneracy_tolerance {
                debug!("normal equations are rank deficient (weakest constraint {constraint:e})");
                report.status = SolverStatus::Degenerate;
                break;
            }

            if cost == 0.0 {
                report.status = SolverStatus::Converged;
                break;
            }

            let gradient: Vector6<f64> = (j.transpose() * &r).fixed_rows::<6>(0).into_owned();

            if gradient.norm() <= options.gradient_tolerance {
                report.status = SolverStatus::Converged;
                break;
            }

            let mut rejections = 0;
            loop {
                let mut damped = jtj;
                for i in 0..POSE_DIM {
                    damped[(i, i)] += lambda * jtj[(i, i)];
                }
                let Some(cholesky) = damped.cholesky() else {
                    report.status = SolverStatus::Degenerate;
                    break 'outer;
                };
                let step = cholesky.solve(&(-gradient));

                if step.norm()
                    <= options.parameter_tolerance * (x.norm() + options.parameter_tolerance)
                {
                    report.status = SolverStatus::Converged;
                    break 'outer;
                }

                // Decrease of the linear model |r + J step|^2.
                let predicted = -(2.0 * gradient.dot(&step) + step.dot(&(jtj * step)));
                if rejections == 0 && predicted <= options.cost_tolerance * cost {
                    report.status = SolverStatus::Converged;
                    break 'outer;
                }

                let candidate = x + step;
                match residual.cost(&candidate) {
                    Some(new_cost) if new_cost < cost => {
                        let decrease = cost - new_cost;
                        x = candidate;
                        cost = new_cost;
                        lambda = (lambda / 10.0).max(MIN_DAMPING);
                        report.iterations += 1;
                        report.cost_history.push(cost);
                        debug!(
                            "iteration {}: cost {:e}, damping {:e}",
                            report.iterations, cost, lambda
                        );
                        if decrease <= options.cost_tolerance * (cost + decrease) {
                            report.status = SolverStatus::Converged;
                            break 'outer;
                        }
                        break;
                    }
                    _ => {
                        rejections += 1;
                        lambda *= 10.0;
                        if rejections >= options.max_damping_attempts {
                            debug!(
                                "{} consecutive rejected steps, damping {:e}",
                                rejections, lambda
                            );
                            report.status = SolverStatus::Diverged;
                            break 'outer;
                        }
                    }
                }
            }
        }

        report.parameters = x;
        report.cost = cost;
        report
    }
}
