//! Initial pose estimation from 3D/2D correspondences.
//!
//! Every observed pixel is unprojected to a unit bearing `b` with the camera's
//! inverse mapping. The unknown projective map `M` (a plane homography for a
//! planar target, a 3x4 matrix otherwise) must map each target point onto its
//! bearing, which gives the linear constraint `b x (M X) = 0`. Working on
//! bearings instead of normalized image coordinates keeps rays at or beyond
//! 90 degrees from the optical axis usable.
//!
//! The linear solution is only a seed: it minimizes an algebraic error and is
//! projected onto a proper rotation afterwards.

use crate::camera::CameraModel;
use crate::correspondence::CorrespondenceSet;
use crate::error::CalibrationError;
use crate::geometry::{nearest_rotation, Pose};
use log::{debug, info};
use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, SymmetricEigen, Vector3};

/// Minimum number of usable correspondences for any pose solve.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Minimum number of correspondences for a non-planar point cloud.
pub const MIN_NON_PLANAR_CORRESPONDENCES: usize = 6;

/// Seed pose together with the bookkeeping of which correspondences it used.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// Camera-from-target pose.
    pub pose: Pose,
    /// Indices of the correspondences that entered the solve.
    pub used: Vec<usize>,
    /// Indices of valid correspondences dropped for lying outside the field of view.
    pub excluded: Vec<usize>,
}

/// Strategy interface for seed pose solvers.
pub trait PoseEstimator: Send + Sync {
    /// Estimates the camera-from-target pose.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientCorrespondences`] if too few
    ///   correspondences remain after excluding out-of-view pixels.
    /// * [`CalibrationError::DegenerateConfiguration`] if the point geometry
    ///   does not determine a pose.
    fn estimate<C: CameraModel + ?Sized>(
        &self,
        correspondences: &CorrespondenceSet,
        camera: &C,
    ) -> Result<PoseEstimate, CalibrationError>;
}

/// Direct linear pose solver on bearing vectors.
#[derive(Debug, Clone, Copy)]
pub struct LinearPoseEstimator {
    /// Second/first principal extent of the point cloud below which the points
    /// are considered collinear.
    pub collinearity_tolerance: f64,
    /// Third/first principal extent below which the points are treated as planar.
    pub planarity_tolerance: f64,
    /// Relative size of the second-smallest singular value of the design
    /// matrix below which the solution is not unique.
    pub conditioning_tolerance: f64,
}

impl Default for LinearPoseEstimator {
    fn default() -> Self {
        LinearPoseEstimator {
            collinearity_tolerance: 1e-6,
            planarity_tolerance: 1e-3,
            conditioning_tolerance: 1e-9,
        }
    }
}

/// Principal axes of a point cloud, sorted by decreasing extent.
struct PrincipalAxes {
    centroid: Vector3<f64>,
    /// Columns are the axes; the third one is the plane normal for planar sets.
    axes: Matrix3<f64>,
    extents: [f64; 3],
}

fn principal_axes(points: &[Vector3<f64>]) -> PrincipalAxes {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let scatter = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p - centroid;
        acc + d * d.transpose()
    });

    let eigen = SymmetricEigen::new(scatter);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut axes = Matrix3::zeros();
    let mut extents = [0.0; 3];
    for (column, &index) in order.iter().enumerate() {
        axes.set_column(column, &eigen.eigenvectors.column(index));
        extents[column] = eigen.eigenvalues[index].max(0.0).sqrt();
    }
    if axes.determinant() < 0.0 {
        let flipped = -axes.column(2);
        axes.set_column(2, &flipped);
    }

    PrincipalAxes {
        centroid,
        axes,
        extents,
    }
}

/// Scale that brings the mean distance from the origin to `sqrt(dim)`.
fn normalizing_scale(coordinates: impl Iterator<Item = f64>, count: usize, dim: f64) -> f64 {
    let mean = coordinates.sum::<f64>() / count as f64;
    if mean > 0.0 {
        dim.sqrt() / mean
    } else {
        1.0
    }
}

/// Null vector of `a` and the conditioning ratio of its second-smallest to its
/// largest singular value.
fn null_vector(a: DMatrix<f64>) -> Result<(DVector<f64>, f64), CalibrationError> {
    let unknowns = a.ncols();
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| {
        CalibrationError::DegenerateConfiguration("SVD of the design matrix failed".to_string())
    })?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));
    if order.len() < unknowns {
        return Err(CalibrationError::DegenerateConfiguration(
            "design matrix has fewer rows than unknowns".to_string(),
        ));
    }

    let largest = svd.singular_values[order[order.len() - 1]];
    let second_smallest = svd.singular_values[order[1]];
    let ratio = if largest > 0.0 {
        second_smallest / largest
    } else {
        0.0
    };
    Ok((v_t.row(order[0]).transpose(), ratio))
}

/// Appends the three rows of `b x (M x) = 0` for one correspondence, where the
/// unknowns are the rows of `M` stacked, each of length `x.len()`.
fn push_cross_rows(a: &mut DMatrix<f64>, row: usize, bearing: &Vector3<f64>, x: &[f64]) {
    let k = x.len();
    for (j, &xj) in x.iter().enumerate() {
        // (b_y m3 - b_z m2) . x
        a[(row, 2 * k + j)] = bearing.y * xj;
        a[(row, k + j)] = -bearing.z * xj;
        // (b_z m1 - b_x m3) . x
        a[(row + 1, j)] = bearing.z * xj;
        a[(row + 1, 2 * k + j)] = -bearing.x * xj;
        // (b_x m2 - b_y m1) . x
        a[(row + 2, k + j)] = bearing.x * xj;
        a[(row + 2, j)] = -bearing.y * xj;
    }
}

impl LinearPoseEstimator {
    fn check_conditioning(&self, ratio: f64) -> Result<(), CalibrationError> {
        if ratio < self.conditioning_tolerance {
            return Err(CalibrationError::DegenerateConfiguration(format!(
                "linear system is rank deficient (conditioning {ratio:e})"
            )));
        }
        Ok(())
    }

    /// Homography path for points on a plane.
    fn solve_planar(
        &self,
        points: &[Vector3<f64>],
        bearings: &[Vector3<f64>],
        frame: &PrincipalAxes,
    ) -> Result<Pose, CalibrationError> {
        let basis_t = frame.axes.transpose();
        let plane: Vec<(f64, f64)> = points
            .iter()
            .map(|p| {
                let q = basis_t * (p - frame.centroid);
                (q.x, q.y)
            })
            .collect();
        let scale = normalizing_scale(
            plane.iter().map(|(x, y)| x.hypot(*y)),
            plane.len(),
            2.0,
        );

        let mut a = DMatrix::zeros(3 * points.len(), 9);
        for (i, ((x, y), bearing)) in plane.iter().zip(bearings).enumerate() {
            push_cross_rows(&mut a, 3 * i, bearing, &[scale * x, scale * y, 1.0]);
        }
        let (h, ratio) = null_vector(a)?;
        self.check_conditioning(ratio)?;

        let mut homography = Matrix3::from_row_slice(h.as_slice());
        let facing: f64 = plane
            .iter()
            .zip(bearings)
            .map(|((x, y), b)| b.dot(&(homography * Vector3::new(scale * x, scale * y, 1.0))))
            .sum();
        if facing < 0.0 {
            homography = -homography;
        }

        let singular = homography.singular_values();
        if singular.min() < 1e-6 * singular.max() {
            return Err(CalibrationError::DegenerateConfiguration(
                "target plane passes through the projection center".to_string(),
            ));
        }

        let h1: Vector3<f64> = homography.column(0) * scale;
        let h2: Vector3<f64> = homography.column(1) * scale;
        let h3: Vector3<f64> = homography.column(2).into_owned();
        let lambda = 2.0 / (h1.norm() + h2.norm());
        let r1 = h1 * lambda;
        let r2 = h2 * lambda;
        let r3 = r1.cross(&r2);
        let rotation_in_plane = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]));
        let translation_in_plane = h3 * lambda;

        // Plane coordinates are basis^T (X - centroid).
        let rotation = rotation_in_plane.matrix() * basis_t;
        let translation = translation_in_plane - rotation * frame.centroid;
        Ok(Pose::new(nearest_rotation(&rotation), translation))
    }

    /// 3x4 DLT path for points spanning three dimensions.
    fn solve_general(
        &self,
        points: &[Vector3<f64>],
        bearings: &[Vector3<f64>],
        centroid: &Vector3<f64>,
    ) -> Result<Pose, CalibrationError> {
        let scale = normalizing_scale(
            points.iter().map(|p| (p - centroid).norm()),
            points.len(),
            3.0,
        );

        let mut a = DMatrix::zeros(3 * points.len(), 12);
        for (i, (p, bearing)) in points.iter().zip(bearings).enumerate() {
            let q = (p - centroid) * scale;
            push_cross_rows(&mut a, 3 * i, bearing, &[q.x, q.y, q.z, 1.0]);
        }
        let (m, ratio) = null_vector(a)?;
        self.check_conditioning(ratio)?;

        let mut projection = Matrix3x4::from_row_slice(m.as_slice());
        let facing: f64 = points
            .iter()
            .zip(bearings)
            .map(|(p, b)| {
                let q = (p - centroid) * scale;
                b.dot(&(projection * q.push(1.0)))
            })
            .sum();
        if facing < 0.0 {
            projection = -projection;
        }

        // Undo the normalization: M [X; 1] with X' = scale (X - centroid).
        let left: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0) * scale;
        let last: Vector3<f64> = projection.column(3) - left * centroid;

        let singular = left.singular_values();
        let magnitude = singular.mean();
        if magnitude <= 0.0 || singular.min() < 1e-6 * singular.max() {
            return Err(CalibrationError::DegenerateConfiguration(
                "projection matrix has a singular rotation block".to_string(),
            ));
        }

        Ok(Pose::new(nearest_rotation(&left), last / magnitude))
    }
}

impl PoseEstimator for LinearPoseEstimator {
    fn estimate<C: CameraModel + ?Sized>(
        &self,
        correspondences: &CorrespondenceSet,
        camera: &C,
    ) -> Result<PoseEstimate, CalibrationError> {
        let mut used = Vec::new();
        let mut excluded = Vec::new();
        let mut points = Vec::new();
        let mut bearings = Vec::new();

        for (index, c) in correspondences.valid() {
            match camera.unproject(&c.pixel) {
                Ok(bearing) => {
                    used.push(index);
                    points.push(c.point);
                    bearings.push(bearing);
                }
                Err(e) => {
                    debug!("correspondence {index} excluded: {e}");
                    excluded.push(index);
                }
            }
        }

        if points.len() < MIN_CORRESPONDENCES {
            return Err(CalibrationError::InsufficientCorrespondences {
                found: points.len(),
                required: MIN_CORRESPONDENCES,
            });
        }

        let frame = principal_axes(&points);
        let [major, middle, minor] = frame.extents;
        if major <= 0.0 || middle < self.collinearity_tolerance * major {
            return Err(CalibrationError::DegenerateConfiguration(
                "target points are collinear".to_string(),
            ));
        }

        let pose = if minor < self.planarity_tolerance * major {
            self.solve_planar(&points, &bearings, &frame)?
        } else {
            if points.len() < MIN_NON_PLANAR_CORRESPONDENCES {
                return Err(CalibrationError::InsufficientCorrespondences {
                    found: points.len(),
                    required: MIN_NON_PLANAR_CORRESPONDENCES,
                });
            }
            self.solve_general(&points, &bearings, &frame.centroid)?
        };

        info!(
            "linear pose from {} correspondences ({} excluded), |t| = {:.4}",
            used.len(),
            excluded.len(),
            pose.translation().norm()
        );

        Ok(PoseEstimate {
            pose,
            used,
            excluded,
        })
    }
}
