//! Observed 3D/2D correspondences and range-sensor scans.
//!
//! Both containers are filled by external detectors or loaded from CSV files
//! and are only read by the estimation and refinement code.

use crate::geometry::Pose;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum CorrespondenceError {
    #[error("Length mismatch: {points} points but {pixels} pixels")]
    LengthMismatch { points: usize, pixels: usize },
    #[error("Index {index} out of range for {len} correspondences")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Non-finite value in record {record}")]
    NonFinite { record: usize },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A known 3D point paired with its observed pixel `(u, v)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub point: Vector3<f64>,
    pub pixel: Vector2<f64>,
    /// Detector-side inlier flag. Invalid pairs are kept for bookkeeping but
    /// never enter a solve.
    pub valid: bool,
}

impl Correspondence {
    pub fn new(point: Vector3<f64>, pixel: Vector2<f64>) -> Self {
        Correspondence {
            point,
            pixel,
            valid: true,
        }
    }
}

/// Ordered correspondences; the index of a pair is its identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrespondenceSet {
    correspondences: Vec<Correspondence>,
}

#[derive(Debug, Deserialize)]
struct CorrespondenceRecord {
    x: f64,
    y: f64,
    z: f64,
    u: f64,
    v: f64,
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PointRecord {
    x: f64,
    y: f64,
    z: f64,
}

impl CorrespondenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs points and pixels by index. All pairs start out valid.
    ///
    /// # Errors
    ///
    /// [`CorrespondenceError::LengthMismatch`] if the two sequences differ in length.
    pub fn from_pairs(
        points: Vec<Vector3<f64>>,
        pixels: Vec<Vector2<f64>>,
    ) -> Result<Self, CorrespondenceError> {
        if points.len() != pixels.len() {
            return Err(CorrespondenceError::LengthMismatch {
                points: points.len(),
                pixels: pixels.len(),
            });
        }
        Ok(CorrespondenceSet {
            correspondences: points
                .into_iter()
                .zip(pixels)
                .map(|(point, pixel)| Correspondence::new(point, pixel))
                .collect(),
        })
    }

    pub fn push(&mut self, correspondence: Correspondence) {
        self.correspondences.push(correspondence);
    }

    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Correspondence> {
        self.correspondences.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Correspondence> {
        self.correspondences.iter()
    }

    /// `(index, correspondence)` for every pair flagged valid.
    pub fn valid(&self) -> impl Iterator<Item = (usize, &Correspondence)> {
        self.correspondences
            .iter()
            .enumerate()
            .filter(|(_, c)| c.valid)
    }

    pub fn valid_count(&self) -> usize {
        self.correspondences.iter().filter(|c| c.valid).count()
    }

    pub fn set_valid(&mut self, index: usize, valid: bool) -> Result<(), CorrespondenceError> {
        let len = self.correspondences.len();
        let correspondence = self
            .correspondences
            .get_mut(index)
            .ok_or(CorrespondenceError::IndexOutOfRange { index, len })?;
        correspondence.valid = valid;
        Ok(())
    }

    pub fn set_pixel(&mut self, index: usize, pixel: Vector2<f64>) -> Result<(), CorrespondenceError> {
        let len = self.correspondences.len();
        let correspondence = self
            .correspondences
            .get_mut(index)
            .ok_or(CorrespondenceError::IndexOutOfRange { index, len })?;
        correspondence.pixel = pixel;
        Ok(())
    }

    /// Copy of the set with every 3D point mapped through `pose`.
    pub fn transformed(&self, pose: &Pose) -> CorrespondenceSet {
        CorrespondenceSet {
            correspondences: self
                .correspondences
                .iter()
                .map(|c| Correspondence {
                    point: pose.transform_point(&c.point),
                    ..*c
                })
                .collect(),
        }
    }

    /// Loads correspondences from a CSV file with header `x,y,z,u,v[,valid]`.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, CorrespondenceError> {
        let reader = csv::Reader::from_path(path)?;
        Self::read_records(reader)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CorrespondenceError> {
        Self::read_records(csv::Reader::from_reader(reader))
    }

    fn read_records<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, CorrespondenceError> {
        let mut set = CorrespondenceSet::new();
        for (record, row) in reader.deserialize::<CorrespondenceRecord>().enumerate() {
            let row = row?;
            if ![row.x, row.y, row.z, row.u, row.v].iter().all(|v| v.is_finite()) {
                return Err(CorrespondenceError::NonFinite { record: record + 1 });
            }
            set.push(Correspondence {
                point: Vector3::new(row.x, row.y, row.z),
                pixel: Vector2::new(row.u, row.v),
                valid: row.valid,
            });
        }
        Ok(set)
    }
}

impl FromIterator<Correspondence> for CorrespondenceSet {
    fn from_iter<I: IntoIterator<Item = Correspondence>>(iter: I) -> Self {
        CorrespondenceSet {
            correspondences: iter.into_iter().collect(),
        }
    }
}

/// Points measured by a range sensor, in the sensor frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeScan {
    points: Vec<Vector3<f64>>,
}

impl RangeScan {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        RangeScan { points }
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Loads a scan from a CSV file with header `x,y,z`.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, CorrespondenceError> {
        Self::read_records(csv::Reader::from_path(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CorrespondenceError> {
        Self::read_records(csv::Reader::from_reader(reader))
    }

    fn read_records<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, CorrespondenceError> {
        let mut points = Vec::new();
        for (record, row) in reader.deserialize::<PointRecord>().enumerate() {
            let row = row?;
            if ![row.x, row.y, row.z].iter().all(|v| v.is_finite()) {
                return Err(CorrespondenceError::NonFinite { record: record + 1 });
            }
            points.push(Vector3::new(row.x, row.y, row.z));
        }
        Ok(RangeScan { points })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_requires_equal_lengths() {
        let result = CorrespondenceSet::from_pairs(
            vec![Vector3::zeros(), Vector3::zeros()],
            vec![Vector2::zeros()],
        );
        assert!(matches!(
            result,
            Err(CorrespondenceError::LengthMismatch {
                points: 2,
                pixels: 1
            })
        ));
    }

    #[test]
    fn test_validity_flags() {
        let mut set = CorrespondenceSet::from_pairs(
            vec![Vector3::new(0.0, 0.0, 1.0); 3],
            vec![Vector2::new(10.0, 10.0); 3],
        )
        .unwrap();
        assert_eq!(set.valid_count(), 3);
        set.set_valid(1, false).unwrap();
        assert_eq!(set.valid_count(), 2);
        assert_eq!(
            set.valid().map(|(i, _)| i).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(matches!(
            set.set_valid(5, false),
            Err(CorrespondenceError::IndexOutOfRange { index: 5, len: 3 })
        ));
    }

    #[test]
    fn test_load_from_csv() {
        let data = "x,y,z,u,v,valid\n0.0,0.0,0.0,10.5,20.5,true\n0.1,0.0,0.0,30.0,20.0,false\n";
        let set = CorrespondenceSet::from_reader(data.as_bytes()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.valid_count(), 1);
        assert_eq!(set.get(0).unwrap().pixel, Vector2::new(10.5, 20.5));

        let no_flags = "x,y,z,u,v\n0.0,0.0,0.0,10.5,20.5\n";
        let set = CorrespondenceSet::from_reader(no_flags.as_bytes()).unwrap();
        assert_eq!(set.valid_count(), 1);

        let broken = "x,y,z,u,v\n0.0,zero,0.0,10.5,20.5\n";
        assert!(matches!(
            CorrespondenceSet::from_reader(broken.as_bytes()),
            Err(CorrespondenceError::Csv(_))
        ));
    }

    #[test]
    fn test_load_range_scan() {
        let data = "x,y,z\n1.0,2.0,3.0\n4.0,5.0,6.0\n";
        let scan = RangeScan::from_reader(data.as_bytes()).unwrap();
        assert_eq!(scan.len(), 2);
        assert_eq!(scan.points()[1], Vector3::new(4.0, 5.0, 6.0));
    }
}
