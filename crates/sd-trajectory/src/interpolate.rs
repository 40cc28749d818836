//! Interpolation of trajectory values at scattered `(t, x, y, z)` points.

use rayon::prelude::*;

use crate::{TrajectoryError, TrajectoryResult};

/// Period of the time coordinate (fraction of a model year).
pub const TIME_PERIOD: f64 = 1.0;
/// Period of the longitude coordinate in degrees.
pub const LONGITUDE_PERIOD: f64 = 360.0;

pub trait SpatialInterpolator: Send + Sync {
    fn build(data_points: Vec<[f64; 4]>, data_values: Vec<f64>) -> TrajectoryResult<Self>
    where
        Self: Sized;

    fn data_points(&self) -> &[[f64; 4]];

    /// Replace the values at the existing data points.
    fn set_values(&mut self, data_values: Vec<f64>) -> TrajectoryResult<()>;

    fn interpolate(&self, points: &[[f64; 4]]) -> TrajectoryResult<Vec<f64>>;
}

/// Nearest neighbour in a space periodic in `t` and `x`.
///
/// Time is scaled so that one model year spans the same distance as the full
/// longitude circle.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicNearestInterpolator {
    data_points: Vec<[f64; 4]>,
    data_values: Vec<f64>,
    time_scale: f64,
}

impl PeriodicNearestInterpolator {
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    fn distance_squared(&self, a: &[f64; 4], b: &[f64; 4]) -> f64 {
        let dt = periodic_difference(a[0], b[0], TIME_PERIOD) * self.time_scale;
        let dx = periodic_difference(a[1], b[1], LONGITUDE_PERIOD);
        let dy = a[2] - b[2];
        let dz = a[3] - b[3];
        dt * dt + dx * dx + dy * dy + dz * dz
    }

    fn nearest(&self, point: &[f64; 4]) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (i, data_point) in self.data_points.iter().enumerate() {
            let d = self.distance_squared(point, data_point);
            if d < best_distance {
                best = i;
                best_distance = d;
            }
        }
        best
    }
}

fn periodic_difference(a: f64, b: f64, period: f64) -> f64 {
    let d = (a - b).rem_euclid(period);
    d.min(period - d)
}

impl SpatialInterpolator for PeriodicNearestInterpolator {
    fn build(data_points: Vec<[f64; 4]>, data_values: Vec<f64>) -> TrajectoryResult<Self> {
        if data_points.is_empty() {
            return Err(TrajectoryError::invalid("interpolator needs at least one data point"));
        }
        if data_points.len() != data_values.len() {
            return Err(TrajectoryError::invalid(format!(
                "{} data points but {} values",
                data_points.len(),
                data_values.len()
            )));
        }
        Ok(Self {
            data_points,
            data_values,
            time_scale: LONGITUDE_PERIOD / TIME_PERIOD,
        })
    }

    fn data_points(&self) -> &[[f64; 4]] {
        &self.data_points
    }

    fn set_values(&mut self, data_values: Vec<f64>) -> TrajectoryResult<()> {
        if data_values.len() != self.data_points.len() {
            return Err(TrajectoryError::invalid(format!(
                "{} data points but {} values",
                self.data_points.len(),
                data_values.len()
            )));
        }
        self.data_values = data_values;
        Ok(())
    }

    fn interpolate(&self, points: &[[f64; 4]]) -> TrajectoryResult<Vec<f64>> {
        let values: Vec<f64> = points
            .par_iter()
            .map(|p| self.data_values[self.nearest(p)])
            .collect();
        if let Some(i) = values.iter().position(|v| v.is_nan()) {
            return Err(TrajectoryError::invalid(format!(
                "interpolated value at point {i} is NaN"
            )));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpolator() -> PeriodicNearestInterpolator {
        PeriodicNearestInterpolator::build(
            vec![
                [0.1, 1.0, 0.0, 0.0],
                [0.1, 180.0, 0.0, 0.0],
                [0.6, 1.0, 0.0, 0.0],
            ],
            vec![1.0, 2.0, 3.0],
        )
        .unwrap()
    }

    #[test]
    fn longitude_wraps_around() {
        let values = interpolator().interpolate(&[[0.1, 359.5, 0.0, 0.0]]).unwrap();
        assert_eq!(values, vec![1.0]);
    }

    #[test]
    fn time_wraps_around() {
        let values = interpolator().interpolate(&[[0.95, 1.0, 0.0, 0.0]]).unwrap();
        assert_eq!(values, vec![1.0]);
    }

    #[test]
    fn values_can_be_replaced() {
        let mut interpolator = interpolator();
        interpolator.set_values(vec![4.0, 5.0, 6.0]).unwrap();
        let values = interpolator.interpolate(&[[0.15, 170.0, 0.0, 0.0]]).unwrap();
        assert_eq!(values, vec![5.0]);
        assert!(interpolator.set_values(vec![1.0]).is_err());
    }

    #[test]
    fn periodic_difference_is_symmetric() {
        assert!((periodic_difference(359.0, 1.0, 360.0) - 2.0).abs() < 1e-12);
        assert!((periodic_difference(1.0, 359.0, 360.0) - 2.0).abs() < 1e-12);
    }
}
