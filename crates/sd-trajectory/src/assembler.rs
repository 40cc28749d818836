//! Loads trajectories of finished runs.
//!
//! Spinup runs only store their final state. Values are read from a one year
//! trajectory run started from that state into a temporary directory, which
//! is removed again once the trajectory has been loaded.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, IxDyn};
use tracing::{debug, warn};

use sd_job::{JobBackend, JobConfig, JobController, StartState, TracerTrajectory, trajectory_file};

use crate::interpolate::{PeriodicNearestInterpolator, SpatialInterpolator};
use crate::{TrajectoryError, TrajectoryResult};

/// Directory below the system temp dir used when no `tmp_dir` is configured.
pub const DEFAULT_SCRATCH_DIR: &str = "spindb_trajectories";

/// The finished run to read and how its trajectory run is configured.
#[derive(Debug, Clone, Copy)]
pub struct TrajectorySource<'a> {
    pub run_dir: &'a Path,
    pub model_name: &'a str,
    /// Every tracer of the model; the trajectory run needs all of them.
    pub model_tracers: &'a [String],
    pub parameters: &'a [f64],
    pub time_step: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum Sampling<'a> {
    /// Dense fields averaged to `time_dim` time steps: `[time_dim, cells]`.
    Dense { time_dim: usize },
    /// Values at `(t, x, y, z)` rows per tracer: `[points]`.
    Points(&'a IndexMap<String, Array2<f64>>),
}

pub struct TrajectoryAssembler<I = PeriodicNearestInterpolator> {
    tmp_dir: Option<PathBuf>,
    interpolator: Option<I>,
}

impl<I: SpatialInterpolator> TrajectoryAssembler<I> {
    /// Trajectory runs go below `tmp_dir`, or below [`DEFAULT_SCRATCH_DIR`]
    /// in the system temp dir if unset. Finished run directories are never
    /// written to.
    pub fn new(tmp_dir: Option<PathBuf>) -> Self {
        Self {
            tmp_dir,
            interpolator: None,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SCRATCH_DIR))
    }

    pub fn values<B: JobBackend>(
        &mut self,
        backend: &B,
        source: &TrajectorySource<'_>,
        tracers: &[String],
        sampling: &Sampling<'_>,
    ) -> TrajectoryResult<IndexMap<String, ArrayD<f64>>> {
        if tracers.is_empty() {
            return Ok(IndexMap::new());
        }
        if let Some(unknown) = tracers.iter().find(|t| !source.model_tracers.contains(t)) {
            return Err(TrajectoryError::UnsupportedTracer {
                tracer: unknown.clone(),
            });
        }

        let trajectory_dir = self.run_trajectory(backend, source)?;
        let loaded = self.load_all(&trajectory_dir, tracers, sampling);
        remove_best_effort(&trajectory_dir);
        loaded
    }

    fn run_trajectory<B: JobBackend>(
        &self,
        backend: &B,
        source: &TrajectorySource<'_>,
    ) -> TrajectoryResult<PathBuf> {
        let parent = self.scratch_dir();
        fs::create_dir_all(&parent)?;
        let dir = parent.join(format!("trajectory_tmp_{}", uuid::Uuid::new_v4()));

        let root = backend.output_root();
        let tracer_input_files = backend
            .open(source.run_dir)?
            .tracer_output_files()?
            .iter()
            .map(|path| root.to_portable(path))
            .collect();
        let config = JobConfig {
            model_name: source.model_name.to_string(),
            tracers: source.model_tracers.to_vec(),
            parameters: source.parameters.to_vec(),
            years: 1,
            tolerance: 0.0,
            time_step: source.time_step,
            start: StartState::Files { tracer_input_files },
            concentration_factor: 1.0,
            write_trajectory: true,
            predecessor: Some(root.to_portable(source.run_dir)),
        };

        debug!(source = %source.run_dir.display(), dir = %dir.display(), "starting trajectory run");
        let mut job = backend.create(&dir);
        let finished = job
            .configure(config)
            .and_then(|()| job.start())
            .and_then(|()| job.wait_until_finished());
        if let Err(e) = finished {
            remove_best_effort(&dir);
            return Err(e.into());
        }
        Ok(dir)
    }

    fn load_all(
        &mut self,
        trajectory_dir: &Path,
        tracers: &[String],
        sampling: &Sampling<'_>,
    ) -> TrajectoryResult<IndexMap<String, ArrayD<f64>>> {
        let mut values = IndexMap::with_capacity(tracers.len());
        for tracer in tracers {
            let loaded = match sampling {
                Sampling::Dense { time_dim } => {
                    let trajectory = load_trajectory(trajectory_dir, tracer)?;
                    dense_average(&trajectory, *time_dim)?.into_dyn()
                }
                Sampling::Points(points) => match points.get(tracer) {
                    Some(points) if points.nrows() > 0 => {
                        let trajectory = load_trajectory(trajectory_dir, tracer)?;
                        self.sample(&trajectory, points)?.into_dyn()
                    }
                    _ => ArrayD::zeros(IxDyn(&[0])),
                },
            };
            values.insert(tracer.clone(), loaded);
        }
        Ok(values)
    }

    /// Interpolate one tracer's trajectory at `points`.
    pub fn sample(
        &mut self,
        trajectory: &TracerTrajectory,
        points: &Array2<f64>,
    ) -> TrajectoryResult<Array1<f64>> {
        if points.ncols() != 4 {
            return Err(TrajectoryError::invalid(format!(
                "points need 4 columns (t, x, y, z), got {}",
                points.ncols()
            )));
        }
        let (data_points, data_values) = flatten(trajectory)?;
        let interpolator = self.interpolator_for(data_points, data_values)?;
        let query: Vec<[f64; 4]> = points
            .rows()
            .into_iter()
            .map(|r| [r[0], r[1], r[2], r[3]])
            .collect();
        Ok(Array1::from(interpolator.interpolate(&query)?))
    }

    /// Reuse the held interpolator when the data points are unchanged,
    /// otherwise build a new one.
    fn interpolator_for(
        &mut self,
        data_points: Vec<[f64; 4]>,
        data_values: Vec<f64>,
    ) -> TrajectoryResult<&mut I> {
        let interpolator = match self.interpolator.take() {
            Some(mut existing) if existing.data_points() == data_points.as_slice() => {
                debug!("reusing interpolator with new values");
                existing.set_values(data_values)?;
                existing
            }
            _ => {
                debug!(points = data_points.len(), "building interpolator");
                I::build(data_points, data_values)?
            }
        };
        Ok(self.interpolator.insert(interpolator))
    }
}

fn load_trajectory(trajectory_dir: &Path, tracer: &str) -> TrajectoryResult<TracerTrajectory> {
    let path = trajectory_file(trajectory_dir, tracer);
    if !path.is_file() {
        return Err(TrajectoryError::MissingTrajectory {
            tracer: tracer.to_string(),
            dir: trajectory_dir.to_path_buf(),
        });
    }
    Ok(TracerTrajectory::load(&path)?)
}

fn check_rows(trajectory: &TracerTrajectory) -> TrajectoryResult<()> {
    let cells = trajectory.coordinates.len();
    if let Some(k) = trajectory.values.iter().position(|row| row.len() != cells) {
        return Err(TrajectoryError::invalid(format!(
            "time step {k} has {} values for {cells} cells",
            trajectory.values[k].len()
        )));
    }
    Ok(())
}

/// Average consecutive stored time steps down to `time_dim` steps.
pub fn dense_average(trajectory: &TracerTrajectory, time_dim: usize) -> TrajectoryResult<Array2<f64>> {
    check_rows(trajectory)?;
    let stored = trajectory.values.len();
    if time_dim == 0 || stored == 0 || stored % time_dim != 0 {
        return Err(TrajectoryError::invalid(format!(
            "time dimension {time_dim} does not divide the stored {stored} time steps"
        )));
    }
    let block = stored / time_dim;
    let weight = 1.0 / block as f64;
    let mut averaged = Array2::zeros((time_dim, trajectory.coordinates.len()));
    for (k, row) in trajectory.values.iter().enumerate() {
        averaged
            .row_mut(k / block)
            .scaled_add(weight, &ArrayView1::from(row.as_slice()));
    }
    Ok(averaged)
}

/// Data points `(t, x, y, z)` with `t` at the centre of each stored step.
fn flatten(trajectory: &TracerTrajectory) -> TrajectoryResult<(Vec<[f64; 4]>, Vec<f64>)> {
    check_rows(trajectory)?;
    let stored = trajectory.values.len() as f64;
    let mut points = Vec::with_capacity(trajectory.values.len() * trajectory.coordinates.len());
    let mut values = Vec::with_capacity(points.capacity());
    for (k, row) in trajectory.values.iter().enumerate() {
        let t = (k as f64 + 0.5) / stored;
        for (coordinate, value) in trajectory.coordinates.iter().zip(row) {
            points.push([t, coordinate[0], coordinate[1], coordinate[2]]);
            values.push(*value);
        }
    }
    Ok((points, values))
}

fn remove_best_effort(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "temporary trajectory removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "temporary trajectory directory could not be removed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn trajectory(values: Vec<Vec<f64>>) -> TracerTrajectory {
        TracerTrajectory {
            time_dim: values.len(),
            coordinates: vec![[0.0, 0.0, 0.0], [90.0, 0.0, 0.0]],
            values,
        }
    }

    #[test]
    fn dense_average_blocks_time_steps() {
        let t = trajectory(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0], vec![7.0, 8.0]]);
        let averaged = dense_average(&t, 2).unwrap();
        assert_eq!(averaged, array![[2.0, 3.0], [6.0, 7.0]]);
        assert_eq!(dense_average(&t, 4).unwrap().nrows(), 4);
    }

    #[test]
    fn dense_average_rejects_non_divisor() {
        let t = trajectory(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        assert!(matches!(
            dense_average(&t, 2),
            Err(TrajectoryError::InvalidValue { .. })
        ));
        assert!(dense_average(&t, 0).is_err());
    }

    #[test]
    fn interpolator_is_reused_for_same_grid() {
        let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);
        let points = array![[0.2, 1.0, 0.0, 0.0], [0.7, 91.0, 0.0, 0.0]];

        let first = assembler
            .sample(&trajectory(vec![vec![1.0, 2.0], vec![3.0, 4.0]]), &points)
            .unwrap();
        assert_eq!(first, array![1.0, 4.0]);
        let built = assembler.interpolator.as_ref().map(|i| i.data_points().as_ptr());

        let second = assembler
            .sample(&trajectory(vec![vec![10.0, 20.0], vec![30.0, 40.0]]), &points)
            .unwrap();
        assert_eq!(second, array![10.0, 40.0]);
        let reused = assembler.interpolator.as_ref().map(|i| i.data_points().as_ptr());
        assert_eq!(built, reused);
    }

    #[test]
    fn points_need_four_columns() {
        let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);
        let points = array![[0.2, 1.0, 0.0]];
        assert!(assembler
            .sample(&trajectory(vec![vec![1.0, 2.0]]), &points)
            .is_err());
    }
}
