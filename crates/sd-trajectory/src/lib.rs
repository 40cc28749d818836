//! sd-trajectory: turn the raw output of a finished run into per-tracer
//! arrays, either dense on the model grid or sampled at scattered points.

pub mod assembler;
pub mod datasets;
pub mod interpolate;

use std::path::PathBuf;

pub use assembler::{
    DEFAULT_SCRATCH_DIR, Sampling, TrajectoryAssembler, TrajectorySource, dense_average,
};
pub use datasets::{
    DataSets, SplitPlan, merge_data_sets, merge_tracer_data_sets, split_data_sets,
    split_tracer_data_sets,
};
pub use interpolate::{PeriodicNearestInterpolator, SpatialInterpolator};

pub type TrajectoryResult<T> = Result<T, TrajectoryError>;

#[derive(thiserror::Error, Debug)]
pub enum TrajectoryError {
    #[error("Job error: {0}")]
    Job(#[from] sd_job::JobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracer '{tracer}' is not supported by the model")]
    UnsupportedTracer { tracer: String },

    #[error("Invalid value: {reason}")]
    InvalidValue { reason: String },

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Cannot split data set '{name}': {reason}")]
    Split { name: String, reason: String },

    #[error("Trajectory of {tracer} missing in {dir}")]
    MissingTrajectory { tracer: String, dir: PathBuf },
}

impl TrajectoryError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}

/// Resolve a tracer selection against the model's tracers. `None` selects
/// all of them, sorted.
pub fn check_tracers(requested: Option<&[String]>, model_tracers: &[String]) -> TrajectoryResult<Vec<String>> {
    match requested {
        Some(tracers) => {
            if let Some(unknown) = tracers.iter().find(|t| !model_tracers.contains(t)) {
                return Err(TrajectoryError::UnsupportedTracer {
                    tracer: unknown.clone(),
                });
            }
            Ok(tracers.to_vec())
        }
        None => {
            let mut all = model_tracers.to_vec();
            all.sort();
            Ok(all)
        }
    }
}
