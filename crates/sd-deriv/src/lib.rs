//! sd-deriv: finite difference derivatives of model output with respect to
//! the model parameters, computed from perturbed runs that continue a
//! finished spinup.

pub mod engine;
pub mod factor_id;
pub mod finite_diff;

use std::path::PathBuf;

pub use engine::{DerivativeEngine, DerivativeRequest, DerivativeSettings};
pub use factor_id::{BASE_FACTOR_ID, MAX_FACTOR_ID_PRECISION, factor_id};
pub use finite_diff::{Offsets, Stencil};

pub type DerivativeResult<T> = Result<T, DerivativeError>;

#[derive(thiserror::Error, Debug)]
pub enum DerivativeError {
    #[error("Spinup error: {0}")]
    Spinup(#[from] sd_spinup::SpinupError),

    #[error("Job error: {0}")]
    Job(#[from] sd_job::JobError),

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] sd_trajectory::TrajectoryError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Invalid value: {0}")]
    Core(#[from] sd_core::CoreError),

    #[error("Invalid value: {reason}")]
    InvalidValue { reason: String },

    #[error("Derivative run integrity violated at {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },
}

impl DerivativeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}
