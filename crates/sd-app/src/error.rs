//! Error types for the sd-app service layer.

use std::path::PathBuf;

/// Application error wrapping the errors of the database crates, shared by
/// the library API and the CLI.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database integrity violated at {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("{0}")]
    Core(#[from] sd_core::CoreError),

    #[error("Store error: {0}")]
    Store(#[from] sd_store::StoreError),

    #[error("Job error: {0}")]
    Job(#[from] sd_job::JobError),

    #[error("Spinup error: {0}")]
    Spinup(#[from] sd_spinup::SpinupError),

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] sd_trajectory::TrajectoryError),

    #[error("Derivative error: {0}")]
    Derivative(#[from] sd_deriv::DerivativeError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sd-app operations.
pub type AppResult<T> = Result<T, AppError>;
