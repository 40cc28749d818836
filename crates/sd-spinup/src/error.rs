use std::path::PathBuf;

use sd_core::CoreError;
use sd_job::JobError;
use sd_store::StoreError;

pub type SpinupResult<T> = Result<T, SpinupError>;

#[derive(thiserror::Error, Debug)]
pub enum SpinupError {
    #[error("Cannot access {path}: {source}")]
    FilesystemAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run chain integrity violated at {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("Run directory {path} was created concurrently by another process")]
    ConcurrentRunCreation { path: PathBuf },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid value: {0}")]
    Invalid(#[from] CoreError),
}

impl SpinupError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FilesystemAccess {
            path: path.into(),
            source,
        }
    }
}
