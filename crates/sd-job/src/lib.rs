//! sd-job: lifecycle of one external simulation run.
//!
//! A run lives in its own directory. The controller owns `job.json`
//! (configuration, read-only flags, submission data); the batch layer owns
//! `status.json` (submitted / finished / failed). Completion is detected only
//! through these files.

pub mod batch;
pub mod controller;
pub mod local;
pub mod output;
pub mod paths;
pub mod record;

use std::path::{Path, PathBuf};

pub use batch::{BatchSystem, CommandBatch};
pub use controller::{FileJob, FileJobBackend};
pub use local::{InitialState, LocalBatch, SimulationInput, SimulationOutput, Simulator};
pub use output::{TracerTrajectory, output_file_name, trajectory_dir, trajectory_file};
pub use paths::OutputRoot;
pub use record::{JobConfig, JobRecord, JobStatus, ReadOnlyFlags, StartState};

pub type JobResult<T> = Result<T, JobError>;

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job metadata in {dir} is missing or malformed: {reason}")]
    Metadata { dir: PathBuf, reason: String },

    #[error("Job in {dir} has not been configured")]
    NotConfigured { dir: PathBuf },

    #[error("Job in {dir} has not been submitted")]
    NotSubmitted { dir: PathBuf },

    #[error("Job in {dir} has not finished")]
    NotFinished { dir: PathBuf },

    #[error("Job in {dir} failed: {message}")]
    Failed { dir: PathBuf, message: String },

    #[error("Batch submission failed: {message}")]
    Batch { message: String },
}

impl JobError {
    pub fn is_metadata(&self) -> bool {
        matches!(self, Self::Metadata { .. })
    }
}

/// One external simulation execution.
///
/// Handles are cheap, hold no open files and are meant to be scoped to a
/// single access: open, read or mutate, drop.
pub trait JobController {
    fn run_dir(&self) -> &Path;

    /// Write the run configuration. Replaces any earlier configuration.
    fn configure(&mut self, config: JobConfig) -> JobResult<()>;

    /// Submit to the batch system without waiting.
    fn start(&mut self) -> JobResult<()>;

    fn status(&self) -> JobResult<JobStatus>;

    fn is_finished(&self) -> JobResult<bool> {
        Ok(matches!(self.status()?, JobStatus::Finished { .. }))
    }

    /// Block until the batch layer reports completion. There is no timeout.
    fn wait_until_finished(&mut self) -> JobResult<()>;

    fn config(&self) -> JobResult<&JobConfig>;

    fn achieved_years(&self) -> JobResult<u32>;

    fn achieved_tolerance(&self) -> JobResult<f64>;

    fn tracer_output_files(&self) -> JobResult<Vec<PathBuf>>;

    /// Warm-start input files, empty for runs started from constants.
    fn tracer_input_files(&self) -> JobResult<Vec<PathBuf>>;

    /// Run whose output seeded this run.
    fn predecessor(&self) -> JobResult<Option<PathBuf>>;

    fn set_read_only(&mut self, inputs: bool, outputs: bool) -> JobResult<()>;
}

/// Creates and opens job handles for run directories.
pub trait JobBackend {
    type Job: JobController;

    /// Handle for a new, not yet configured run in `run_dir`.
    fn create(&self, run_dir: &Path) -> Self::Job;

    /// Handle for an existing run; fails with [`JobError::Metadata`] when the
    /// job record is missing or malformed.
    fn open(&self, run_dir: &Path) -> JobResult<Self::Job>;

    fn output_root(&self) -> &OutputRoot;
}
