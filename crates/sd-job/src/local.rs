//! In-process batch system running a [`Simulator`] on background threads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use indexmap::IndexMap;
use tracing::{debug, error, warn};

use crate::batch::BatchSystem;
use crate::output::{TracerTrajectory, output_file_name, read_state, trajectory_file, write_state};
use crate::paths::OutputRoot;
use crate::record::{JobConfig, JobRecord, JobStatus, StartState};
use crate::{JobError, JobResult};

/// Resolved start state handed to a simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialState {
    Constant(Vec<f64>),
    Fields(IndexMap<String, Vec<f64>>),
}

#[derive(Debug, Clone)]
pub struct SimulationInput<'a> {
    pub config: &'a JobConfig,
    pub initial_state: InitialState,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationOutput {
    /// Final state per tracer, in tracer order.
    pub final_state: IndexMap<String, Vec<f64>>,
    pub achieved_years: u32,
    pub achieved_tolerance: f64,
    pub trajectory: Option<IndexMap<String, TracerTrajectory>>,
}

/// The tracer model itself.
pub trait Simulator: Send + Sync + 'static {
    fn simulate(&self, input: &SimulationInput<'_>) -> Result<SimulationOutput, String>;
}

pub struct LocalBatch<S> {
    simulator: Arc<S>,
    output_root: OutputRoot,
    submissions: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Simulator> LocalBatch<S> {
    pub fn new(simulator: S, output_root: OutputRoot) -> Self {
        Self {
            simulator: Arc::new(simulator),
            output_root,
            submissions: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of jobs submitted so far.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Worker threads not yet known to have finished.
    pub fn pending_workers(&self) -> usize {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut workers);
        workers.len()
    }

    /// Wait for every job submitted so far.
    pub fn join_all(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("local batch worker panicked");
            }
        }
    }
}

impl<S: Simulator> BatchSystem for LocalBatch<S> {
    fn submit(&self, run_dir: &Path, record: &JobRecord) -> JobResult<String> {
        let id = self.submissions.fetch_add(1, Ordering::SeqCst);
        let simulator = Arc::clone(&self.simulator);
        let output_root = self.output_root.clone();
        let run_dir = run_dir.to_path_buf();
        let config = record.config.clone();

        let handle = std::thread::Builder::new()
            .name(format!("local-job-{id}"))
            .spawn(move || {
                let status = match execute(simulator.as_ref(), &output_root, &run_dir, &config) {
                    Ok(status) => status,
                    Err(message) => {
                        warn!(run_dir = %run_dir.display(), %message, "local job failed");
                        JobStatus::Failed { message }
                    }
                };
                if let Err(e) = status.save(&run_dir) {
                    error!(run_dir = %run_dir.display(), error = %e, "cannot write job status");
                }
            })?;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut workers);
        workers.push(handle);
        Ok(format!("local-{id}"))
    }
}

/// Join and drop the handles of workers that have already exited.
fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) = workers.drain(..).partition(|h| h.is_finished());
    *workers = running;
    for handle in finished {
        if handle.join().is_err() {
            warn!("local batch worker panicked");
        }
    }
}

fn execute<S: Simulator>(
    simulator: &S,
    output_root: &OutputRoot,
    run_dir: &Path,
    config: &JobConfig,
) -> Result<JobStatus, String> {
    let initial_state = resolve_start(output_root, config).map_err(|e| e.to_string())?;
    let output = simulator.simulate(&SimulationInput {
        config,
        initial_state,
    })?;
    write_outputs(run_dir, config, &output).map_err(|e| e.to_string())?;
    debug!(
        run_dir = %run_dir.display(),
        years = output.achieved_years,
        tolerance = output.achieved_tolerance,
        "local job finished"
    );
    Ok(JobStatus::finished_now(
        output.achieved_years,
        output.achieved_tolerance,
    ))
}

fn resolve_start(output_root: &OutputRoot, config: &JobConfig) -> JobResult<InitialState> {
    match &config.start {
        StartState::Constant { concentrations } => Ok(InitialState::Constant(concentrations.clone())),
        StartState::Files { tracer_input_files } => {
            if tracer_input_files.len() != config.tracers.len() {
                return Err(JobError::Batch {
                    message: format!(
                        "{} input files for {} tracers",
                        tracer_input_files.len(),
                        config.tracers.len()
                    ),
                });
            }
            let mut fields = IndexMap::new();
            for (tracer, file) in config.tracers.iter().zip(tracer_input_files) {
                let path: PathBuf = output_root.resolve(file);
                fields.insert(tracer.clone(), read_state(&path)?);
            }
            Ok(InitialState::Fields(fields))
        }
    }
}

fn write_outputs(run_dir: &Path, config: &JobConfig, output: &SimulationOutput) -> JobResult<()> {
    for tracer in &config.tracers {
        let state = output.final_state.get(tracer).ok_or_else(|| JobError::Batch {
            message: format!("simulator returned no final state for tracer '{tracer}'"),
        })?;
        write_state(&run_dir.join(output_file_name(tracer)), state)?;
    }
    if config.write_trajectory {
        let trajectory = output.trajectory.as_ref().ok_or_else(|| JobError::Batch {
            message: "trajectory requested but not produced".to_string(),
        })?;
        for (tracer, data) in trajectory {
            data.save(&trajectory_file(run_dir, tracer))?;
        }
    }
    Ok(())
}
