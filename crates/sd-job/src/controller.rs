//! File-backed [`JobController`] over a pluggable [`BatchSystem`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::batch::BatchSystem;
use crate::output::output_file_name;
use crate::paths::OutputRoot;
use crate::record::{JOB_FILE, JobConfig, JobRecord, JobStatus, STATUS_FILE, StartState};
use crate::{JobBackend, JobController, JobError, JobResult};

#[derive(Clone)]
pub struct FileJobBackend {
    batch: Arc<dyn BatchSystem>,
    output_root: OutputRoot,
    poll_interval: Duration,
}

impl FileJobBackend {
    pub fn new(batch: Arc<dyn BatchSystem>, output_root: OutputRoot, poll_interval: Duration) -> Self {
        Self {
            batch,
            output_root,
            poll_interval,
        }
    }
}

impl JobBackend for FileJobBackend {
    type Job = FileJob;

    fn create(&self, run_dir: &Path) -> FileJob {
        FileJob {
            run_dir: run_dir.to_path_buf(),
            record: None,
            batch: Arc::clone(&self.batch),
            output_root: self.output_root.clone(),
            poll_interval: self.poll_interval,
        }
    }

    fn open(&self, run_dir: &Path) -> JobResult<FileJob> {
        let record = JobRecord::load(run_dir)?;
        let mut job = self.create(run_dir);
        job.record = Some(record);
        Ok(job)
    }

    fn output_root(&self) -> &OutputRoot {
        &self.output_root
    }
}

pub struct FileJob {
    run_dir: PathBuf,
    record: Option<JobRecord>,
    batch: Arc<dyn BatchSystem>,
    output_root: OutputRoot,
    poll_interval: Duration,
}

impl FileJob {
    fn record(&self) -> JobResult<&JobRecord> {
        self.record.as_ref().ok_or_else(|| JobError::NotConfigured {
            dir: self.run_dir.clone(),
        })
    }

    pub fn job_record(&self) -> Option<&JobRecord> {
        self.record.as_ref()
    }

    fn finished(&self) -> JobResult<(u32, f64)> {
        match self.status()? {
            JobStatus::Finished {
                achieved_years,
                achieved_tolerance,
                ..
            } => Ok((achieved_years, achieved_tolerance)),
            JobStatus::Failed { message } => Err(JobError::Failed {
                dir: self.run_dir.clone(),
                message,
            }),
            JobStatus::Submitted { .. } => Err(JobError::NotFinished {
                dir: self.run_dir.clone(),
            }),
        }
    }
}

fn mark_read_only(path: &Path) -> JobResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

impl JobController for FileJob {
    fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn configure(&mut self, config: JobConfig) -> JobResult<()> {
        fs::create_dir_all(&self.run_dir)?;
        let status_path = self.run_dir.join(STATUS_FILE);
        if status_path.exists() {
            fs::remove_file(&status_path)?;
        }
        let record = JobRecord::new(config)?;
        record.save(&self.run_dir)?;
        debug!(run_dir = %self.run_dir.display(), digest = %record.config_digest, "job configured");
        self.record = Some(record);
        Ok(())
    }

    fn start(&mut self) -> JobResult<()> {
        let run_dir = self.run_dir.clone();
        let record = self.record()?.clone();

        JobStatus::submitted_now().save(&run_dir)?;
        let batch_id = match self.batch.submit(&run_dir, &record) {
            Ok(id) => id,
            Err(e) => {
                // The batch layer never took the job, so nobody else will write its status.
                JobStatus::Failed {
                    message: e.to_string(),
                }
                .save(&run_dir)?;
                return Err(e);
            }
        };

        let mut record = record;
        record.submitted_at = Some(chrono::Utc::now().to_rfc3339());
        record.batch_id = Some(batch_id.clone());
        record.save(&run_dir)?;
        info!(run_dir = %run_dir.display(), %batch_id, years = record.config.years, "job started");
        self.record = Some(record);
        Ok(())
    }

    fn status(&self) -> JobResult<JobStatus> {
        JobStatus::load(&self.run_dir)?.ok_or_else(|| JobError::NotSubmitted {
            dir: self.run_dir.clone(),
        })
    }

    fn wait_until_finished(&mut self) -> JobResult<()> {
        self.record()?;
        debug!(run_dir = %self.run_dir.display(), "waiting for job");
        loop {
            match self.status()? {
                JobStatus::Finished { .. } => return Ok(()),
                JobStatus::Failed { message } => {
                    warn!(run_dir = %self.run_dir.display(), %message, "job failed");
                    return Err(JobError::Failed {
                        dir: self.run_dir.clone(),
                        message,
                    });
                }
                JobStatus::Submitted { .. } => std::thread::sleep(self.poll_interval),
            }
        }
    }

    fn config(&self) -> JobResult<&JobConfig> {
        Ok(&self.record()?.config)
    }

    fn achieved_years(&self) -> JobResult<u32> {
        Ok(self.finished()?.0)
    }

    fn achieved_tolerance(&self) -> JobResult<f64> {
        Ok(self.finished()?.1)
    }

    fn tracer_output_files(&self) -> JobResult<Vec<PathBuf>> {
        Ok(self
            .config()?
            .tracers
            .iter()
            .map(|tracer| self.run_dir.join(output_file_name(tracer)))
            .collect())
    }

    fn tracer_input_files(&self) -> JobResult<Vec<PathBuf>> {
        Ok(match &self.config()?.start {
            StartState::Constant { .. } => Vec::new(),
            StartState::Files { tracer_input_files } => tracer_input_files
                .iter()
                .map(|file| self.output_root.resolve(file))
                .collect(),
        })
    }

    fn predecessor(&self) -> JobResult<Option<PathBuf>> {
        Ok(self
            .config()?
            .predecessor
            .as_deref()
            .map(|p| self.output_root.resolve(p)))
    }

    fn set_read_only(&mut self, inputs: bool, outputs: bool) -> JobResult<()> {
        let current = self.record()?.read_only;
        if (!inputs || current.inputs) && (!outputs || current.outputs) {
            return Ok(());
        }
        let mut record = self.record()?.clone();
        record.read_only.inputs |= inputs;
        record.read_only.outputs |= outputs;
        record.save(&self.run_dir)?;

        if inputs {
            mark_read_only(&self.run_dir.join(JOB_FILE))?;
        }
        if outputs {
            for path in self.tracer_output_files()? {
                mark_read_only(&path)?;
            }
            mark_read_only(&self.run_dir.join(STATUS_FILE))?;
        }
        self.record = Some(record);
        Ok(())
    }
}
