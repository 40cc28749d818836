//! Batch systems executing submitted jobs.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::record::{JOB_FILE, JobRecord};
use crate::{JobError, JobResult};

/// Hands a configured run to something that eventually writes its outputs
/// and `status.json`.
pub trait BatchSystem: Send + Sync {
    /// Submit without waiting; returns the batch system's job id.
    fn submit(&self, run_dir: &Path, record: &JobRecord) -> JobResult<String>;
}

/// Submits by running an external command, e.g. a queue submission script.
///
/// `{run_dir}` and `{job_file}` in the arguments are replaced by the run
/// directory and its job record. The command's trimmed stdout is the job id.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    program: String,
    args: Vec<String>,
}

impl CommandBatch {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace separated command line.
    pub fn from_command_line(command: &str) -> JobResult<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| JobError::Batch {
            message: "empty submission command".to_string(),
        })?;
        Ok(Self::new(program, parts.collect()))
    }

    fn expand(&self, run_dir: &Path) -> Vec<String> {
        let run_dir_str = run_dir.display().to_string();
        let job_file = run_dir.join(JOB_FILE).display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{run_dir}", &run_dir_str)
                    .replace("{job_file}", &job_file)
            })
            .collect()
    }
}

impl BatchSystem for CommandBatch {
    fn submit(&self, run_dir: &Path, _record: &JobRecord) -> JobResult<String> {
        let args = self.expand(run_dir);
        debug!(program = %self.program, ?args, "running submission command");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| JobError::Batch {
                message: format!("cannot run '{}': {e}", self.program),
            })?;
        if !output.status.success() {
            return Err(JobError::Batch {
                message: format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(run_dir = %run_dir.display(), batch_id = %id, "job submitted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn placeholders_are_expanded() {
        let batch = CommandBatch::from_command_line("qsub -d {run_dir} {job_file}").unwrap();
        let args = batch.expand(&PathBuf::from("/db/run_00"));
        assert_eq!(args, vec!["-d", "/db/run_00", "/db/run_00/job.json"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandBatch::from_command_line("   "),
            Err(JobError::Batch { .. })
        ));
    }
}
