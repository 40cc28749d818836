//! Persisted job metadata: `job.json` and `status.json`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{JobError, JobResult};

pub const JOB_FILE: &str = "job.json";
pub const STATUS_FILE: &str = "status.json";

/// Initial tracer state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartState {
    /// One constant value per tracer.
    Constant { concentrations: Vec<f64> },
    /// One input file per tracer, stored as portable paths.
    Files { tracer_input_files: Vec<String> },
}

/// Everything the simulator needs to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub model_name: String,
    pub tracers: Vec<String>,
    pub parameters: Vec<f64>,
    pub years: u32,
    pub tolerance: f64,
    pub time_step: u32,
    pub start: StartState,
    /// Multiplier applied to the start state, perturbed by derivative runs
    /// with respect to total concentration.
    #[serde(default = "default_concentration_factor")]
    pub concentration_factor: f64,
    #[serde(default)]
    pub write_trajectory: bool,
    /// Portable path of the run whose output seeds this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,
}

fn default_concentration_factor() -> f64 {
    1.0
}

impl JobConfig {
    pub fn digest(&self) -> JobResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(self)?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyFlags {
    pub inputs: bool,
    pub outputs: bool,
}

/// Content of `job.json`. Written by the controller only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub config: JobConfig,
    pub config_digest: String,
    #[serde(default)]
    pub read_only: ReadOnlyFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl JobRecord {
    pub fn new(config: JobConfig) -> JobResult<Self> {
        let config_digest = config.digest()?;
        Ok(Self {
            config,
            config_digest,
            read_only: ReadOnlyFlags::default(),
            submitted_at: None,
            batch_id: None,
        })
    }

    pub fn load(run_dir: &Path) -> JobResult<Self> {
        let path = run_dir.join(JOB_FILE);
        let metadata_error = |reason: String| JobError::Metadata {
            dir: run_dir.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(&path)
            .map_err(|e| metadata_error(format!("cannot read {}: {e}", path.display())))?;
        let record: JobRecord = serde_json::from_str(&content)
            .map_err(|e| metadata_error(format!("cannot parse {}: {e}", path.display())))?;

        let digest = record.config.digest()?;
        if digest != record.config_digest {
            return Err(metadata_error(format!(
                "configuration digest mismatch (stored {}, computed {digest})",
                record.config_digest
            )));
        }
        Ok(record)
    }

    pub fn save(&self, run_dir: &Path) -> JobResult<()> {
        write_json(&run_dir.join(JOB_FILE), self)
    }
}

/// Content of `status.json`. Written by the batch layer once a job has been
/// handed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Submitted {
        at: String,
    },
    Finished {
        achieved_years: u32,
        achieved_tolerance: f64,
        finished_at: String,
    },
    Failed {
        message: String,
    },
}

impl JobStatus {
    pub fn submitted_now() -> Self {
        Self::Submitted {
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn finished_now(achieved_years: u32, achieved_tolerance: f64) -> Self {
        Self::Finished {
            achieved_years,
            achieved_tolerance,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// `None` when the job was never handed to a batch system.
    pub fn load(run_dir: &Path) -> JobResult<Option<Self>> {
        let path = run_dir.join(STATUS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let status = serde_json::from_str(&content).map_err(|e| JobError::Metadata {
            dir: run_dir.to_path_buf(),
            reason: format!("cannot parse {}: {e}", path.display()),
        })?;
        Ok(Some(status))
    }

    pub fn save(&self, run_dir: &Path) -> JobResult<()> {
        write_json(&run_dir.join(STATUS_FILE), self)
    }
}

/// Write through a sibling temporary file and rename; pollers never observe
/// a half-written status.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> JobResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JobConfig {
        JobConfig {
            model_name: "N".to_string(),
            tracers: vec!["N".to_string()],
            parameters: vec![0.02, 2.0],
            years: 10,
            tolerance: 0.0,
            time_step: 1,
            start: StartState::Constant {
                concentrations: vec![2.17],
            },
            concentration_factor: 1.0,
            write_trajectory: false,
            predecessor: None,
        }
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let a = config();
        let mut b = config();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        b.years = 11;
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn tampered_record_is_a_metadata_error() {
        let dir = std::env::temp_dir().join(format!("sd_job_record_{}", std::process::id()));
        let record = JobRecord::new(config()).unwrap();
        record.save(&dir).unwrap();
        assert_eq!(JobRecord::load(&dir).unwrap(), record);

        let tampered = fs::read_to_string(dir.join(JOB_FILE))
            .unwrap()
            .replace("\"years\": 10", "\"years\": 12");
        fs::write(dir.join(JOB_FILE), tampered).unwrap();
        assert!(JobRecord::load(&dir).unwrap_err().is_metadata());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn status_is_tagged_by_state() {
        let json = serde_json::to_string(&JobStatus::Failed {
            message: "boom".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"state\":\"failed\""));
    }
}
