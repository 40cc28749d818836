//! Tracer output files written by a finished run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::JobResult;
use crate::record::write_json;

pub const TRAJECTORY_DIR: &str = "trajectory";

pub fn output_file_name(tracer: &str) -> String {
    format!("{tracer}_output.json")
}

pub fn trajectory_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(TRAJECTORY_DIR)
}

pub fn trajectory_file(run_dir: &Path, tracer: &str) -> PathBuf {
    trajectory_dir(run_dir).join(format!("{tracer}.json"))
}

/// One tracer's state over one model year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerTrajectory {
    pub time_dim: usize,
    /// `(x, y, z)` of each ocean cell, `x` in degrees east.
    pub coordinates: Vec<[f64; 3]>,
    /// `values[t][cell]`.
    pub values: Vec<Vec<f64>>,
}

impl TracerTrajectory {
    pub fn load(path: &Path) -> JobResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: &Path) -> JobResult<()> {
        write_json(path, self)
    }
}

pub fn read_state(path: &Path) -> JobResult<Vec<f64>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

pub fn write_state(path: &Path, state: &[f64]) -> JobResult<()> {
    write_json(path, &state)
}
