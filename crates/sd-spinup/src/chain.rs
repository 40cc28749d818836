//! Ordered runs of one spinup directory.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use sd_job::{JobBackend, JobController};

use crate::layout::DatabaseLayout;
use crate::{SpinupError, SpinupResult};

/// A finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub directory: PathBuf,
    /// Years integrated by this run alone.
    pub achieved_years: u32,
    /// Years including every predecessor.
    pub total_years: u32,
    pub achieved_tolerance: f64,
    pub tracer_outputs: Vec<PathBuf>,
    pub predecessor: Option<PathBuf>,
}

impl RunRecord {
    /// Read a finished run. Fails when the run or one of its predecessors
    /// has not finished.
    pub fn load<B: JobBackend>(backend: &B, run_dir: &Path) -> SpinupResult<Self> {
        let job = backend.open(run_dir)?;
        Ok(Self {
            directory: run_dir.to_path_buf(),
            achieved_years: job.achieved_years()?,
            total_years: total_years(backend, run_dir)?,
            achieved_tolerance: job.achieved_tolerance()?,
            tracer_outputs: job.tracer_output_files()?,
            predecessor: job.predecessor()?,
        })
    }
}

/// Sum of the achieved years of `run_dir` and all its predecessors.
pub fn total_years<B: JobBackend>(backend: &B, run_dir: &Path) -> SpinupResult<u32> {
    let mut visited = HashSet::new();
    let mut total = 0_u32;
    let mut current = Some(run_dir.to_path_buf());
    while let Some(dir) = current {
        if !visited.insert(dir.clone()) {
            error!(run_dir = %run_dir.display(), cycle_at = %dir.display(), "predecessor cycle");
            return Err(SpinupError::Integrity {
                path: dir,
                reason: "predecessor references form a cycle".to_string(),
            });
        }
        let job = backend.open(&dir)?;
        total = total.saturating_add(job.achieved_years()?);
        current = job.predecessor()?;
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunChain {
    spinup_dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl RunChain {
    /// Enumerate the run directories of `spinup_dir`. A missing directory is
    /// an empty chain.
    pub fn discover(spinup_dir: &Path) -> SpinupResult<Self> {
        let entries = match fs::read_dir(spinup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::empty(spinup_dir)),
            Err(e) => return Err(SpinupError::fs(spinup_dir, e)),
        };

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SpinupError::fs(spinup_dir, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| SpinupError::fs(entry.path(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(index) = entry.file_name().to_str().and_then(DatabaseLayout::parse_run_dirname) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        if let Some(gap) = indices.iter().enumerate().find(|(i, index)| i != *index) {
            let path = spinup_dir.join(DatabaseLayout::run_dirname(gap.0));
            error!(spinup_dir = %spinup_dir.display(), missing = gap.0, "run chain has a gap");
            return Err(SpinupError::Integrity {
                path,
                reason: format!("run indices are not contiguous: {indices:?}"),
            });
        }

        let runs = indices
            .into_iter()
            .map(|i| spinup_dir.join(DatabaseLayout::run_dirname(i)))
            .collect::<Vec<_>>();
        debug!(spinup_dir = %spinup_dir.display(), runs = runs.len(), "run chain discovered");
        Ok(Self {
            spinup_dir: spinup_dir.to_path_buf(),
            runs,
        })
    }

    /// Like [`RunChain::discover`], but filesystem errors are logged and
    /// yield an empty chain.
    pub fn discover_best_effort(spinup_dir: &Path) -> SpinupResult<Self> {
        match Self::discover(spinup_dir) {
            Err(SpinupError::FilesystemAccess { path, source }) => {
                warn!(path = %path.display(), error = %source, "skipping unreadable spinup directory");
                Ok(Self::empty(spinup_dir))
            }
            other => other,
        }
    }

    fn empty(spinup_dir: &Path) -> Self {
        Self {
            spinup_dir: spinup_dir.to_path_buf(),
            runs: Vec::new(),
        }
    }

    pub fn spinup_dir(&self) -> &Path {
        &self.spinup_dir
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn runs(&self) -> &[PathBuf] {
        &self.runs
    }

    pub fn run_dir(&self, index: usize) -> Option<&Path> {
        self.runs.get(index).map(PathBuf::as_path)
    }

    pub fn last_run_dir(&self) -> Option<&Path> {
        self.runs.last().map(PathBuf::as_path)
    }

    /// Create the directory of the next run. The non-recursive create fails if
    /// another process claimed the same index first.
    pub fn claim_next_run(&mut self) -> SpinupResult<PathBuf> {
        fs::create_dir_all(&self.spinup_dir).map_err(|e| SpinupError::fs(&self.spinup_dir, e))?;
        let run_dir = self
            .spinup_dir
            .join(DatabaseLayout::run_dirname(self.runs.len()));
        match fs::create_dir(&run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(run_dir = %run_dir.display(), "run directory already claimed");
                return Err(SpinupError::ConcurrentRunCreation { path: run_dir });
            }
            Err(e) => return Err(SpinupError::fs(&run_dir, e)),
        }
        debug!(run_dir = %run_dir.display(), "new run directory created");
        self.runs.push(run_dir.clone());
        Ok(run_dir)
    }
}
