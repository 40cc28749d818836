//! Decides whether a run chain satisfies spinup options and extends it when
//! it does not.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use sd_core::{Combination, MatchType, SpinupOptions};
use sd_job::{JobBackend, JobConfig, JobController, StartState};

use crate::chain::{RunChain, RunRecord, total_years};
use crate::SpinupResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    /// AND options whose tolerance was not reached, accepted because the
    /// chain hit the maximal spinup years.
    MatchedByYearCap,
    NotMatched,
}

impl MatchOutcome {
    pub fn is_match(self) -> bool {
        !matches!(self, Self::NotMatched)
    }
}

/// Compare what a run achieved against `options`.
pub fn assess(
    total_years: u32,
    achieved_tolerance: f64,
    options: &SpinupOptions,
    max_years: u32,
) -> MatchOutcome {
    let converged = achieved_tolerance <= options.tolerance;
    let long_enough = total_years >= options.years;
    match options.combination {
        Combination::Or if long_enough || converged => MatchOutcome::Matched,
        Combination::Or => MatchOutcome::NotMatched,
        Combination::And if long_enough && converged => MatchOutcome::Matched,
        Combination::And if total_years >= max_years && converged => MatchOutcome::Matched,
        Combination::And if total_years >= max_years => MatchOutcome::MatchedByYearCap,
        Combination::And => MatchOutcome::NotMatched,
    }
}

/// Identity-independent part of every run started for one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTemplate {
    pub model_name: String,
    pub tracers: Vec<String>,
    pub parameters: Vec<f64>,
    pub time_step: u32,
    /// Start state used when no run can be warm started from.
    pub cold_start: StartState,
}

impl RunTemplate {
    pub fn job_config(
        &self,
        years: u32,
        tolerance: f64,
        start: StartState,
        predecessor: Option<String>,
    ) -> JobConfig {
        JobConfig {
            model_name: self.model_name.clone(),
            tracers: self.tracers.clone(),
            parameters: self.parameters.clone(),
            years,
            tolerance,
            time_step: self.time_step,
            start,
            concentration_factor: 1.0,
            write_trajectory: false,
            predecessor,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpinupRequest {
    pub spinup_dir: PathBuf,
    /// Spinup directory of the closest stored parameter set.
    pub closest_spinup_dir: Option<PathBuf>,
    pub template: RunTemplate,
}

pub struct SpinupPolicy<'a, B> {
    backend: &'a B,
    max_years: u32,
    start_from_closest: bool,
}

impl<'a, B: JobBackend> SpinupPolicy<'a, B> {
    pub fn new(backend: &'a B, max_years: u32) -> Self {
        Self {
            backend,
            max_years,
            start_from_closest: false,
        }
    }

    pub fn with_start_from_closest(mut self, enabled: bool) -> Self {
        self.start_from_closest = enabled;
        self
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    pub fn max_years(&self) -> u32 {
        self.max_years
    }

    /// Return a finished run of the request's chain satisfying `options`,
    /// starting new runs as needed.
    pub fn resolve(&self, request: &SpinupRequest, options: &SpinupOptions) -> SpinupResult<RunRecord> {
        options.validate()?;
        debug!(spinup_dir = %request.spinup_dir.display(), %options, "resolving spinup run");

        let chain = RunChain::discover(&request.spinup_dir)?;
        if let Some(run_dir) = self.matching_in_chain(&chain, options)? {
            return RunRecord::load(self.backend, &run_dir);
        }

        match options.combination {
            Combination::Or => self.extend(request, chain, options),
            Combination::And => {
                let years = SpinupOptions::years_only(options.years);
                self.resolve(request, &years)?;
                let tolerance = SpinupOptions::new(self.max_years, options.tolerance, Combination::Or);
                self.resolve(request, &tolerance)
            }
        }
    }

    /// Matching run of an existing chain without starting anything new. The
    /// last run is waited for before it is assessed.
    pub fn matching_in_chain(
        &self,
        chain: &RunChain,
        options: &SpinupOptions,
    ) -> SpinupResult<Option<PathBuf>> {
        let runs = chain.runs();
        let Some(last) = runs.last() else {
            return Ok(None);
        };
        self.finish_run(last)?;

        let mut outcome = self.is_matching(last, options)?;
        if !outcome.is_match() {
            debug!(run_dir = %last.display(), "last run does not match");
            return Ok(None);
        }

        let mut index = runs.len() - 1;
        if options.match_type == MatchType::EqualOrNearestBetter {
            while index > 0 {
                let previous = self.is_matching(&runs[index - 1], options)?;
                if !previous.is_match() {
                    break;
                }
                index -= 1;
                outcome = previous;
            }
        }

        let run_dir = runs[index].clone();
        if outcome == MatchOutcome::MatchedByYearCap {
            warn!(
                run_dir = %run_dir.display(),
                tolerance = options.tolerance,
                max_years = self.max_years,
                "run does not reach the desired tolerance but the maximal spinup years are reached"
            );
        }
        debug!(run_dir = %run_dir.display(), match_type = ?options.match_type, "matching run found");
        Ok(Some(run_dir))
    }

    pub fn is_matching(&self, run_dir: &Path, options: &SpinupOptions) -> SpinupResult<MatchOutcome> {
        let years = total_years(self.backend, run_dir)?;
        let tolerance = self.backend.open(run_dir)?.achieved_tolerance()?;
        let outcome = assess(years, tolerance, options, self.max_years);
        debug!(run_dir = %run_dir.display(), years, tolerance, ?outcome, "run assessed");
        Ok(outcome)
    }

    /// Block until the run has finished, then protect it from further writes.
    pub fn finish_run(&self, run_dir: &Path) -> SpinupResult<()> {
        let mut job = self.backend.open(run_dir)?;
        job.wait_until_finished()?;
        job.set_read_only(true, true)?;
        Ok(())
    }

    /// Configure and submit a run without waiting for it.
    pub fn launch(&self, run_dir: &Path, config: JobConfig, read_only_inputs: bool) -> SpinupResult<()> {
        let mut job = self.backend.create(run_dir);
        job.configure(config)?;
        job.start()?;
        job.set_read_only(read_only_inputs, false)?;
        Ok(())
    }

    /// Start state continuing from the outputs of a finished run.
    pub fn warm_start_from(&self, run_dir: &Path) -> SpinupResult<StartState> {
        let job = self.backend.open(run_dir)?;
        let root = self.backend.output_root();
        let tracer_input_files = job
            .tracer_output_files()?
            .iter()
            .map(|path| root.to_portable(path))
            .collect();
        Ok(StartState::Files { tracer_input_files })
    }

    fn closest_seed(&self, request: &SpinupRequest) -> SpinupResult<Option<PathBuf>> {
        if !self.start_from_closest {
            return Ok(None);
        }
        let Some(closest) = request.closest_spinup_dir.as_deref() else {
            return Ok(None);
        };
        if closest == request.spinup_dir {
            return Ok(None);
        }
        let chain = RunChain::discover(closest)?;
        let Some(last) = chain.last_run_dir() else {
            return Ok(None);
        };
        if let Err(e) = self.finish_run(last) {
            warn!(run_dir = %last.display(), error = %e, "closest run unusable, cold starting");
            return Ok(None);
        }
        Ok(Some(last.to_path_buf()))
    }

    fn extend(
        &self,
        request: &SpinupRequest,
        mut chain: RunChain,
        options: &SpinupOptions,
    ) -> SpinupResult<RunRecord> {
        let root = self.backend.output_root();
        let (start, predecessor, accumulated) = match chain.last_run_dir() {
            Some(last) => (
                self.warm_start_from(last)?,
                Some(root.to_portable(last)),
                total_years(self.backend, last)?,
            ),
            None => match self.closest_seed(request)? {
                Some(seed) => {
                    debug!(seed = %seed.display(), "warm starting from closest parameter set");
                    (self.warm_start_from(&seed)?, None, 0)
                }
                None => (request.template.cold_start.clone(), None, 0),
            },
        };

        let years = options.years.saturating_sub(accumulated).max(1);
        let run_dir = chain.claim_next_run()?;
        info!(
            run_dir = %run_dir.display(),
            years,
            tolerance = options.tolerance,
            accumulated,
            "starting spinup run"
        );

        let config = request
            .template
            .job_config(years, options.tolerance, start, predecessor);
        self.launch(&run_dir, config, true)?;
        self.finish_run(&run_dir)?;
        RunRecord::load(self.backend, &run_dir)
    }
}
