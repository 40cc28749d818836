//! Derivatives of model output from perturbed runs.
//!
//! Every stencil point gets its own run directory below the derivative
//! directory, named by its factor id. All missing runs are submitted first;
//! afterwards the points are waited on and evaluated one at a time in stencil
//! order, so the result does not depend on which job finishes first.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use nalgebra::DVector;
use ndarray::{Array1, ArrayD, Axis, IxDyn, Slice};
use tracing::{debug, error, info, warn};

use sd_core::{
    CoreError, DerivativeOptions, SpinupOptions, Tolerances, nearly_equal, validate_accuracy_order,
    vectors_nearly_equal,
};
use sd_job::{JobBackend, JobConfig, JobController, JobError, JobStatus, StartState};
use sd_spinup::{DatabaseLayout, RunTemplate, SpinupError, SpinupPolicy};
use sd_trajectory::{Sampling, SpatialInterpolator, TrajectoryAssembler, TrajectorySource};

use crate::factor_id::factor_id;
use crate::finite_diff::Stencil;
use crate::{DerivativeError, DerivativeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivativeSettings {
    /// 1 (gradient) or 2 (Hessian).
    pub order: u8,
    /// Overrides the accuracy order of the derivative options.
    pub accuracy_order: Option<u8>,
    /// Also differentiate with respect to a factor scaling the total
    /// concentration of the start state.
    pub include_total_concentration: bool,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            order: 1,
            accuracy_order: None,
            include_total_concentration: false,
        }
    }
}

/// One derivative of one parameter set.
#[derive(Debug, Clone, Copy)]
pub struct DerivativeRequest<'a> {
    pub derivative_dir: &'a Path,
    /// Finished spinup run every perturbed run continues from.
    pub spinup_run: &'a Path,
    /// Options the spinup run was resolved with. Reused runs must continue a
    /// run satisfying them.
    pub spinup_options: &'a SpinupOptions,
    /// Template with the stored model parameters.
    pub template: &'a RunTemplate,
    pub bounds: &'a [[f64; 2]],
    pub typical_values: &'a [f64],
    pub options: &'a DerivativeOptions,
    pub settings: DerivativeSettings,
}

pub struct DerivativeEngine<'p, 'b, B> {
    policy: &'p SpinupPolicy<'b, B>,
    factor_precision: u32,
}

/// Stencil of a request. Points hold the model parameters followed by the
/// concentration factor, if it is differentiated too.
struct Perturbation {
    stencil: Stencil,
    model_parameters: usize,
}

impl Perturbation {
    /// Model parameters and concentration factor of a stencil point.
    fn split<'x>(&self, point: &'x DVector<f64>) -> (&'x [f64], f64) {
        let point = point.as_slice();
        let factor = point.get(self.model_parameters).copied().unwrap_or(1.0);
        (&point[..self.model_parameters], factor)
    }
}

impl<'p, 'b, B: JobBackend> DerivativeEngine<'p, 'b, B> {
    pub fn new(policy: &'p SpinupPolicy<'b, B>, factor_precision: u32) -> Self {
        Self {
            policy,
            factor_precision,
        }
    }

    /// Derivative of the values of `tracers`, sampled as requested.
    ///
    /// Each returned array has the shape of the tracer's values followed by
    /// one (first order) or two (second order) parameter axes.
    pub fn derivative<I: SpatialInterpolator>(
        &self,
        request: &DerivativeRequest<'_>,
        tracers: &[String],
        sampling: &Sampling<'_>,
        assembler: &mut TrajectoryAssembler<I>,
    ) -> DerivativeResult<IndexMap<String, ArrayD<f64>>> {
        if tracers.is_empty() {
            return Ok(IndexMap::new());
        }
        let perturbation = self.perturbation(request)?;
        let stencil = &perturbation.stencil;
        debug!(
            derivative_dir = %request.derivative_dir.display(),
            order = stencil.order(),
            points = stencil.points().len(),
            "computing derivative"
        );

        let run_dirs = self.submit_missing(request, &perturbation)?;

        let model_tracers = &request.template.tracers;
        let backend = self.policy.backend();
        let mut tracer_shapes: Option<Vec<Vec<usize>>> = None;
        let df = stencil.combine(|i, point| {
            let run_dir = &run_dirs[i];
            self.finished_run(run_dir, request.options.years)?;

            let (parameters, _) = perturbation.split(point);
            let source = TrajectorySource {
                run_dir,
                model_name: &request.template.model_name,
                model_tracers,
                parameters,
                time_step: request.template.time_step,
            };
            let values = assembler.values(backend, &source, tracers, sampling)?;

            let mut flat = Vec::new();
            let mut shapes = Vec::with_capacity(tracers.len());
            for tracer in tracers {
                let array = values.get(tracer).ok_or_else(|| {
                    DerivativeError::invalid(format!("no values of tracer {tracer} in {}", run_dir.display()))
                })?;
                shapes.push(array.shape().to_vec());
                flat.extend(array.iter().copied());
            }
            if tracer_shapes.is_none() {
                tracer_shapes = Some(shapes);
            }
            Ok(Array1::from(flat).into_dyn())
        })?;

        let shapes = tracer_shapes.ok_or_else(|| DerivativeError::invalid("stencil without points"))?;
        split_by_tracer(df, stencil.order(), tracers, &shapes)
    }

    fn perturbation(&self, request: &DerivativeRequest<'_>) -> DerivativeResult<Perturbation> {
        let settings = request.settings;
        if !matches!(settings.order, 1 | 2) {
            return Err(DerivativeError::invalid(format!(
                "derivative order must be 1 or 2, got {}",
                settings.order
            )));
        }
        let accuracy_order = settings
            .accuracy_order
            .unwrap_or(request.options.accuracy_order);
        validate_accuracy_order(accuracy_order)?;

        let parameters = &request.template.parameters;
        let n = parameters.len();
        request.options.validate(n)?;
        for (what, len) in [
            ("parameter bounds", request.bounds.len()),
            ("parameters typical values", request.typical_values.len()),
        ] {
            if len != n {
                return Err(CoreError::LengthMismatch {
                    what,
                    expected: n,
                    actual: len,
                }
                .into());
            }
        }

        let mut base = parameters.clone();
        let mut bounds = request.bounds.to_vec();
        let mut typical = request.typical_values.to_vec();
        if settings.include_total_concentration {
            base.push(1.0);
            bounds.push([0.0, f64::INFINITY]);
            typical.push(1.0);
        }
        let steps: Vec<f64> = typical
            .iter()
            .map(|t| request.options.step_size * t.abs())
            .collect();

        let (base, steps) = (DVector::from_vec(base), DVector::from_vec(steps));
        let stencil = if settings.order == 1 {
            Stencil::first_derivative(base, steps, &bounds, accuracy_order)?
        } else {
            Stencil::second_derivative(base, steps, &bounds, accuracy_order)?
        };
        Ok(Perturbation {
            stencil,
            model_parameters: n,
        })
    }

    /// Run directory of every stencil point. Points without a reusable run
    /// get a new one, submitted without waiting.
    fn submit_missing(
        &self,
        request: &DerivativeRequest<'_>,
        perturbation: &Perturbation,
    ) -> DerivativeResult<Vec<PathBuf>> {
        let stencil = &perturbation.stencil;
        let root = self.policy.backend().output_root();
        let start = self.policy.warm_start_from(request.spinup_run)?;
        let predecessor = root.to_portable(request.spinup_run);

        let mut run_dirs = Vec::with_capacity(stencil.points().len());
        let mut seen = HashSet::new();
        let (mut reused, mut started) = (0_usize, 0_usize);
        for point in stencil.points() {
            let id = factor_id(
                point.as_slice(),
                stencil.base().as_slice(),
                stencil.steps().as_slice(),
                self.factor_precision,
            )?;
            let run_dir = DatabaseLayout::partial_derivative_dir(request.derivative_dir, &id);
            run_dirs.push(run_dir.clone());
            if !seen.insert(run_dir.clone()) {
                continue;
            }

            let (parameters, concentration_factor) = perturbation.split(point);
            let mut config = request.template.job_config(
                request.options.years,
                0.0,
                start.clone(),
                Some(predecessor.clone()),
            );
            config.parameters = parameters.to_vec();
            config.concentration_factor = concentration_factor;

            if self.is_reusable(&run_dir, &config, request.spinup_options)? {
                debug!(run_dir = %run_dir.display(), "reusing derivative run");
                reused += 1;
                continue;
            }
            purge(&run_dir);
            debug!(run_dir = %run_dir.display(), %id, "starting derivative run");
            self.policy.launch(&run_dir, config, true)?;
            started += 1;
        }
        info!(
            derivative_dir = %request.derivative_dir.display(),
            reused,
            started,
            "derivative runs prepared"
        );
        Ok(run_dirs)
    }

    /// Whether the run in `run_dir` was started like `wanted`, continues a
    /// spinup satisfying `spinup_options` and has not failed. Missing or
    /// malformed metadata means there is no run.
    fn is_reusable(
        &self,
        run_dir: &Path,
        wanted: &JobConfig,
        spinup_options: &SpinupOptions,
    ) -> DerivativeResult<bool> {
        let job = match self.policy.backend().open(run_dir) {
            Ok(job) => job,
            Err(e) if e.is_metadata() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !same_run(job.config()?, wanted) {
            debug!(run_dir = %run_dir.display(), "derivative run configured differently");
            return Ok(false);
        }

        let Some(predecessor) = job.predecessor()? else {
            return Ok(false);
        };
        match self.policy.is_matching(&predecessor, spinup_options) {
            Ok(outcome) if outcome.is_match() => {}
            Ok(_) => return Ok(false),
            Err(SpinupError::Job(e)) if e.is_metadata() || matches!(e, JobError::Failed { .. }) => {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        match job.status() {
            Ok(JobStatus::Finished { achieved_years, .. }) => Ok(achieved_years >= wanted.years),
            Ok(JobStatus::Submitted { .. }) => Ok(true),
            Ok(JobStatus::Failed { .. }) | Err(JobError::NotSubmitted { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn finished_run(&self, run_dir: &Path, years: u32) -> DerivativeResult<()> {
        self.policy.finish_run(run_dir)?;
        let achieved = self.policy.backend().open(run_dir)?.achieved_years()?;
        if achieved < years {
            let reason = format!("run finished after {achieved} of {years} years");
            error!(run_dir = %run_dir.display(), %reason, "derivative run integrity violated");
            return Err(DerivativeError::Integrity {
                path: run_dir.to_path_buf(),
                reason,
            });
        }
        Ok(())
    }
}

fn same_run(stored: &JobConfig, wanted: &JobConfig) -> bool {
    let tol = Tolerances::default();
    stored.model_name == wanted.model_name
        && stored.tracers == wanted.tracers
        && stored.time_step == wanted.time_step
        && stored.years >= wanted.years
        && vectors_nearly_equal(&stored.parameters, &wanted.parameters, tol)
        && nearly_equal(stored.concentration_factor, wanted.concentration_factor, tol)
        && matches!(stored.start, StartState::Files { .. })
}

/// Remove the contents of a stale run directory. Failures are logged only.
fn purge(run_dir: &Path) {
    let entries = match fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!(run_dir = %run_dir.display(), error = %e, "cannot list stale derivative run");
            return;
        }
    };
    debug!(run_dir = %run_dir.display(), "removing stale derivative run");
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!(path = %path.display(), error = %e, "cannot remove stale derivative output");
        }
    }
}

/// Move the parameter axes of `df` behind the value axis and cut the value
/// axis back into one array per tracer.
fn split_by_tracer(
    df: ArrayD<f64>,
    order: u8,
    tracers: &[String],
    shapes: &[Vec<usize>],
) -> DerivativeResult<IndexMap<String, ArrayD<f64>>> {
    let order = usize::from(order);
    let mut axes: Vec<usize> = (order..df.ndim()).collect();
    axes.extend(0..order);
    let df = df.permuted_axes(IxDyn(&axes));
    let parameter_axes = df.shape()[1..].to_vec();

    let total: usize = shapes.iter().map(|s| s.iter().product::<usize>()).sum();
    if total != df.len_of(Axis(0)) {
        return Err(DerivativeError::invalid(format!(
            "tracer values hold {total} entries, derivative has {}",
            df.len_of(Axis(0))
        )));
    }

    let mut result = IndexMap::with_capacity(tracers.len());
    let mut start = 0;
    for (tracer, shape) in tracers.iter().zip(shapes) {
        let len: usize = shape.iter().product();
        let block = df.slice_axis(Axis(0), Slice::from(start..start + len));
        let mut full_shape = shape.clone();
        full_shape.extend_from_slice(&parameter_axes);
        let array = ArrayD::from_shape_vec(IxDyn(&full_shape), block.iter().copied().collect())?;
        result.insert(tracer.clone(), array);
        start += len;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn gradient_is_split_with_parameter_axis_last() {
        // 2 parameters, tracer A with 2 values, tracer B with shape [1, 3].
        let df = ArrayD::from_shape_vec(
            IxDyn(&[2, 5]),
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 10.0, 11.0, 12.0, 13.0, 14.0],
        )
        .unwrap();
        let split =
            split_by_tracer(df, 1, &tracers(&["A", "B"]), &[vec![2], vec![1, 3]]).unwrap();

        assert_eq!(split["A"].shape(), &[2, 2]);
        assert_eq!(split["A"][[1, 0]], 1.0);
        assert_eq!(split["A"][[1, 1]], 11.0);
        assert_eq!(split["B"].shape(), &[1, 3, 2]);
        assert_eq!(split["B"][[0, 2, 0]], 4.0);
        assert_eq!(split["B"][[0, 2, 1]], 14.0);
    }

    #[test]
    fn hessian_keeps_both_parameter_axes() {
        let df = ArrayD::from_shape_fn(IxDyn(&[2, 2, 3]), |ix| (ix[0] * 100 + ix[1] * 10 + ix[2]) as f64);
        let split = split_by_tracer(df, 2, &tracers(&["A"]), &[vec![3]]).unwrap();
        assert_eq!(split["A"].shape(), &[3, 2, 2]);
        assert_eq!(split["A"][[2, 1, 0]], 102.0);
    }

    #[test]
    fn mismatching_shapes_are_rejected() {
        let df = ArrayD::zeros(IxDyn(&[1, 4]));
        assert!(matches!(
            split_by_tracer(df, 1, &tracers(&["A"]), &[vec![3]]),
            Err(DerivativeError::InvalidValue { .. })
        ));
    }
}
