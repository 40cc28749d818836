//! Model facade: model values and derivatives for one set of model options.
//!
//! Directory identities and the matching spinup run are resolved lazily and
//! memoized; changing an option group only invalidates what depends on it.

use std::path::PathBuf;

use indexmap::IndexMap;
use ndarray::{Array2, ArrayD, Ix2};
use tracing::debug;

use sd_core::{
    DerivativeOptions, InitialConcentrationOptions, ModelOptions, SpinupOptions, TIME_STEPS,
    Tolerances,
};
use sd_deriv::{DerivativeEngine, DerivativeRequest, DerivativeSettings};
use sd_job::{JobBackend, StartState};
use sd_spinup::{DatabaseLayout, RunChain, RunRecord, RunTemplate, SpinupPolicy, SpinupRequest};
use sd_store::{FileParameterStore, ParameterStore};
use sd_trajectory::{
    DataSets, Sampling, TrajectoryAssembler, TrajectorySource, check_tracers,
    merge_tracer_data_sets, split_tracer_data_sets,
};

use crate::config::{DatabaseConfig, ModelDefinition};
use crate::error::{AppError, AppResult};
use crate::memo::{Memo, Versioned};

#[derive(Debug, Default)]
struct Resolved {
    concentration_index: Memo<usize>,
    parameter_set_index: Memo<usize>,
    closest_parameter_set_dir: Memo<Option<PathBuf>>,
    run: Memo<RunRecord>,
}

pub struct Model<B> {
    definition: ModelDefinition,
    layout: DatabaseLayout,
    backend: B,
    max_spinup_years: u32,
    start_from_closest: bool,
    factor_precision: u32,
    assembler: TrajectoryAssembler,

    concentrations: Versioned<InitialConcentrationOptions>,
    time_step: Versioned<u32>,
    parameters: Versioned<Vec<f64>>,
    parameter_tolerance: Versioned<Tolerances>,
    spinup_options: Versioned<SpinupOptions>,
    derivative_options: Versioned<DerivativeOptions>,
    resolved: Resolved,
}

impl<B: JobBackend> Model<B> {
    pub fn new(config: &DatabaseConfig, options: ModelOptions, backend: B) -> AppResult<Self> {
        options.validate()?;
        let definition = config.model(&options.model_name)?.clone();
        definition.check_bounds(&options.parameters)?;
        check_concentrations(&definition, &options.initial_concentration_options)?;
        debug!(model = %definition.name, "model created");

        Ok(Self {
            layout: config.layout(),
            backend,
            max_spinup_years: config.max_spinup_years,
            start_from_closest: config.start_from_closest_parameters,
            factor_precision: config.factor_id_precision,
            assembler: TrajectoryAssembler::new(config.tmp_dir.clone()),
            concentrations: Versioned::new(options.initial_concentration_options),
            time_step: Versioned::new(options.time_step),
            parameters: Versioned::new(options.parameters),
            parameter_tolerance: Versioned::new(options.parameter_tolerance),
            spinup_options: Versioned::new(options.spinup_options),
            derivative_options: Versioned::new(options.derivative_options),
            resolved: Resolved::default(),
            definition,
        })
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> ModelOptions {
        ModelOptions {
            model_name: self.definition.name.clone(),
            time_step: *self.time_step.get(),
            parameters: self.parameters.get().clone(),
            parameter_tolerance: *self.parameter_tolerance.get(),
            initial_concentration_options: self.concentrations.get().clone(),
            spinup_options: *self.spinup_options.get(),
            derivative_options: self.derivative_options.get().clone(),
        }
    }

    // *** option setters *** //

    pub fn set_parameters(&mut self, parameters: Vec<f64>) -> AppResult<()> {
        self.definition.check_bounds(&parameters)?;
        self.parameters.set(parameters);
        Ok(())
    }

    pub fn set_parameter_tolerance(&mut self, tolerance: Tolerances) {
        self.parameter_tolerance.set(tolerance);
    }

    pub fn set_time_step(&mut self, time_step: u32) -> AppResult<()> {
        if !TIME_STEPS.contains(&time_step) {
            return Err(AppError::InvalidInput(format!(
                "time step {time_step} is not one of {TIME_STEPS:?}"
            )));
        }
        self.time_step.set(time_step);
        Ok(())
    }

    pub fn set_initial_concentration_options(
        &mut self,
        options: InitialConcentrationOptions,
    ) -> AppResult<()> {
        check_concentrations(&self.definition, &options)?;
        self.concentrations.set(options);
        Ok(())
    }

    pub fn set_spinup_options(&mut self, options: SpinupOptions) -> AppResult<()> {
        options.validate()?;
        self.spinup_options.set(options);
        Ok(())
    }

    pub fn set_derivative_options(&mut self, options: DerivativeOptions) -> AppResult<()> {
        options.validate(self.definition.parameters_len())?;
        self.derivative_options.set(options);
        Ok(())
    }

    // *** directory identities *** //

    fn concentration_store(&self) -> FileParameterStore {
        self.layout.concentration_store(
            &self.definition.name,
            self.concentrations.get(),
            &self.definition.tracers,
        )
    }

    fn concentration_index(&mut self) -> AppResult<usize> {
        let versions = [self.concentrations.version()];
        if let Some(&index) = self.resolved.concentration_index.get(&versions) {
            return Ok(index);
        }
        let index = self
            .concentration_store()
            .get_or_add_index(&self.concentrations.get().concentrations)?;
        self.resolved.concentration_index.store(&versions, index);
        Ok(index)
    }

    pub fn concentration_dir(&mut self) -> AppResult<PathBuf> {
        let index = self.concentration_index()?;
        Ok(self.concentration_store().entry_dir(index))
    }

    pub fn time_step_dir(&mut self) -> AppResult<PathBuf> {
        let concentration_dir = self.concentration_dir()?;
        Ok(DatabaseLayout::time_step_dir(&concentration_dir, *self.time_step.get()))
    }

    fn parameter_store(&mut self) -> AppResult<FileParameterStore> {
        let time_step_dir = self.time_step_dir()?;
        Ok(self
            .layout
            .parameter_store(&time_step_dir, *self.parameter_tolerance.get()))
    }

    fn identity_versions(&self) -> [u64; 4] {
        [
            self.concentrations.version(),
            self.time_step.version(),
            self.parameters.version(),
            self.parameter_tolerance.version(),
        ]
    }

    fn parameter_set_index(&mut self) -> AppResult<usize> {
        let versions = self.identity_versions();
        if let Some(&index) = self.resolved.parameter_set_index.get(&versions) {
            return Ok(index);
        }
        let index = self.parameter_store()?.get_or_add_index(self.parameters.get())?;
        self.resolved.parameter_set_index.store(&versions, index);
        Ok(index)
    }

    pub fn parameter_set_dir(&mut self) -> AppResult<PathBuf> {
        let index = self.parameter_set_index()?;
        Ok(self.parameter_store()?.entry_dir(index))
    }

    /// Parameters as stored in the database. They may differ from the
    /// requested ones within the parameter tolerance.
    pub fn parameters(&mut self) -> AppResult<Vec<f64>> {
        let index = self.parameter_set_index()?;
        Ok(self.parameter_store()?.get_value(index)?)
    }

    pub fn spinup_dir(&mut self) -> AppResult<PathBuf> {
        Ok(DatabaseLayout::spinup_dir(&self.parameter_set_dir()?))
    }

    /// Directory of the nearest other stored parameter set with at least one
    /// spinup run.
    pub fn closest_parameter_set_dir(&mut self) -> AppResult<Option<PathBuf>> {
        let versions = self.identity_versions();
        if let Some(closest) = self.resolved.closest_parameter_set_dir.get(&versions) {
            return Ok(closest.clone());
        }

        let own = self.parameter_set_index()?;
        let store = self.parameter_store()?;
        let mut closest = None;
        for index in store.indices_by_distance(self.parameters.get())? {
            if index == own {
                continue;
            }
            let parameter_set_dir = store.entry_dir(index);
            if !RunChain::discover(&DatabaseLayout::spinup_dir(&parameter_set_dir))?.is_empty() {
                closest = Some(parameter_set_dir);
                break;
            }
        }

        debug!(closest = ?closest, "closest parameter set resolved");
        self.resolved
            .closest_parameter_set_dir
            .store(&versions, closest.clone());
        Ok(closest)
    }

    fn run_template(&mut self) -> AppResult<RunTemplate> {
        let cold_start = if self.concentrations.get().use_constant_concentrations {
            StartState::Constant {
                concentrations: self.concentrations.get().concentrations.clone(),
            }
        } else {
            let index = self.concentration_index()?;
            let root = self.backend.output_root();
            let tracer_input_files = self
                .concentration_store()
                .value_files(index)?
                .iter()
                .map(|path| root.to_portable(path))
                .collect();
            StartState::Files { tracer_input_files }
        };
        Ok(RunTemplate {
            model_name: self.definition.name.clone(),
            tracers: self.definition.tracers.clone(),
            parameters: self.parameters()?,
            time_step: *self.time_step.get(),
            cold_start,
        })
    }

    fn policy(&self) -> SpinupPolicy<'_, B> {
        SpinupPolicy::new(&self.backend, self.max_spinup_years)
            .with_start_from_closest(self.start_from_closest)
    }

    /// Finished spinup run matching the spinup options, started if needed.
    pub fn run(&mut self) -> AppResult<RunRecord> {
        let [c, t, p, tol] = self.identity_versions();
        let versions = [c, t, p, tol, self.spinup_options.version()];
        if let Some(run) = self.resolved.run.get(&versions) {
            return Ok(run.clone());
        }

        let closest_spinup_dir = if self.start_from_closest {
            self.closest_parameter_set_dir()?
                .map(|dir| DatabaseLayout::spinup_dir(&dir))
        } else {
            None
        };
        let request = SpinupRequest {
            spinup_dir: self.spinup_dir()?,
            closest_spinup_dir,
            template: self.run_template()?,
        };
        let run = self.policy().resolve(&request, self.spinup_options.get())?;
        self.resolved.run.store(&versions, run.clone());
        Ok(run)
    }

    /// Derivative runs continue the matching spinup run; the directory
    /// encodes its total years next to the derivative options.
    pub fn derivative_dir(&mut self) -> AppResult<PathBuf> {
        let run = self.run()?;
        Ok(DatabaseLayout::derivative_dir(
            &self.parameter_set_dir()?,
            run.total_years,
            self.derivative_options.get(),
        ))
    }

    // *** model values *** //

    pub fn check_tracers(&self, tracers: Option<&[String]>) -> AppResult<Vec<String>> {
        Ok(check_tracers(tracers, &self.definition.tracers)?)
    }

    fn values(&mut self, tracers: &[String], sampling: &Sampling<'_>) -> AppResult<IndexMap<String, ArrayD<f64>>> {
        if tracers.is_empty() {
            return Ok(IndexMap::new());
        }
        let run = self.run()?;
        let parameters = self.parameters()?;
        let source = TrajectorySource {
            run_dir: &run.directory,
            model_name: &self.definition.name,
            model_tracers: &self.definition.tracers,
            parameters: &parameters,
            time_step: *self.time_step.get(),
        };
        Ok(self.assembler.values(&self.backend, &source, tracers, sampling)?)
    }

    /// Values averaged to `time_dim` time steps: `[time_dim, cells]` per tracer.
    pub fn f_all(&mut self, time_dim: usize, tracers: Option<&[String]>) -> AppResult<IndexMap<String, ArrayD<f64>>> {
        let tracers = self.check_tracers(tracers)?;
        debug!(?tracers, time_dim, "calculating all f values");
        self.values(&tracers, &Sampling::Dense { time_dim })
    }

    /// Values at `(t, x, y, z)` points, given per tracer and data set.
    pub fn f_points(&mut self, points: &IndexMap<String, DataSets>) -> AppResult<IndexMap<String, DataSets>> {
        let (tracers, merged, plans) = self.merge_points(points)?;
        debug!(?tracers, "calculating f values at points");
        let values = self.values(&tracers, &Sampling::Points(&merged))?;
        Ok(split_tracer_data_sets(&values, &plans)?)
    }

    fn derivative(
        &mut self,
        tracers: &[String],
        sampling: &Sampling<'_>,
        settings: DerivativeSettings,
    ) -> AppResult<IndexMap<String, ArrayD<f64>>> {
        if tracers.is_empty() {
            return Ok(IndexMap::new());
        }
        let run = self.run()?;
        let derivative_dir = self.derivative_dir()?;
        let template = self.run_template()?;
        let options = self.derivative_options.get().clone();
        let typical_values = options
            .parameters_typical_values
            .clone()
            .unwrap_or_else(|| self.definition.parameters_typical_values.clone());

        let policy = SpinupPolicy::new(&self.backend, self.max_spinup_years);
        let engine = DerivativeEngine::new(&policy, self.factor_precision);
        let request = DerivativeRequest {
            derivative_dir: &derivative_dir,
            spinup_run: &run.directory,
            spinup_options: self.spinup_options.get(),
            template: &template,
            bounds: &self.definition.parameter_bounds,
            typical_values: &typical_values,
            options: &options,
            settings,
        };
        Ok(engine.derivative(&request, tracers, sampling, &mut self.assembler)?)
    }

    /// Derivative of [`Model::f_all`]; the parameter axes come last.
    pub fn df_all(
        &mut self,
        time_dim: usize,
        tracers: Option<&[String]>,
        settings: DerivativeSettings,
    ) -> AppResult<IndexMap<String, ArrayD<f64>>> {
        let tracers = self.check_tracers(tracers)?;
        debug!(?tracers, time_dim, ?settings, "calculating all df values");
        self.derivative(&tracers, &Sampling::Dense { time_dim }, settings)
    }

    /// Derivative of [`Model::f_points`]; the parameter axes come last.
    pub fn df_points(
        &mut self,
        points: &IndexMap<String, DataSets>,
        settings: DerivativeSettings,
    ) -> AppResult<IndexMap<String, DataSets>> {
        let (tracers, merged, plans) = self.merge_points(points)?;
        debug!(?tracers, ?settings, "calculating df values at points");
        let df = self.derivative(&tracers, &Sampling::Points(&merged), settings)?;
        Ok(split_tracer_data_sets(&df, &plans)?)
    }

    #[allow(clippy::type_complexity)]
    fn merge_points(
        &self,
        points: &IndexMap<String, DataSets>,
    ) -> AppResult<(
        Vec<String>,
        IndexMap<String, Array2<f64>>,
        IndexMap<String, sd_trajectory::SplitPlan>,
    )> {
        let requested: Vec<String> = points.keys().cloned().collect();
        let tracers = self.check_tracers(Some(requested.as_slice()))?;
        let (merged, plans) = merge_tracer_data_sets(points)?;
        let mut matrices = IndexMap::with_capacity(merged.len());
        for (tracer, values) in merged {
            let values = if values.is_empty() {
                Array2::zeros((0, 4))
            } else {
                values.into_dimensionality::<Ix2>()?
            };
            matrices.insert(tracer, values);
        }
        Ok((tracers, matrices, plans))
    }
}

fn check_concentrations(
    definition: &ModelDefinition,
    options: &InitialConcentrationOptions,
) -> AppResult<()> {
    let tracers = definition.tracers.len();
    let len = options.concentrations.len();
    let fits = if options.use_constant_concentrations {
        len == tracers
    } else {
        len > 0 && len % tracers == 0
    };
    if fits {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "{len} initial concentration values do not fit the {tracers} tracers of model '{}'",
            definition.name
        )))
    }
}
