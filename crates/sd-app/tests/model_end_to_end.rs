use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use ndarray::{ArrayD, array};
use sd_app::{
    AppError, DataSets, DatabaseConfig, DerivativeSettings, Model, ModelDefinition,
    check_integrity, option_sets,
};
use sd_core::{DerivativeOptions, ModelOptions, SpinupOptions, TIME_STEPS};
use sd_job::{
    BatchSystem, FileJobBackend, InitialState, LocalBatch, SimulationInput, SimulationOutput,
    Simulator, TracerTrajectory,
};
use sd_spinup::RunChain;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
}

/// Every simulated year adds `p0 + 2 p1` to each of two cells.
struct Linear;

impl Simulator for Linear {
    fn simulate(&self, input: &SimulationInput<'_>) -> Result<SimulationOutput, String> {
        let config = input.config;
        let rate = config.parameters[0] + 2.0 * config.parameters[1];
        let mut final_state = IndexMap::new();
        for (i, tracer) in config.tracers.iter().enumerate() {
            let start = match &input.initial_state {
                InitialState::Constant(c) => vec![c[i]; 2],
                InitialState::Fields(fields) => fields[tracer].clone(),
            };
            let state: Vec<f64> = start
                .iter()
                .map(|v| v * config.concentration_factor + f64::from(config.years) * rate)
                .collect();
            final_state.insert(tracer.clone(), state);
        }
        let trajectory = config.write_trajectory.then(|| {
            final_state
                .iter()
                .map(|(tracer, state): (&String, &Vec<f64>)| {
                    let trajectory = TracerTrajectory {
                        time_dim: 1,
                        coordinates: vec![[0.0, 0.0, 0.0], [180.0, 0.0, 0.0]],
                        values: vec![state.clone()],
                    };
                    (tracer.clone(), trajectory)
                })
                .collect()
        });
        Ok(SimulationOutput {
            final_state,
            achieved_years: config.years,
            achieved_tolerance: 1.0 / (1.0 + f64::from(config.years)),
            trajectory,
        })
    }
}

struct Fixture {
    config: DatabaseConfig,
    batch: Arc<LocalBatch<Linear>>,
}

impl Fixture {
    fn new(prefix: &str, start_from_closest: bool) -> Self {
        let root = unique_temp_dir(prefix);
        let config = DatabaseConfig {
            root: root.clone(),
            output_root_env_var: "SD_APP_TEST_ROOT_UNSET".to_string(),
            start_from_closest_parameters: start_from_closest,
            tmp_dir: Some(root.join("tmp")),
            models: vec![ModelDefinition {
                name: "N".to_string(),
                tracers: vec!["N".to_string()],
                parameter_bounds: vec![[0.0, 10.0], [0.0, 10.0]],
                parameters_typical_values: vec![1.0, 1.0],
                default_parameters: vec![1.0, 0.5],
                default_concentrations: vec![1.0],
            }],
            ..DatabaseConfig::default()
        };
        config.validate().unwrap();
        let batch = Arc::new(LocalBatch::new(Linear, config.output_root()));
        Self { config, batch }
    }

    fn options(&self) -> ModelOptions {
        let mut options = self.config.model_options("N").unwrap();
        options.spinup_options = SpinupOptions::years_only(10);
        options.derivative_options = DerivativeOptions {
            years: 5,
            step_size: 1e-3,
            accuracy_order: 1,
            parameters_typical_values: None,
        };
        options
    }

    fn model(&self) -> Model<FileJobBackend> {
        let batch: Arc<dyn BatchSystem> = self.batch.clone();
        let backend = FileJobBackend::new(batch, self.config.output_root(), Duration::from_millis(5));
        Model::new(&self.config, self.options(), backend).unwrap()
    }
}

fn assert_all_close(values: &ArrayD<f64>, expected: f64) {
    assert!(
        values.iter().all(|v| (v - expected).abs() <= 1e-6 * expected.abs().max(1.0)),
        "{values:?} != {expected}"
    );
}

#[test]
fn f_all_after_spinup() {
    let fx = Fixture::new("sd_app_f_all", false);
    let mut model = fx.model();

    let f = model.f_all(1, None).unwrap();
    // 1 + 10 * 2 after the spinup, one more year in the trajectory run.
    assert_eq!(f["N"].shape(), &[1, 2]);
    assert_all_close(&f["N"], 23.0);

    assert_eq!(model.parameters().unwrap(), vec![1.0, 0.5]);
    let chain = RunChain::discover(&model.spinup_dir().unwrap()).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(model.run().unwrap().total_years, 10);
}

#[test]
fn unknown_tracer_is_rejected() {
    let fx = Fixture::new("sd_app_tracer", false);
    let mut model = fx.model();
    let requested = vec!["DOP".to_string()];
    assert!(model.f_all(1, Some(requested.as_slice())).is_err());
    assert_eq!(fx.batch.submissions(), 0);
}

#[test]
fn resolved_run_is_reused_until_options_change() {
    let fx = Fixture::new("sd_app_memo", false);
    let mut model = fx.model();

    model.f_all(1, None).unwrap();
    assert_eq!(fx.batch.submissions(), 2);

    // Same values do not invalidate the resolved run.
    model.set_parameters(vec![1.0, 0.5]).unwrap();
    model.f_all(1, None).unwrap();
    assert_eq!(fx.batch.submissions(), 3);

    model.set_spinup_options(SpinupOptions::years_only(12)).unwrap();
    let f = model.f_all(1, None).unwrap();
    assert_all_close(&f["N"], 27.0);
    assert_eq!(model.run().unwrap().total_years, 12);
    let chain = RunChain::discover(&model.spinup_dir().unwrap()).unwrap();
    assert_eq!(chain.len(), 2);
}

#[test]
fn out_of_bounds_parameters_are_rejected() {
    let fx = Fixture::new("sd_app_bounds", false);
    let mut model = fx.model();
    assert!(matches!(
        model.set_parameters(vec![11.0, 0.5]),
        Err(AppError::InvalidInput(_))
    ));
    assert!(model.set_time_step(3).is_err());
}

#[test]
fn new_parameter_set_starts_from_closest() {
    let fx = Fixture::new("sd_app_closest", true);
    let mut model = fx.model();
    model.run().unwrap();
    let first_set = model.parameter_set_dir().unwrap();

    model.set_parameters(vec![2.0, 0.5]).unwrap();
    assert_eq!(model.closest_parameter_set_dir().unwrap(), Some(first_set));

    // Warm start from 21, then ten years at rate 3.
    let f = model.f_all(1, None).unwrap();
    assert_all_close(&f["N"], 54.0);
}

#[test]
fn closest_parameter_set_needs_a_run() {
    let fx = Fixture::new("sd_app_closest_runs", true);
    let mut model = fx.model();
    model.run().unwrap();
    let first_set = model.parameter_set_dir().unwrap();

    // Stored, but never spun up.
    model.set_parameters(vec![3.0, 0.5]).unwrap();
    model.parameter_set_dir().unwrap();

    model.set_parameters(vec![3.5, 0.5]).unwrap();
    assert_eq!(model.closest_parameter_set_dir().unwrap(), Some(first_set));
}

#[test]
fn f_points_splits_data_sets() {
    let fx = Fixture::new("sd_app_points", false);
    let mut model = fx.model();

    let mut sets = DataSets::new();
    sets.insert("a".to_string(), array![[0.0, 0.0, 0.0, 0.0], [0.5, 180.0, 0.0, 0.0]].into_dyn());
    sets.insert("b".to_string(), array![[0.25, 90.0, 0.0, 0.0]].into_dyn());
    let mut points = IndexMap::new();
    points.insert("N".to_string(), sets);

    let f = model.f_points(&points).unwrap();
    assert_eq!(f["N"]["a"].shape(), &[2]);
    assert_eq!(f["N"]["b"].shape(), &[1]);
    assert_all_close(&f["N"]["a"], 23.0);

    let df = model.df_points(&points, DerivativeSettings::default()).unwrap();
    assert_eq!(df["N"]["a"].shape(), &[2, 2]);
    assert_eq!(df["N"]["b"].shape(), &[1, 2]);
}

#[test]
fn df_all_of_linear_model() {
    let fx = Fixture::new("sd_app_df", false);
    let mut model = fx.model();

    let df = model.df_all(1, None, DerivativeSettings::default()).unwrap();
    let df = &df["N"];
    assert_eq!(df.shape(), &[1, 2, 2]);
    for cell in 0..2 {
        assert!((df[[0, cell, 0]] - 6.0).abs() < 1e-6);
        assert!((df[[0, cell, 1]] - 12.0).abs() < 1e-6);
    }
    let derivative_dir = model.derivative_dir().unwrap();
    assert!(derivative_dir.join("partial_derivative_p0_1").is_dir());
}

#[test]
fn option_sets_and_integrity() {
    let fx = Fixture::new("sd_app_database", false);
    let mut model = fx.model();
    model.run().unwrap();
    model.set_parameters(vec![2.0, 0.5]).unwrap();
    model.run().unwrap();

    let names = fx.config.model_names();
    let sets = option_sets(&fx.config, &names, &TIME_STEPS, false).unwrap();
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.time_step == 1 && s.use_constant_concentrations));
    assert_eq!(sets[1].parameters, vec![2.0, 0.5]);
    check_integrity(&fx.config, &names).unwrap();

    // A stored parameter set without any run.
    model.set_parameters(vec![3.0, 0.5]).unwrap();
    model.parameter_set_dir().unwrap();
    assert!(matches!(
        check_integrity(&fx.config, &names),
        Err(AppError::Integrity { .. })
    ));
}

#[test]
fn unreadable_spinup_dir_is_skipped_in_best_effort_mode() {
    let fx = Fixture::new("sd_app_best_effort", false);
    let mut model = fx.model();
    model.run().unwrap();

    let names = fx.config.model_names();
    let sets = option_sets(&fx.config, &names, &TIME_STEPS, true).unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].run_chain(true).unwrap().len(), 1);

    let spinup_dir = sets[0].spinup_dir();
    std::fs::remove_dir_all(&spinup_dir).unwrap();
    std::fs::write(&spinup_dir, "not a directory").unwrap();

    assert!(matches!(
        sets[0].run_chain(false),
        Err(AppError::Spinup(sd_spinup::SpinupError::FilesystemAccess { .. }))
    ));
    assert!(sets[0].run_chain(true).unwrap().is_empty());
    assert!(check_integrity(&fx.config, &names).is_err());
}
