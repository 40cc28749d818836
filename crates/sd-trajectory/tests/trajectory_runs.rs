use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use ndarray::{Array2, array};
use sd_job::{
    BatchSystem, FileJobBackend, InitialState, JobBackend, JobConfig, JobController, LocalBatch,
    OutputRoot, SimulationInput, SimulationOutput, Simulator, StartState, TracerTrajectory,
};
use sd_trajectory::{
    DEFAULT_SCRATCH_DIR, Sampling, TrajectoryAssembler, TrajectoryError, TrajectorySource,
};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
}

const CELLS: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [120.0, 0.0, 0.0], [240.0, 0.0, 0.0]];

/// State is constant per tracer; the trajectory adds the time step index.
struct Seasonal;

impl Simulator for Seasonal {
    fn simulate(&self, input: &SimulationInput<'_>) -> Result<SimulationOutput, String> {
        let config = input.config;
        let mut final_state = IndexMap::new();
        for (i, tracer) in config.tracers.iter().enumerate() {
            let state = match &input.initial_state {
                InitialState::Constant(c) => vec![c[i]; CELLS.len()],
                InitialState::Fields(fields) => fields[tracer].clone(),
            };
            final_state.insert(tracer.clone(), state);
        }
        let trajectory = config.write_trajectory.then(|| {
            final_state
                .iter()
                .map(|(tracer, state): (&String, &Vec<f64>)| {
                    let values = (0..4)
                        .map(|k| state.iter().map(|v| v + k as f64).collect())
                        .collect();
                    let trajectory = TracerTrajectory {
                        time_dim: 4,
                        coordinates: CELLS.to_vec(),
                        values,
                    };
                    (tracer.clone(), trajectory)
                })
                .collect()
        });
        Ok(SimulationOutput {
            final_state,
            achieved_years: config.years,
            achieved_tolerance: 0.0,
            trajectory,
        })
    }
}

struct Fixture {
    root: PathBuf,
    batch: Arc<LocalBatch<Seasonal>>,
    backend: FileJobBackend,
    tracers: Vec<String>,
}

impl Fixture {
    fn new(prefix: &str) -> Self {
        let root = unique_temp_dir(prefix);
        let output_root = OutputRoot::new(root.clone(), "SD_TRAJECTORY_TEST_ROOT_UNSET");
        let batch = Arc::new(LocalBatch::new(Seasonal, output_root.clone()));
        let dyn_batch: Arc<dyn BatchSystem> = batch.clone();
        let backend = FileJobBackend::new(dyn_batch, output_root, Duration::from_millis(5));
        Self {
            root,
            batch,
            backend,
            tracers: vec!["DOP".to_string(), "PO4".to_string()],
        }
    }

    fn finished_run(&self) -> PathBuf {
        let run_dir = self.root.join("spinup").join("run_00");
        let mut job = self.backend.create(&run_dir);
        job.configure(JobConfig {
            model_name: "MITgcm-PO4-DOP".to_string(),
            tracers: self.tracers.clone(),
            parameters: vec![0.02],
            years: 10,
            tolerance: 0.0,
            time_step: 1,
            start: StartState::Constant {
                concentrations: vec![1.0, 100.0],
            },
            concentration_factor: 1.0,
            write_trajectory: false,
            predecessor: None,
        })
        .unwrap();
        job.start().unwrap();
        job.wait_until_finished().unwrap();
        run_dir
    }

    fn source<'a>(&'a self, run_dir: &'a Path) -> TrajectorySource<'a> {
        TrajectorySource {
            run_dir,
            model_name: "MITgcm-PO4-DOP",
            model_tracers: &self.tracers,
            parameters: &[0.02],
            time_step: 1,
        }
    }
}

#[test]
fn dense_values_are_averaged_and_temp_dir_removed() {
    let fx = Fixture::new("sd_trajectory_dense");
    let run_dir = fx.finished_run();
    let tmp = fx.root.join("tmp");
    let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(Some(tmp.clone()));

    let values = assembler
        .values(
            &fx.backend,
            &fx.source(&run_dir),
            &["PO4".to_string()],
            &Sampling::Dense { time_dim: 2 },
        )
        .unwrap();

    assert_eq!(values.len(), 1);
    let po4 = &values["PO4"];
    assert_eq!(po4.shape(), &[2, 3]);
    assert_eq!(po4[[0, 0]], 100.5);
    assert_eq!(po4[[1, 2]], 102.5);
    assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
    assert_eq!(fx.batch.submissions(), 2);
}

#[test]
fn zero_tracers_start_no_trajectory_run() {
    let fx = Fixture::new("sd_trajectory_empty");
    let run_dir = fx.finished_run();
    let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);

    let values = assembler
        .values(&fx.backend, &fx.source(&run_dir), &[], &Sampling::Dense { time_dim: 4 })
        .unwrap();
    assert!(values.is_empty());
    assert_eq!(fx.batch.submissions(), 1);
}

#[test]
fn unknown_tracer_is_rejected_before_any_run() {
    let fx = Fixture::new("sd_trajectory_unknown");
    let run_dir = fx.finished_run();
    let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);

    let err = assembler
        .values(
            &fx.backend,
            &fx.source(&run_dir),
            &["N".to_string()],
            &Sampling::Dense { time_dim: 4 },
        )
        .unwrap_err();
    assert!(matches!(err, TrajectoryError::UnsupportedTracer { .. }));
    assert_eq!(fx.batch.submissions(), 1);
}

#[test]
fn points_are_sampled_per_tracer() {
    let fx = Fixture::new("sd_trajectory_points");
    let run_dir = fx.finished_run();
    let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);

    let mut points: IndexMap<String, Array2<f64>> = IndexMap::new();
    points.insert(
        "DOP".to_string(),
        array![[0.1, 359.0, 0.0, 0.0], [0.9, 241.0, 0.0, 0.0]],
    );
    points.insert("PO4".to_string(), Array2::zeros((0, 4)));
    let tracers: Vec<String> = points.keys().cloned().collect();

    let values = assembler
        .values(&fx.backend, &fx.source(&run_dir), &tracers, &Sampling::Points(&points))
        .unwrap();

    assert_eq!(values["DOP"].as_slice().unwrap(), &[1.0, 4.0]);
    assert_eq!(values["PO4"].len(), 0);
}

#[test]
fn unset_tmp_dir_leaves_the_source_run_untouched() {
    let fx = Fixture::new("sd_trajectory_scratch");
    let run_dir = fx.finished_run();
    let mut assembler: TrajectoryAssembler = TrajectoryAssembler::new(None);
    assert_eq!(
        assembler.scratch_dir(),
        std::env::temp_dir().join(DEFAULT_SCRATCH_DIR)
    );

    let entries = |dir: &Path| -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };
    let before = entries(&run_dir);
    let values = assembler
        .values(
            &fx.backend,
            &fx.source(&run_dir),
            &["DOP".to_string()],
            &Sampling::Dense { time_dim: 1 },
        )
        .unwrap();

    assert_eq!(values["DOP"].shape(), &[1, 3]);
    assert_eq!(entries(&run_dir), before);
    assert_eq!(fx.batch.submissions(), 2);
}
