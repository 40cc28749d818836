//! Iteration over everything stored in the database and integrity checks.

use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use sd_core::InitialConcentrationOptions;
use sd_spinup::{DatabaseLayout, RunChain, SpinupError};
use sd_store::{FileParameterStore, ParameterStore, StoreError, StoreResult};

use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};

/// One stored (model, concentration, time step, parameters) identity.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSet {
    pub model_name: String,
    pub use_constant_concentrations: bool,
    pub concentration_index: usize,
    pub concentrations: Vec<f64>,
    pub time_step: u32,
    pub parameter_set_index: usize,
    pub parameters: Vec<f64>,
    pub parameter_set_dir: PathBuf,
}

impl OptionSet {
    pub fn spinup_dir(&self) -> PathBuf {
        DatabaseLayout::spinup_dir(&self.parameter_set_dir)
    }

    /// Runs of this parameter set. In best-effort mode an unreadable spinup
    /// directory is logged and reported as an empty chain.
    pub fn run_chain(&self, best_effort: bool) -> AppResult<RunChain> {
        let spinup_dir = self.spinup_dir();
        let chain = if best_effort {
            RunChain::discover_best_effort(&spinup_dir)?
        } else {
            RunChain::discover(&spinup_dir)?
        };
        Ok(chain)
    }
}

fn concentration_store(
    config: &DatabaseConfig,
    model_name: &str,
    use_constant_concentrations: bool,
) -> AppResult<FileParameterStore> {
    let model = config.model(model_name)?;
    let options = InitialConcentrationOptions {
        use_constant_concentrations,
        concentrations: Vec::new(),
        tolerance: config.concentration_tolerance,
    };
    Ok(config
        .layout()
        .concentration_store(&model.name, &options, &model.tracers))
}

/// Filesystem errors become a logged skip in best-effort mode.
fn tolerate<T>(result: StoreResult<T>, best_effort: bool, location: &Path) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::Io(e)) if best_effort => {
            warn!(path = %location.display(), error = %e, "skipping unreadable store entry");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Visit every stored identity of `model_names` and `time_steps` in index
/// order. Stored values are read lazily, one entry at a time.
pub fn for_each_option_set<F>(
    config: &DatabaseConfig,
    model_names: &[String],
    time_steps: &[u32],
    best_effort: bool,
    mut visit: F,
) -> AppResult<()>
where
    F: FnMut(OptionSet) -> AppResult<()>,
{
    let layout = config.layout();
    for model_name in model_names {
        for use_constant in [true, false] {
            let concentration_store = concentration_store(config, model_name, use_constant)?;
            let root = concentration_store.layout().root.clone();
            let Some(concentrations) = tolerate(concentration_store.all_values(), best_effort, &root)? else {
                continue;
            };
            for (concentration_index, concentration) in concentrations.enumerate() {
                let concentration_dir = concentration_store.entry_dir(concentration_index);
                let Some(concentration) = tolerate(concentration, best_effort, &concentration_dir)? else {
                    continue;
                };
                for &time_step in time_steps {
                    let time_step_dir = DatabaseLayout::time_step_dir(&concentration_dir, time_step);
                    let parameter_store = layout.parameter_store(&time_step_dir, config.parameter_tolerance);
                    let Some(parameter_sets) =
                        tolerate(parameter_store.all_values(), best_effort, &time_step_dir)?
                    else {
                        continue;
                    };
                    for (parameter_set_index, parameters) in parameter_sets.enumerate() {
                        let parameter_set_dir = parameter_store.entry_dir(parameter_set_index);
                        let Some(parameters) = tolerate(parameters, best_effort, &parameter_set_dir)? else {
                            continue;
                        };
                        visit(OptionSet {
                            model_name: model_name.clone(),
                            use_constant_concentrations: use_constant,
                            concentration_index,
                            concentrations: concentration.clone(),
                            time_step,
                            parameter_set_index,
                            parameters,
                            parameter_set_dir,
                        })?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// All stored identities, collected.
pub fn option_sets(
    config: &DatabaseConfig,
    model_names: &[String],
    time_steps: &[u32],
    best_effort: bool,
) -> AppResult<Vec<OptionSet>> {
    let mut sets = Vec::new();
    for_each_option_set(config, model_names, time_steps, best_effort, |set| {
        sets.push(set);
        Ok(())
    })?;
    debug!(count = sets.len(), "option sets collected");
    Ok(sets)
}

/// Check every concentration and parameter store of `model_names` and
/// require at least one run for every stored parameter set.
pub fn check_integrity(config: &DatabaseConfig, model_names: &[String]) -> AppResult<()> {
    let layout = config.layout();
    for model_name in model_names {
        for use_constant in [true, false] {
            let concentration_store = concentration_store(config, model_name, use_constant)?;
            concentration_store.check_integrity()?;
            for concentration_index in 0..concentration_store.len()? {
                let concentration_dir = concentration_store.entry_dir(concentration_index);
                for time_step in sd_core::TIME_STEPS {
                    let time_step_dir = DatabaseLayout::time_step_dir(&concentration_dir, time_step);
                    layout
                        .parameter_store(&time_step_dir, config.parameter_tolerance)
                        .check_integrity()?;
                }
            }
        }
    }

    for_each_option_set(config, model_names, &sd_core::TIME_STEPS, false, |set| {
        let spinup_dir = set.spinup_dir();
        let chain = set.run_chain(false).map_err(|e| match e {
            AppError::Spinup(SpinupError::Integrity { path, reason }) => {
                AppError::Integrity { path, reason }
            }
            other => other,
        })?;
        if chain.is_empty() {
            let reason = format!("parameter set {:?} has no spinup run", set.parameters);
            error!(spinup_dir = %spinup_dir.display(), %reason, "database integrity violated");
            return Err(AppError::Integrity {
                path: spinup_dir,
                reason,
            });
        }
        Ok(())
    })?;
    debug!(?model_names, "database integrity checked");
    Ok(())
}
