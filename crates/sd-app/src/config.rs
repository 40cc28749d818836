//! Database configuration, loaded from YAML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sd_core::{
    DerivativeOptions, InitialConcentrationOptions, ModelOptions, SpinupOptions, Tolerances,
    ensure_all_finite,
};
use sd_job::{CommandBatch, FileJobBackend, OutputRoot};
use sd_spinup::DatabaseLayout;

use crate::error::{AppError, AppResult};

/// A tracer model known to the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub tracers: Vec<String>,
    pub parameter_bounds: Vec<[f64; 2]>,
    pub parameters_typical_values: Vec<f64>,
    pub default_parameters: Vec<f64>,
    /// One constant concentration per tracer.
    pub default_concentrations: Vec<f64>,
}

impl ModelDefinition {
    pub fn parameters_len(&self) -> usize {
        self.parameter_bounds.len()
    }

    fn validate(&self) -> AppResult<()> {
        let invalid = |reason: String| AppError::Config(format!("model '{}': {reason}", self.name));
        if self.tracers.is_empty() {
            return Err(invalid("no tracers".to_string()));
        }
        let n = self.parameters_len();
        if n == 0 {
            return Err(invalid("no parameters".to_string()));
        }
        if self.parameters_typical_values.len() != n || self.default_parameters.len() != n {
            return Err(invalid(format!(
                "{n} parameter bounds, {} typical values and {} default parameters",
                self.parameters_typical_values.len(),
                self.default_parameters.len()
            )));
        }
        if self.default_concentrations.len() != self.tracers.len() {
            return Err(invalid(format!(
                "{} default concentrations for {} tracers",
                self.default_concentrations.len(),
                self.tracers.len()
            )));
        }
        ensure_all_finite(&self.parameters_typical_values, "parameters typical values")?;
        ensure_all_finite(&self.default_concentrations, "default concentrations")?;
        self.check_bounds(&self.default_parameters)
            .map_err(|e| invalid(format!("default parameters: {e}")))
    }

    /// Check that `parameters` fit the number and bounds of the model's
    /// parameters.
    pub fn check_bounds(&self, parameters: &[f64]) -> AppResult<()> {
        if parameters.len() != self.parameters_len() {
            return Err(AppError::InvalidInput(format!(
                "model '{}' has {} parameters, got {}",
                self.name,
                self.parameters_len(),
                parameters.len()
            )));
        }
        for (i, (p, [lower, upper])) in parameters.iter().zip(&self.parameter_bounds).enumerate() {
            if !(lower <= p && p <= upper) {
                return Err(AppError::InvalidInput(format!(
                    "parameter {i} = {p} lies outside [{lower}, {upper}]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub root: PathBuf,
    /// Variable standing for `root` in persisted job configurations.
    pub output_root_env_var: String,
    pub max_spinup_years: u32,
    pub start_from_closest_parameters: bool,
    pub parameter_tolerance: Tolerances,
    pub concentration_tolerance: Tolerances,
    pub reliable_decimal_places: u32,
    pub factor_id_precision: u32,
    pub poll_interval_ms: u64,
    /// Parent of temporary trajectory runs; the system temp dir if unset.
    pub tmp_dir: Option<PathBuf>,
    /// External submission command, e.g. `sbatch {job_file}`.
    pub batch_command: Option<String>,
    pub models: Vec<ModelDefinition>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("database"),
            output_root_env_var: "SIMULATION_OUTPUT_DIR".to_string(),
            max_spinup_years: 50_000,
            start_from_closest_parameters: false,
            parameter_tolerance: Tolerances {
                abs: 1e-18,
                rel: 1e-15,
            },
            concentration_tolerance: Tolerances {
                abs: 1e-18,
                rel: 1e-15,
            },
            reliable_decimal_places: 15,
            factor_id_precision: 4,
            poll_interval_ms: 30_000,
            tmp_dir: None,
            batch_command: None,
            models: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_spinup_years == 0 {
            return Err(AppError::Config("max_spinup_years must be > 0".to_string()));
        }
        if self.factor_id_precision > sd_deriv::MAX_FACTOR_ID_PRECISION {
            return Err(AppError::Config(format!(
                "factor_id_precision must be at most {}, got {}",
                sd_deriv::MAX_FACTOR_ID_PRECISION,
                self.factor_id_precision
            )));
        }
        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(AppError::Config(format!("model '{}' defined twice", model.name)));
            }
            model.validate()?;
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> AppResult<&ModelDefinition> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| AppError::ModelNotFound(name.to_string()))
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// Default options of a model: its default parameters and constant
    /// concentrations, default spinup and derivative options.
    pub fn model_options(&self, name: &str) -> AppResult<ModelOptions> {
        let model = self.model(name)?;
        Ok(ModelOptions {
            model_name: model.name.clone(),
            time_step: 1,
            parameters: model.default_parameters.clone(),
            parameter_tolerance: self.parameter_tolerance,
            initial_concentration_options: InitialConcentrationOptions {
                use_constant_concentrations: true,
                concentrations: model.default_concentrations.clone(),
                tolerance: self.concentration_tolerance,
            },
            spinup_options: SpinupOptions::default(),
            derivative_options: DerivativeOptions::default(),
        })
    }

    pub fn layout(&self) -> DatabaseLayout {
        DatabaseLayout::new(self.root.clone(), self.reliable_decimal_places)
    }

    pub fn output_root(&self) -> OutputRoot {
        OutputRoot::new(self.root.clone(), self.output_root_env_var.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Job backend submitting through the configured batch command.
    pub fn command_backend(&self) -> AppResult<FileJobBackend> {
        let command = self
            .batch_command
            .as_deref()
            .ok_or_else(|| AppError::Config("no batch_command configured".to_string()))?;
        let batch = CommandBatch::from_command_line(command)?;
        Ok(FileJobBackend::new(
            Arc::new(batch),
            self.output_root(),
            self.poll_interval(),
        ))
    }
}

/// Load and validate a database configuration from a YAML file.
pub fn load_config(path: &Path) -> AppResult<DatabaseConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AppError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: DatabaseConfig = serde_yaml::from_str(&content)
        .map_err(|e| AppError::Config(format!("Failed to parse config YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "\
root: /data/db
max_spinup_years: 20000
models:
  - name: N
    tracers: [N]
    parameter_bounds: [[0.01, 0.05], [1.0, 3.0]]
    parameters_typical_values: [0.02, 2.0]
    default_parameters: [0.02, 2.0]
    default_concentrations: [2.17]
";

    #[test]
    fn missing_fields_use_defaults() {
        let config: DatabaseConfig = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.root, PathBuf::from("/data/db"));
        assert_eq!(config.max_spinup_years, 20_000);
        assert_eq!(config.factor_id_precision, 4);
        assert_eq!(config.output_root_env_var, "SIMULATION_OUTPUT_DIR");
        assert!(config.batch_command.is_none());

        let options = config.model_options("N").unwrap();
        assert_eq!(options.parameters, vec![0.02, 2.0]);
        assert_eq!(options.initial_concentration_options.concentrations, vec![2.17]);
        options.validate().unwrap();
    }

    #[test]
    fn unknown_model_is_reported() {
        let config: DatabaseConfig = serde_yaml::from_str(YAML).unwrap();
        assert!(matches!(config.model_options("MITgcm"), Err(AppError::ModelNotFound(_))));
    }

    #[test]
    fn default_parameters_must_lie_in_bounds() {
        let mut config: DatabaseConfig = serde_yaml::from_str(YAML).unwrap();
        config.models[0].default_parameters = vec![0.5, 2.0];
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn factor_id_precision_is_bounded() {
        let mut config: DatabaseConfig = serde_yaml::from_str(YAML).unwrap();
        config.factor_id_precision = 12;
        config.validate().unwrap();
        config.factor_id_precision = 19;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn command_backend_requires_a_command() {
        let config = DatabaseConfig::default();
        assert!(matches!(config.command_backend(), Err(AppError::Config(_))));
    }
}
