//! Directory identity of runs inside the database:
//!
//! ```text
//! model_<name>/concentration_{constant,vector}/concentration_<i>/time_step_<ts>/
//!     parameter_set_<i>/spinup/run_<n>
//!     parameter_set_<i>/derivative_<...>/partial_derivative_<factor ids>
//! ```

use std::path::{Path, PathBuf};

use sd_core::{DerivativeOptions, InitialConcentrationOptions, Tolerances};
use sd_store::{FileParameterStore, StoreLayout};

const MODEL_PREFIX: &str = "model_";
const CONSTANT_CONCENTRATIONS_DIRNAME: &str = "concentration_constant";
const VECTOR_CONCENTRATIONS_DIRNAME: &str = "concentration_vector";
const CONCENTRATION_PREFIX: &str = "concentration_";
const CONCENTRATION_LOOKUP: &str = "concentrations_lookup.json";
const CONSTANT_CONCENTRATIONS_FILE: &str = "constant_concentrations.json";
const PARAMETER_SET_PREFIX: &str = "parameter_set_";
const PARAMETER_LOOKUP: &str = "parameter_set_lookup.json";
const PARAMETERS_FILE: &str = "parameters.json";
const SPINUP_DIRNAME: &str = "spinup";
const RUN_PREFIX: &str = "run_";
const PARTIAL_DERIVATIVE_PREFIX: &str = "partial_derivative_";

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseLayout {
    root: PathBuf,
    reliable_decimal_places: u32,
}

impl DatabaseLayout {
    pub fn new(root: impl Into<PathBuf>, reliable_decimal_places: u32) -> Self {
        Self {
            root: root.into(),
            reliable_decimal_places,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.root.join(format!("{MODEL_PREFIX}{model_name}"))
    }

    pub fn concentration_base_dir(&self, model_name: &str, use_constant: bool) -> PathBuf {
        let dirname = if use_constant {
            CONSTANT_CONCENTRATIONS_DIRNAME
        } else {
            VECTOR_CONCENTRATIONS_DIRNAME
        };
        self.model_dir(model_name).join(dirname)
    }

    /// Store of initial concentrations. Constant concentrations live in one
    /// value file, concentration fields in one `<tracer>_input.json` each.
    pub fn concentration_store(
        &self,
        model_name: &str,
        options: &InitialConcentrationOptions,
        tracers: &[String],
    ) -> FileParameterStore {
        let use_constant = options.use_constant_concentrations;
        let value_file_names = if use_constant {
            vec![CONSTANT_CONCENTRATIONS_FILE.to_string()]
        } else {
            tracers.iter().map(|t| format!("{t}_input.json")).collect()
        };
        let layout = StoreLayout {
            root: self.concentration_base_dir(model_name, use_constant),
            lookup_file_name: CONCENTRATION_LOOKUP.to_string(),
            entry_prefix: CONCENTRATION_PREFIX.to_string(),
            entry_width: 3,
            value_file_names,
        };
        FileParameterStore::new(layout, options.tolerance, self.reliable_decimal_places)
    }

    pub fn time_step_dir(concentration_dir: &Path, time_step: u32) -> PathBuf {
        concentration_dir.join(format!("time_step_{time_step:04}"))
    }

    pub fn parameter_store(&self, time_step_dir: &Path, tolerance: Tolerances) -> FileParameterStore {
        let layout = StoreLayout {
            root: time_step_dir.to_path_buf(),
            lookup_file_name: PARAMETER_LOOKUP.to_string(),
            entry_prefix: PARAMETER_SET_PREFIX.to_string(),
            entry_width: 5,
            value_file_names: vec![PARAMETERS_FILE.to_string()],
        };
        FileParameterStore::new(layout, tolerance, self.reliable_decimal_places)
    }

    pub fn spinup_dir(parameter_set_dir: &Path) -> PathBuf {
        parameter_set_dir.join(SPINUP_DIRNAME)
    }

    /// Derivative runs depend on the spinup they continue, so the directory
    /// encodes its total years next to the derivative settings.
    pub fn derivative_dir(
        parameter_set_dir: &Path,
        spinup_years: u32,
        options: &DerivativeOptions,
    ) -> PathBuf {
        parameter_set_dir.join(format!(
            "derivative_spinup_{:05}_step_{:e}_years_{:04}",
            spinup_years, options.step_size, options.years
        ))
    }

    pub fn partial_derivative_dir(derivative_dir: &Path, factor_ids: &str) -> PathBuf {
        derivative_dir.join(format!("{PARTIAL_DERIVATIVE_PREFIX}{factor_ids}"))
    }

    pub fn run_dirname(index: usize) -> String {
        format!("{RUN_PREFIX}{index:02}")
    }

    pub fn parse_run_dirname(name: &str) -> Option<usize> {
        let digits = name.strip_prefix(RUN_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dirnames_round_trip() {
        assert_eq!(DatabaseLayout::run_dirname(3), "run_03");
        assert_eq!(DatabaseLayout::run_dirname(120), "run_120");
        assert_eq!(DatabaseLayout::parse_run_dirname("run_03"), Some(3));
        assert_eq!(DatabaseLayout::parse_run_dirname("run_"), None);
        assert_eq!(DatabaseLayout::parse_run_dirname("run_3a"), None);
        assert_eq!(DatabaseLayout::parse_run_dirname("trajectory"), None);
    }

    #[test]
    fn derivative_dir_encodes_spinup_and_step() {
        let options = DerivativeOptions::default();
        let dir = DatabaseLayout::derivative_dir(Path::new("/db/p"), 10_000, &options);
        assert_eq!(
            dir,
            PathBuf::from("/db/p/derivative_spinup_10000_step_1e-7_years_0100")
        );
    }

    #[test]
    fn vector_concentrations_use_one_file_per_tracer() {
        let layout = DatabaseLayout::new("/db", 12);
        let mut options = InitialConcentrationOptions::constant(vec![2.17, 0.0001]);
        options.use_constant_concentrations = false;
        let store = layout.concentration_store("NP", &options, &["N".to_string(), "P".to_string()]);
        assert_eq!(
            store.layout().value_file_names,
            vec!["N_input.json".to_string(), "P_input.json".to_string()]
        );
        assert_eq!(
            store.layout().root,
            PathBuf::from("/db/model_NP/concentration_vector")
        );
    }
}
