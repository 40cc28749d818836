//! Shared application layer of the simulation database.
//!
//! Loads the database configuration, exposes model values and derivatives
//! through [`Model`], iterates and checks the stored database, and
//! propagates parameter uncertainty to model output.

pub mod confidence;
pub mod config;
pub mod database;
pub mod error;
pub mod memo;
pub mod model;

pub use confidence::{average_model_confidence, model_confidence, nan_mean, parameter_confidence};
pub use config::{DatabaseConfig, ModelDefinition, load_config};
pub use database::{OptionSet, check_integrity, for_each_option_set, option_sets};
pub use error::{AppError, AppResult};
pub use model::Model;

pub use sd_deriv::DerivativeSettings;
pub use sd_job::FileJobBackend;
pub use sd_trajectory::DataSets;
