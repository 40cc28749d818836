//! Option structures describing one request against the run database.
//!
//! Optional settings are plain fields with serde defaults, so a partially
//! specified YAML/JSON document is completed once at load time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::numeric::{Real, Tolerances, ensure_all_finite};
use crate::{CoreError, CoreResult};

/// Time steps (in hours) the tracer solver supports.
pub const TIME_STEPS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

/// How `years` and `tolerance` of [`SpinupOptions`] are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combination {
    And,
    Or,
}

impl FromStr for Combination {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(CoreError::invalid(
                "combination",
                format!("unknown combination '{other}' (expected 'and' or 'or')"),
            )),
        }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
        }
    }
}

/// Which run of a chain satisfies a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// The last run of the chain.
    #[default]
    Exact,
    /// The earliest run of the chain that still satisfies the request.
    EqualOrNearestBetter,
}

impl FromStr for MatchType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "equal_or_nearest_better" => Ok(Self::EqualOrNearestBetter),
            other => Err(CoreError::invalid(
                "match_type",
                format!("unknown match type '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpinupOptions {
    pub years: u32,
    pub tolerance: Real,
    pub combination: Combination,
    #[serde(default)]
    pub match_type: MatchType,
}

impl SpinupOptions {
    pub fn new(years: u32, tolerance: Real, combination: Combination) -> Self {
        Self {
            years,
            tolerance,
            combination,
            match_type: MatchType::Exact,
        }
    }

    /// Options satisfied by integrating for `years` alone.
    pub fn years_only(years: u32) -> Self {
        Self::new(years, 0.0, Combination::Or)
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(CoreError::invalid(
                "spinup tolerance",
                format!("must be finite and >= 0, got {}", self.tolerance),
            ));
        }
        Ok(())
    }
}

impl Default for SpinupOptions {
    fn default() -> Self {
        Self::new(10_000, 0.0, Combination::Or)
    }
}

impl fmt::Display for SpinupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "years={} tolerance={:e} combination={} match_type={:?}",
            self.years, self.tolerance, self.combination, self.match_type
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeOptions {
    #[serde(default = "default_derivative_years")]
    pub years: u32,
    #[serde(default = "default_step_size")]
    pub step_size: Real,
    #[serde(default = "default_accuracy_order")]
    pub accuracy_order: u8,
    /// Typical magnitude of each parameter; steps are `step_size * typical`.
    /// Falls back to the model definition when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_typical_values: Option<Vec<Real>>,
}

fn default_derivative_years() -> u32 {
    100
}

fn default_step_size() -> Real {
    1e-7
}

fn default_accuracy_order() -> u8 {
    2
}

impl Default for DerivativeOptions {
    fn default() -> Self {
        Self {
            years: default_derivative_years(),
            step_size: default_step_size(),
            accuracy_order: default_accuracy_order(),
            parameters_typical_values: None,
        }
    }
}

impl DerivativeOptions {
    pub fn validate(&self, parameters_len: usize) -> CoreResult<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(CoreError::invalid(
                "derivative step size",
                format!("must be finite and > 0, got {}", self.step_size),
            ));
        }
        validate_accuracy_order(self.accuracy_order)?;
        if let Some(typical) = &self.parameters_typical_values {
            if typical.len() != parameters_len {
                return Err(CoreError::LengthMismatch {
                    what: "parameters typical values",
                    expected: parameters_len,
                    actual: typical.len(),
                });
            }
            ensure_all_finite(typical, "parameters typical values")?;
        }
        Ok(())
    }
}

pub fn validate_accuracy_order(accuracy_order: u8) -> CoreResult<()> {
    if matches!(accuracy_order, 1 | 2) {
        Ok(())
    } else {
        Err(CoreError::invalid(
            "accuracy order",
            format!("must be 1 or 2, got {accuracy_order}"),
        ))
    }
}

/// Where the first run of a chain takes its tracer state from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialConcentrationOptions {
    /// `true`: one constant value per tracer; `false`: full tracer fields,
    /// concatenated in tracer order.
    #[serde(default = "default_use_constant")]
    pub use_constant_concentrations: bool,
    pub concentrations: Vec<Real>,
    #[serde(default)]
    pub tolerance: Tolerances,
}

fn default_use_constant() -> bool {
    true
}

impl InitialConcentrationOptions {
    pub fn constant(concentrations: Vec<Real>) -> Self {
        Self {
            use_constant_concentrations: true,
            concentrations,
            tolerance: Tolerances::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub model_name: String,
    #[serde(default = "default_time_step")]
    pub time_step: u32,
    pub parameters: Vec<Real>,
    #[serde(default)]
    pub parameter_tolerance: Tolerances,
    pub initial_concentration_options: InitialConcentrationOptions,
    #[serde(default)]
    pub spinup_options: SpinupOptions,
    #[serde(default)]
    pub derivative_options: DerivativeOptions,
}

fn default_time_step() -> u32 {
    1
}

impl ModelOptions {
    pub fn validate(&self) -> CoreResult<()> {
        if self.model_name.trim().is_empty() {
            return Err(CoreError::invalid("model name", "must not be empty"));
        }
        if !TIME_STEPS.contains(&self.time_step) {
            return Err(CoreError::invalid(
                "time step",
                format!("{} is not one of {:?}", self.time_step, TIME_STEPS),
            ));
        }
        if self.parameters.is_empty() {
            return Err(CoreError::invalid("parameters", "must not be empty"));
        }
        ensure_all_finite(&self.parameters, "parameters")?;
        ensure_all_finite(
            &self.initial_concentration_options.concentrations,
            "initial concentrations",
        )?;
        self.spinup_options.validate()?;
        self.derivative_options.validate(self.parameters.len())?;
        Ok(())
    }
}
