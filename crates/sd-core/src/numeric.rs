use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Floating point type used throughout the database
pub type Real = f64;

/// Absolute and relative tolerance used to decide whether two stored
/// values describe the same physical input.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    #[serde(alias = "absolute")]
    pub abs: Real,
    #[serde(alias = "relative")]
    pub rel: Real,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            abs: 1e-12,
            rel: 1e-9,
        }
    }
}

pub fn nearly_equal(a: Real, b: Real, tol: Tolerances) -> bool {
    let diff = (a - b).abs();
    if diff <= tol.abs {
        return true;
    }
    diff <= tol.rel * a.abs().max(b.abs())
}

/// Component-wise [`nearly_equal`]; vectors of different length never match.
pub fn vectors_nearly_equal(a: &[Real], b: &[Real], tol: Tolerances) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| nearly_equal(x, y, tol))
}

pub fn euclidean_distance(a: &[Real], b: &[Real]) -> Real {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<Real>()
        .sqrt()
}

/// Round to a fixed number of decimal places using decimal formatting, so the
/// stored value is exactly what a reader of the text representation sees.
pub fn round_to_decimals(v: Real, places: u32) -> Real {
    if !v.is_finite() {
        return v;
    }
    format!("{:.*}", places as usize, v).parse().unwrap_or(v)
}

pub fn ensure_finite(v: Real, what: &'static str) -> Result<Real, CoreError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CoreError::NonFinite { what, value: v })
    }
}

pub fn ensure_all_finite(values: &[Real], what: &'static str) -> Result<(), CoreError> {
    for &v in values {
        ensure_finite(v, what)?;
    }
    Ok(())
}
