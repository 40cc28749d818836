//! Cache keys of perturbed runs.
//!
//! A factor id lists the perturbed parameters with their offset from the
//! base point in multiples of the step, e.g. `p0_1__p3_-0.5`. Multiples are
//! rounded to `precision` decimal places before formatting, so points that
//! differ only by rounding noise share one id.

use crate::{DerivativeError, DerivativeResult};

/// Id of the unperturbed point.
pub const BASE_FACTOR_ID: &str = "base";

/// Largest supported number of decimal places of a multiple.
pub const MAX_FACTOR_ID_PRECISION: u32 = 12;

const SEPARATOR: &str = "__";

// Quantized multiples must stay exactly representable as f64.
const MAX_QUANTIZED: f64 = (1_u64 << 53) as f64;

pub fn factor_id(
    point: &[f64],
    base: &[f64],
    steps: &[f64],
    precision: u32,
) -> DerivativeResult<String> {
    if precision > MAX_FACTOR_ID_PRECISION {
        return Err(DerivativeError::invalid(format!(
            "factor id precision {precision} exceeds {MAX_FACTOR_ID_PRECISION}"
        )));
    }
    let scale = 10_i64.pow(precision);
    let mut parts = Vec::new();
    for (index, ((p, b), h)) in point.iter().zip(base).zip(steps).enumerate() {
        let scaled = ((p - b) / h * scale as f64).round();
        if !scaled.is_finite() || scaled.abs() >= MAX_QUANTIZED {
            return Err(DerivativeError::invalid(format!(
                "offset of parameter {index} is not representable at precision {precision}"
            )));
        }
        let quantized = scaled as i64;
        if quantized != 0 {
            parts.push(format!("p{index}_{}", format_multiple(quantized, scale)));
        }
    }

    if parts.is_empty() {
        Ok(BASE_FACTOR_ID.to_string())
    } else {
        Ok(parts.join(SEPARATOR))
    }
}

fn format_multiple(quantized: i64, scale: i64) -> String {
    let sign = if quantized < 0 { "-" } else { "" };
    let magnitude = quantized.unsigned_abs();
    let scale = scale.unsigned_abs();
    let (whole, fraction) = (magnitude / scale, magnitude % scale);
    if fraction == 0 {
        return format!("{sign}{whole}");
    }
    let width = scale.ilog10() as usize;
    let digits = format!("{fraction:0width$}");
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}
