//! Linearized uncertainty of model parameters and model output.
//!
//! The parameter covariance matrix and the confidence factor `gamma` are
//! inputs; only their propagation through the model derivative lives here.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView3, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{AppError, AppResult};

fn check_covariance(covariance: &DMatrix<f64>, parameters_len: usize) -> AppResult<()> {
    if covariance.nrows() != parameters_len || covariance.ncols() != parameters_len {
        return Err(AppError::InvalidInput(format!(
            "covariance matrix is {}x{}, expected {parameters_len}x{parameters_len}",
            covariance.nrows(),
            covariance.ncols()
        )));
    }
    Ok(())
}

fn check_gamma(gamma: f64) -> AppResult<()> {
    if !gamma.is_finite() || gamma <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "confidence factor must be finite and > 0, got {gamma}"
        )));
    }
    Ok(())
}

/// Confidence interval half widths `gamma * sqrt(C_ii)` of the parameters,
/// relative to `parameters` when given.
pub fn parameter_confidence(
    covariance: &DMatrix<f64>,
    gamma: f64,
    parameters: Option<&[f64]>,
) -> AppResult<DVector<f64>> {
    check_gamma(gamma)?;
    let n = covariance.nrows();
    check_covariance(covariance, n)?;
    let mut confidence = covariance.diagonal().map(|v| v.sqrt() * gamma);
    if let Some(parameters) = parameters {
        if parameters.len() != n {
            return Err(AppError::InvalidInput(format!(
                "{} parameters for a {n}x{n} covariance matrix",
                parameters.len()
            )));
        }
        for (c, p) in confidence.iter_mut().zip(parameters) {
            *c /= p;
        }
    }
    Ok(confidence)
}

/// Confidence of the model output per cell.
///
/// `df` holds the derivative of the dense model output, `[time, cells,
/// parameters]`. The time axis is averaged in blocks down to
/// `time_dim_confidence`, which must divide it. Cells whose derivative is
/// NaN (land) yield NaN. The result is `[time_dim_confidence, cells]`.
pub fn model_confidence(
    df: ArrayView3<'_, f64>,
    covariance: &DMatrix<f64>,
    gamma: f64,
    time_dim_confidence: usize,
) -> AppResult<Array2<f64>> {
    check_gamma(gamma)?;
    let (time_dim, cells, parameters_len) = df.dim();
    check_covariance(covariance, parameters_len)?;
    if time_dim_confidence == 0 || time_dim % time_dim_confidence != 0 {
        return Err(AppError::InvalidInput(format!(
            "confidence time dimension {time_dim_confidence} does not divide the model time dimension {time_dim}"
        )));
    }
    let block = time_dim / time_dim_confidence;
    debug!(time_dim, cells, time_dim_confidence, "calculating model confidence");

    let columns: Vec<Vec<f64>> = (0..cells)
        .into_par_iter()
        .map(|cell| {
            let cell_df = df.index_axis(Axis(1), cell);
            let is_sea = cell_df.iter().all(|v| !v.is_nan());
            (0..time_dim_confidence)
                .map(|b| {
                    if !is_sea {
                        return f64::NAN;
                    }
                    let sum: f64 = (b * block..(b + 1) * block)
                        .map(|t| {
                            let df_i = DVector::from_iterator(parameters_len, cell_df.row(t).iter().copied());
                            df_i.dot(&(covariance * &df_i)).sqrt()
                        })
                        .sum();
                    sum / block as f64 * gamma
                })
                .collect()
        })
        .collect();

    let mut confidence = Array2::zeros((time_dim_confidence, cells));
    for (cell, column) in columns.into_iter().enumerate() {
        for (b, value) in column.into_iter().enumerate() {
            confidence[[b, cell]] = value;
        }
    }
    Ok(confidence)
}

/// Mean of the non-NaN entries, NaN if there are none.
pub fn nan_mean<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Average model confidence over all sea cells and confidence time steps,
/// relative to the average model output `f_all` when given.
pub fn average_model_confidence(
    confidence: &Array2<f64>,
    f_all: Option<&Array2<f64>>,
) -> f64 {
    let average = nan_mean(confidence.iter());
    match f_all {
        Some(f) => average / nan_mean(f.iter()),
        None => average,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn parameter_confidence_scales_standard_deviations() {
        let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0]));
        let absolute = parameter_confidence(&covariance, 2.0, None).unwrap();
        assert_eq!(absolute.as_slice(), &[4.0, 6.0]);

        let relative = parameter_confidence(&covariance, 2.0, Some(&[2.0, 3.0])).unwrap();
        assert_eq!(relative.as_slice(), &[2.0, 2.0]);
    }

    #[test]
    fn model_confidence_averages_time_blocks() {
        // Two parameters, identity covariance: confidence = gamma * |df|.
        let mut df = Array3::<f64>::zeros((4, 2, 2));
        for t in 0..4 {
            df[[t, 0, 0]] = 3.0;
            df[[t, 0, 1]] = 4.0;
            df[[t, 1, 0]] = t as f64;
        }
        let covariance = DMatrix::identity(2, 2);
        let confidence = model_confidence(df.view(), &covariance, 2.0, 2).unwrap();

        assert_eq!(confidence.dim(), (2, 2));
        assert_eq!(confidence[[0, 0]], 10.0);
        assert_eq!(confidence[[1, 0]], 10.0);
        assert_eq!(confidence[[0, 1]], 1.0);
        assert_eq!(confidence[[1, 1]], 5.0);
    }

    #[test]
    fn land_cells_are_nan() {
        let mut df = Array3::<f64>::ones((2, 3, 1));
        df[[0, 1, 0]] = f64::NAN;
        let covariance = DMatrix::identity(1, 1);
        let confidence = model_confidence(df.view(), &covariance, 1.0, 1).unwrap();

        assert!(confidence[[0, 1]].is_nan());
        assert_eq!(confidence[[0, 0]], 1.0);
        assert_eq!(average_model_confidence(&confidence, None), 1.0);
    }

    #[test]
    fn time_blocks_must_divide() {
        let df = Array3::<f64>::ones((12, 1, 1));
        let covariance = DMatrix::identity(1, 1);
        assert!(model_confidence(df.view(), &covariance, 1.0, 5).is_err());
        assert!(model_confidence(df.view(), &covariance, 1.0, 0).is_err());
        assert!(model_confidence(df.view(), &DMatrix::identity(2, 2), 1.0, 4).is_err());
    }

    #[test]
    fn nan_mean_ignores_nan() {
        assert_eq!(nan_mean(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(nan_mean(&[f64::NAN]).is_nan());
    }
}
