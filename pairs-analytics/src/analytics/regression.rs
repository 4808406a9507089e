//! Log returns and the gated OLS hedge ratio regression.

use crate::{config::GateConfig, error::AnalyticsError};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Ordinary least squares fit of `y = intercept + hedge_ratio * x`.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegressionResult {
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub std_error_beta: f64,
    pub n_observations: usize,
    /// Outcome of the sanity gate, see [`passes_gate`].
    pub is_valid: bool,
}

/// Paired log returns of two aligned close series.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PairedReturns {
    /// Timestamp of the bar closing each return interval.
    pub timestamps: Vec<DateTime<Utc>>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl PairedReturns {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Log returns `ln(c_t) - ln(c_{t-1})` of a close series.
pub fn log_returns(closes: &[f64]) -> Result<Vec<f64>, AnalyticsError> {
    if closes.len() < 2 {
        return Err(AnalyticsError::insufficient("returns", 2, closes.len()));
    }

    Ok(closes
        .iter()
        .tuple_windows()
        .map(|(prev, curr)| curr.ln() - prev.ln())
        .collect())
}

/// Log returns of two aligned close series, dropping any interval where either return is
/// non-finite.
pub fn paired_log_returns(
    timestamps: &[DateTime<Utc>],
    closes_x: &[f64],
    closes_y: &[f64],
) -> Result<PairedReturns, AnalyticsError> {
    let returns_x = log_returns(closes_x)?;
    let returns_y = log_returns(closes_y)?;

    let (timestamps, (x, y)): (Vec<_>, (Vec<_>, Vec<_>)) = timestamps
        .iter()
        .skip(1)
        .zip(returns_x.into_iter().zip(returns_y))
        .filter(|(_, (x, y))| x.is_finite() && y.is_finite())
        .map(|(timestamp, pair)| (*timestamp, pair))
        .unzip();

    Ok(PairedReturns { timestamps, x, y })
}

/// Sanity gate applied to a fitted regression.
///
/// Invalid when `|beta| >= max_abs_beta`, `r_squared <= min_r_squared`, or
/// `std_error_beta >= max_relative_std_error * |beta|`. Any non-finite input is invalid.
pub fn passes_gate(hedge_ratio: f64, r_squared: f64, std_error_beta: f64, gate: &GateConfig) -> bool {
    if !(hedge_ratio.is_finite() && r_squared.is_finite() && std_error_beta.is_finite()) {
        return false;
    }

    hedge_ratio.abs() < gate.max_abs_beta
        && r_squared > gate.min_r_squared
        && std_error_beta < gate.max_relative_std_error * hedge_ratio.abs()
}

/// Regress `y` on `x` and apply the sanity gate.
///
/// Requires at least `max(3, min_points)` observations. Zero variance in `x` is a
/// [`AnalyticsError::DegenerateInput`].
pub fn regress(
    x: &[f64],
    y: &[f64],
    gate: &GateConfig,
    min_points: usize,
) -> Result<RegressionResult, AnalyticsError> {
    let n = x.len().min(y.len());
    let required = min_points.max(3);
    if n < required {
        return Err(AnalyticsError::insufficient("regression", required, n));
    }
    let (x, y) = (&x[..n], &y[..n]);

    let mean_x = mean(x);
    let mean_y = mean(y);

    let (mut sxx, mut sxy, mut syy, mut sum_sq_x) = (0.0, 0.0, 0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
        sum_sq_x += xi * xi;
    }

    if sxx <= f64::EPSILON * sum_sq_x {
        return Err(AnalyticsError::DegenerateInput(
            "regressor has zero variance".to_string(),
        ));
    }

    let hedge_ratio = sxy / sxx;
    let intercept = mean_y - hedge_ratio * mean_x;

    let rss = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (yi - intercept - hedge_ratio * xi).powi(2))
        .sum::<f64>();

    let r_squared = if syy > 0.0 {
        (1.0 - rss / syy).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let sigma_sq = rss / (n - 2) as f64;
    let std_error_beta = (sigma_sq / sxx).sqrt();

    Ok(RegressionResult {
        hedge_ratio,
        intercept,
        r_squared,
        std_error_beta,
        n_observations: n,
        is_valid: passes_gate(hedge_ratio, r_squared, std_error_beta, gate),
    })
}

/// In-sample spread `s_t = y_t - hedge_ratio * x_t`.
pub fn spread(x: &[f64], y: &[f64], hedge_ratio: f64) -> Vec<f64> {
    x.iter()
        .zip(y)
        .map(|(xi, yi)| yi - hedge_ratio * xi)
        .collect()
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
