//! Augmented Dickey-Fuller stationarity test.
//!
//! Test regression with constant and `p` lagged differences:
//! `dy_t = alpha + gamma * y_{t-1} + sum_i(phi_i * dy_{t-i}) + e_t`, with test statistic
//! `gamma / se(gamma)`. P-values and critical values use MacKinnon's response surface
//! approximations for the constant-only case.

use crate::error::AnalyticsError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// MacKinnon (1994) p-value surface for the constant-only, single series case.
const TAU_MAX: f64 = 2.74;
const TAU_MIN: f64 = -18.83;
const TAU_STAR: f64 = -1.61;
const TAU_SMALL_P: [f64; 3] = [2.1659, 1.4412, 0.038269];
const TAU_LARGE_P: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

/// MacKinnon (2010) critical value surfaces `b0 + b1/T + b2/T^2 + b3/T^3`.
const CRIT_1_PCT: [f64; 4] = [-3.43035, -6.5393, -16.786, -79.433];
const CRIT_5_PCT: [f64; 4] = [-2.86154, -2.8903, -4.234, -40.040];
const CRIT_10_PCT: [f64; 4] = [-2.56677, -1.5384, -2.809, 0.0];

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct CriticalValues {
    #[serde(rename = "1%")]
    pub one_pct: f64,
    #[serde(rename = "5%")]
    pub five_pct: f64,
    #[serde(rename = "10%")]
    pub ten_pct: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct StationarityResult {
    pub test_statistic: f64,
    pub p_value: f64,
    pub critical_values: CriticalValues,
    pub lags: usize,
    /// Observations in the test regression.
    pub n_observations: usize,
    pub is_stationary: bool,
    /// Bars for a deviation to decay by half, `None` if the series does not mean revert.
    pub half_life: Option<f64>,
}

/// Run the ADF test on `series`.
///
/// Requires `max(min_points, 2 * lags + 4)` values, so the test regression keeps at least
/// one residual degree of freedom. A series whose test regression is singular
/// or fits perfectly (eg/ constant) is a [`AnalyticsError::DegenerateInput`].
pub fn adf_test(
    series: &[f64],
    lags: usize,
    significance: f64,
    min_points: usize,
) -> Result<StationarityResult, AnalyticsError> {
    let required = min_points.max(2 * lags + 4);
    if series.len() < required {
        return Err(AnalyticsError::insufficient("stationarity", required, series.len()));
    }

    let diffs = series
        .iter()
        .tuple_windows()
        .map(|(prev, curr)| curr - prev)
        .collect::<Vec<_>>();

    // Row t regresses diffs[t] on [1, series[t], diffs[t-1], ..., diffs[t-lags]]
    let (design, response): (Vec<Vec<f64>>, Vec<f64>) = (lags..diffs.len())
        .map(|t| {
            let mut row = Vec::with_capacity(lags + 2);
            row.push(1.0);
            row.push(series[t]);
            row.extend((1..=lags).map(|lag| diffs[t - lag]));
            (row, diffs[t])
        })
        .unzip();

    let n_observations = response.len();
    let fit = ols(&design, &response).ok_or_else(|| {
        AnalyticsError::DegenerateInput("singular ADF test regression".to_string())
    })?;

    let se_gamma = fit.std_errors[1];
    if !se_gamma.is_finite() || se_gamma <= 0.0 {
        return Err(AnalyticsError::DegenerateInput(
            "ADF test regression has zero residual variance".to_string(),
        ));
    }

    let test_statistic = fit.coefficients[1] / se_gamma;
    let p_value = mackinnon_p_value(test_statistic);

    Ok(StationarityResult {
        test_statistic,
        p_value,
        critical_values: mackinnon_critical_values(n_observations),
        lags,
        n_observations,
        is_stationary: p_value < significance,
        half_life: half_life(series),
    })
}

/// Approximate p-value of an ADF test statistic.
pub fn mackinnon_p_value(test_statistic: f64) -> f64 {
    if test_statistic.is_nan() {
        return 1.0;
    }
    if test_statistic > TAU_MAX {
        return 1.0;
    }
    if test_statistic < TAU_MIN {
        return 0.0;
    }

    let poly = if test_statistic <= TAU_STAR {
        polyval(&TAU_SMALL_P, test_statistic)
    } else {
        polyval(&TAU_LARGE_P, test_statistic)
    };

    normal_cdf(poly)
}

/// Critical values for a test regression of `n_observations` observations.
pub fn mackinnon_critical_values(n_observations: usize) -> CriticalValues {
    let inverse = 1.0 / n_observations.max(1) as f64;
    CriticalValues {
        one_pct: polyval(&CRIT_1_PCT, inverse),
        five_pct: polyval(&CRIT_5_PCT, inverse),
        ten_pct: polyval(&CRIT_10_PCT, inverse),
    }
}

/// Half-life of mean reversion from `dy_t = a + b * y_{t-1}`, ie/ `-ln(2) / ln(1 + b)`.
pub fn half_life(series: &[f64]) -> Option<f64> {
    if series.len() < 5 {
        return None;
    }

    let (levels, diffs): (Vec<f64>, Vec<f64>) = series
        .iter()
        .tuple_windows()
        .map(|(prev, curr)| (*prev, curr - prev))
        .unzip();

    let n = levels.len() as f64;
    let mean_level = levels.iter().sum::<f64>() / n;
    let mean_diff = diffs.iter().sum::<f64>() / n;

    let (num, den) = levels
        .iter()
        .zip(&diffs)
        .fold((0.0, 0.0), |(num, den), (level, diff)| {
            let dl = level - mean_level;
            (num + dl * (diff - mean_diff), den + dl * dl)
        });
    if den.abs() < 1e-12 {
        return None;
    }

    let b = num / den;
    if b >= 0.0 {
        return None;
    }

    let half_life = -(2f64.ln()) / (1.0 + b.max(-0.999)).ln();
    half_life.is_finite().then_some(half_life)
}

/// Multiple regression coefficients and their standard errors.
#[derive(Debug, Clone)]
struct OlsFit {
    coefficients: Vec<f64>,
    std_errors: Vec<f64>,
}

/// Least squares via the normal equations, `None` if `X'X` is singular or there are no
/// residual degrees of freedom.
fn ols(design: &[Vec<f64>], response: &[f64]) -> Option<OlsFit> {
    let k = design.first()?.len();
    let n = response.len();
    if n <= k {
        return None;
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, y) in design.iter().zip(response) {
        for i in 0..k {
            xty[i] += row[i] * y;
            for j in 0..k {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }

    let inverse = invert(xtx)?;
    let coefficients = (0..k)
        .map(|i| (0..k).map(|j| inverse[i][j] * xty[j]).sum::<f64>())
        .collect::<Vec<_>>();

    let rss = design
        .iter()
        .zip(response)
        .map(|(row, y)| {
            let fitted = row.iter().zip(&coefficients).map(|(x, b)| x * b).sum::<f64>();
            (y - fitted).powi(2)
        })
        .sum::<f64>();

    let sigma_sq = rss / (n - k) as f64;
    let std_errors = (0..k)
        .map(|i| (sigma_sq * inverse[i][i]).max(0.0).sqrt())
        .collect();

    Some(OlsFit {
        coefficients,
        std_errors,
    })
}

/// Gauss-Jordan inversion with partial pivoting.
fn invert(mut matrix: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let k = matrix.len();
    let scale = (0..k)
        .map(|i| matrix[i][i].abs())
        .fold(0.0f64, f64::max);
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let tolerance = scale * 1e-12;

    let mut inverse = (0..k)
        .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    for column in 0..k {
        let pivot_row = (column..k).max_by(|a, b| {
            matrix[*a][column]
                .abs()
                .total_cmp(&matrix[*b][column].abs())
        })?;
        if matrix[pivot_row][column].abs() <= tolerance {
            return None;
        }
        matrix.swap(column, pivot_row);
        inverse.swap(column, pivot_row);

        let pivot = matrix[column][column];
        for j in 0..k {
            matrix[column][j] /= pivot;
            inverse[column][j] /= pivot;
        }

        for row in 0..k {
            if row == column {
                continue;
            }
            let factor = matrix[row][column];
            if factor == 0.0 {
                continue;
            }
            for j in 0..k {
                matrix[row][j] -= factor * matrix[column][j];
                inverse[row][j] -= factor * inverse[column][j];
            }
        }
    }

    Some(inverse)
}

/// Evaluate `c0 + c1*x + c2*x^2 + ...`.
fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .rev()
        .fold(0.0, |acc, coefficient| acc * x + coefficient)
}

/// Standard normal CDF.
fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Complementary error function, Chebyshev fit with fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.26551223
        + t * (1.00002368
            + t * (0.37409196
                + t * (0.09678418
                    + t * (-0.18628806
                        + t * (0.27886807
                            + t * (-1.13520398
                                + t * (1.48851587 + t * (-0.82215223 + t * 0.17087277))))))));
    let result = t * poly.exp();
    if x >= 0.0 { result } else { 2.0 - result }
}
