use crate::{
    align::align,
    analytics::regression::paired_log_returns,
    bar::Bar,
    interval::Interval,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Correlation of paired returns over the window, plus a rolling history.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CorrelationResult {
    /// Full window Pearson correlation, `None` if either series has zero variance.
    pub correlation: Option<f64>,
    pub rolling_window: usize,
    /// Rolling correlation keyed by the timestamp closing each rolling window.
    pub history: Vec<(DateTime<Utc>, f64)>,
}

/// Pearson correlation coefficient, in `[-1, 1]`.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);

    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    let mut sum_sq = 0.0;

    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
        sum_sq += xi * xi + yi * yi;
    }

    let floor = f64::EPSILON * sum_sq;
    if var_x <= floor || var_y <= floor {
        return None;
    }

    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Rolling Pearson correlation over trailing windows of `window` observations.
///
/// Windows where either series has zero variance are skipped.
pub fn rolling_correlation(
    timestamps: &[DateTime<Utc>],
    x: &[f64],
    y: &[f64],
    window: usize,
) -> Vec<(DateTime<Utc>, f64)> {
    let len = timestamps.len().min(x.len()).min(y.len());
    let window = window.max(2);
    if len < window {
        return Vec::new();
    }

    (window - 1..len)
        .filter_map(|end| {
            let start = end + 1 - window;
            pearson(&x[start..=end], &y[start..=end]).map(|r| (timestamps[end], r))
        })
        .collect()
}

/// Full window and rolling correlation of paired returns.
pub fn correlation(
    timestamps: &[DateTime<Utc>],
    x: &[f64],
    y: &[f64],
    rolling_window: usize,
) -> CorrelationResult {
    CorrelationResult {
        correlation: pearson(x, y),
        rolling_window,
        history: rolling_correlation(timestamps, x, y, rolling_window),
    }
}

/// Pairwise correlation of log returns across a set of symbols.
///
/// `values[i][j]` is the correlation of `symbols[i]` with `symbols[j]` over the buckets
/// common to both, `None` when it is undefined (fewer than 3 common buckets or zero
/// variance). The diagonal is always `Some(1.0)`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CorrelationMatrix {
    pub symbols: Vec<SmolStr>,
    pub interval: Interval,
    pub window_len: usize,
    pub values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    /// Correlation of two symbols, if both are part of the matrix.
    pub fn get(&self, symbol_a: &str, symbol_b: &str) -> Option<f64> {
        let i = self.symbols.iter().position(|symbol| symbol == symbol_a)?;
        let j = self.symbols.iter().position(|symbol| symbol == symbol_b)?;
        self.values[i][j]
    }
}

/// Build a [`CorrelationMatrix`] from the ascending bars of each symbol.
pub fn correlation_matrix(
    interval: Interval,
    window_len: usize,
    series: &[(SmolStr, Vec<Bar>)],
) -> CorrelationMatrix {
    let len = series.len();
    let mut values = vec![vec![None; len]; len];

    for i in 0..len {
        values[i][i] = Some(1.0);
        for j in i + 1..len {
            let aligned = align(&series[i].1, &series[j].1);
            let r = paired_log_returns(&aligned.timestamps, &aligned.x, &aligned.y)
                .ok()
                .and_then(|returns| pearson(&returns.x, &returns.y));
            values[i][j] = r;
            values[j][i] = r;
        }
    }

    CorrelationMatrix {
        symbols: series.iter().map(|(symbol, _)| symbol.clone()).collect(),
        interval,
        window_len,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bars(symbol: &str, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(minute, close)| Bar {
                symbol: SmolStr::new(symbol),
                interval: Interval::M1,
                bucket_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute as u32, 0).unwrap(),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1.0,
                trade_count: 1,
            })
            .collect()
    }

    #[test]
    fn test_pearson() {
        struct TestCase {
            x: Vec<f64>,
            y: Vec<f64>,
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: perfect positive
                x: vec![1.0, 2.0, 3.0, 4.0, 5.0],
                y: vec![2.0, 4.0, 6.0, 8.0, 10.0],
                expected: Some(1.0),
            },
            TestCase {
                // TC1: perfect negative
                x: vec![1.0, 2.0, 3.0, 4.0, 5.0],
                y: vec![5.0, 4.0, 3.0, 2.0, 1.0],
                expected: Some(-1.0),
            },
            TestCase {
                // TC2: zero variance series has no correlation
                x: vec![0.01, 0.01, 0.01, 0.01],
                y: vec![0.02, -0.01, 0.03, 0.00],
                expected: None,
            },
            TestCase {
                // TC3: insufficient data
                x: vec![1.0],
                y: vec![1.0],
                expected: None,
            },
            TestCase {
                // TC4: uncorrelated
                x: vec![1.0, -1.0, 1.0, -1.0],
                y: vec![1.0, 1.0, -1.0, -1.0],
                expected: Some(0.0),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = pearson(&test.x, &test.y);
            match (actual, test.expected) {
                (Some(actual), Some(expected)) => {
                    assert!((actual - expected).abs() < 1e-12, "TC{} failed", index)
                }
                (None, None) => {}
                (actual, expected) => {
                    panic!("TC{index} failed because actual != expected. \nActual: {actual:?}\nExpected: {expected:?}\n");
                }
            }
        }
    }

    #[test]
    fn test_rolling_correlation() {
        let timestamps = (0..6)
            .map(|minute| Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap())
            .collect::<Vec<_>>();
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = [1.0, 2.0, 3.0, 3.0, 2.0, 1.0];

        let history = rolling_correlation(&timestamps, &x, &y, 3);

        assert_eq!(history.len(), 4);
        assert_eq!(history[0].0, timestamps[2]);
        assert!((history[0].1 - 1.0).abs() < 1e-12);
        assert!((history[3].1 + 1.0).abs() < 1e-12);

        assert!(rolling_correlation(&timestamps, &x, &y, 10).is_empty());
    }

    #[test]
    fn test_correlation_matrix() {
        let series = vec![
            (SmolStr::new("BTCUSDT"), bars("BTCUSDT", &[100.0, 101.0, 100.5, 102.0, 101.0])),
            (SmolStr::new("ETHUSDT"), bars("ETHUSDT", &[10.0, 10.1, 10.05, 10.2, 10.1])),
            (SmolStr::new("SOLUSDT"), bars("SOLUSDT", &[20.0, 20.0])),
        ];

        let matrix = correlation_matrix(Interval::M1, 60, &series);

        assert_eq!(matrix.symbols.len(), 3);
        assert_eq!(matrix.get("BTCUSDT", "BTCUSDT"), Some(1.0));
        assert!((matrix.get("BTCUSDT", "ETHUSDT").unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(matrix.get("BTCUSDT", "ETHUSDT"), matrix.get("ETHUSDT", "BTCUSDT"));
        // one flat return is not enough for a correlation
        assert_eq!(matrix.get("BTCUSDT", "SOLUSDT"), None);
        assert_eq!(matrix.get("BTCUSDT", "XRPUSDT"), None);
    }
}
