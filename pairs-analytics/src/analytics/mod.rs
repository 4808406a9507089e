use crate::{
    align::{AlignedSeries, align_window},
    config::EngineConfig,
    error::AnalyticsError,
    interval::Interval,
    store::SeriesStore,
};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::debug;

/// Pearson correlation of paired returns, full window and rolling.
pub mod correlation;

/// Log returns, gated OLS hedge ratio regression and spread.
pub mod regression;

/// Augmented Dickey-Fuller test with MacKinnon p-values and half-life.
pub mod stationarity;

/// Descriptive per-symbol price and volume statistics.
pub mod stats;

/// Spread z-scores.
pub mod zscore;

pub use correlation::{CorrelationMatrix, CorrelationResult};
pub use regression::RegressionResult;
pub use stationarity::{CriticalValues, StationarityResult};
pub use stats::SymbolStats;
pub use zscore::{ZScorePoint, ZScoreSeries};

/// Identifies one analytics computation: `y = symbol_y` is regressed on `x = symbol_x`.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Constructor, Deserialize, Serialize,
)]
#[display("{symbol_x}/{symbol_y}@{interval}x{window_len}")]
pub struct PairKey {
    pub symbol_x: SmolStr,
    pub symbol_y: SmolStr,
    pub interval: Interval,
    pub window_len: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDirection {
    /// Spread rich (`z > 0`): sell `y`, buy `hedge_ratio * x`.
    ShortSpread,
    /// Spread cheap (`z < 0`): buy `y`, sell `hedge_ratio * x`.
    LongSpread,
}

/// Raised when the latest spread z-score of a valid regression breaches the threshold.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpreadAlert {
    pub timestamp: DateTime<Utc>,
    pub z: f64,
    pub threshold: f64,
    pub direction: AlertDirection,
}

/// Complete, immutable output of one analytics computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    pub key: PairKey,
    pub computed_at: DateTime<Utc>,
    /// Buckets common to both symbols in the window.
    pub n_aligned: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_close_x: f64,
    pub last_close_y: f64,
    pub regression: RegressionResult,
    pub spread: ZScoreSeries,
    pub latest_z: Option<f64>,
    pub stationarity: Result<StationarityResult, AnalyticsError>,
    pub correlation: CorrelationResult,
    pub alert: Option<SpreadAlert>,
}

/// Stateless analytics over aligned close series.
#[derive(Debug, Clone)]
pub struct AnalyticsEngine {
    config: Arc<EngineConfig>,
}

impl AnalyticsEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Align the latest `key.window_len` bars from `store` and compute a snapshot.
    pub fn compute_from_store(
        &self,
        store: &dyn SeriesStore,
        key: &PairKey,
        computed_at: DateTime<Utc>,
    ) -> Result<AnalyticsSnapshot, AnalyticsError> {
        let aligned = align_window(
            store,
            &key.symbol_x,
            &key.symbol_y,
            key.interval,
            key.window_len,
            self.config.min_aligned_points,
        )?;
        self.compute(key, &aligned, computed_at)
    }

    /// Compute every sub-result for one aligned window.
    ///
    /// Fails only if returns or the regression cannot be computed. A stationarity test that
    /// cannot run is reported inside the snapshot.
    pub fn compute(
        &self,
        key: &PairKey,
        aligned: &AlignedSeries,
        computed_at: DateTime<Utc>,
    ) -> Result<AnalyticsSnapshot, AnalyticsError> {
        let config = &self.config;

        let (Some(window_start), Some(window_end), Some(last_close_x), Some(last_close_y)) = (
            aligned.timestamps.first().copied(),
            aligned.timestamps.last().copied(),
            aligned.x.last().copied(),
            aligned.y.last().copied(),
        ) else {
            return Err(AnalyticsError::insufficient("alignment", 2, 0));
        };

        let returns = regression::paired_log_returns(&aligned.timestamps, &aligned.x, &aligned.y)?;

        let regression = regression::regress(
            &returns.x,
            &returns.y,
            &config.gate,
            config.min_regression_points,
        )?;

        let spread = regression::spread(&returns.x, &returns.y, regression.hedge_ratio);
        let spread = zscore::zscore_series(&returns.timestamps, &spread, config.zscore_window);
        let latest_z = spread.latest_z();

        let spread_values = spread
            .points
            .iter()
            .map(|point| point.spread)
            .collect::<Vec<_>>();
        let stationarity = stationarity::adf_test(
            &spread_values,
            config.adf_lags,
            config.significance,
            config.min_adf_points,
        );

        let correlation = correlation::correlation(
            &returns.timestamps,
            &returns.x,
            &returns.y,
            config.correlation_window,
        );

        let alert = match (regression.is_valid, spread.latest()) {
            (true, Some(latest)) => latest
                .z
                .filter(|z| z.abs() >= config.zscore_alert_threshold)
                .map(|z| SpreadAlert {
                    timestamp: latest.timestamp,
                    z,
                    threshold: config.zscore_alert_threshold,
                    direction: if z > 0.0 {
                        AlertDirection::ShortSpread
                    } else {
                        AlertDirection::LongSpread
                    },
                }),
            _ => None,
        };

        debug!(
            pair = %key,
            n_aligned = aligned.len(),
            hedge_ratio = regression.hedge_ratio,
            r_squared = regression.r_squared,
            is_valid = regression.is_valid,
            ?latest_z,
            "computed analytics snapshot"
        );

        Ok(AnalyticsSnapshot {
            key: key.clone(),
            computed_at,
            n_aligned: aligned.len(),
            window_start,
            window_end,
            last_close_x,
            last_close_y,
            regression,
            spread,
            latest_z,
            stationarity,
            correlation,
            alert,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use chrono::{TimeDelta, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn key() -> PairKey {
        PairKey::new(
            SmolStr::new("BTCUSDT"),
            SmolStr::new("ETHUSDT"),
            Interval::M1,
            60,
        )
    }

    /// Closes whose log returns follow `returns`, starting from `start`.
    fn closes(start: f64, returns: &[f64]) -> Vec<f64> {
        std::iter::once(start)
            .chain(returns.iter().scan(start, |close, ret| {
                *close *= f64::exp(*ret);
                Some(*close)
            }))
            .collect()
    }

    fn aligned(returns_x: &[f64], returns_y: &[f64]) -> AlignedSeries {
        let x = closes(100.0, returns_x);
        let y = closes(10.0, returns_y);
        AlignedSeries {
            timestamps: (0..x.len())
                .map(|minute| base() + TimeDelta::minutes(minute as i64))
                .collect(),
            x,
            y,
        }
    }

    fn engine(config: EngineConfig) -> AnalyticsEngine {
        AnalyticsEngine::new(Arc::new(config))
    }

    /// Oscillating returns with a final shock in `y` relative to `x`.
    fn returns_with_shock(len: usize, shock: f64) -> (Vec<f64>, Vec<f64>) {
        let x = (0..len)
            .map(|index| 0.01 * ((index as f64) * 1.3).sin())
            .collect::<Vec<_>>();
        let mut y = x
            .iter()
            .enumerate()
            .map(|(index, x)| 0.9 * x + 0.0005 * ((index as f64) * 2.7).cos())
            .collect::<Vec<_>>();
        if let Some(last) = y.last_mut() {
            *last += shock;
        }
        (x, y)
    }

    #[test]
    fn test_compute_valid_snapshot_with_alert() {
        let (returns_x, returns_y) = returns_with_shock(40, 0.01);
        let engine = engine(EngineConfig::default());

        let snapshot = engine
            .compute(&key(), &aligned(&returns_x, &returns_y), base())
            .unwrap();

        assert_eq!(snapshot.n_aligned, 41);
        assert_eq!(snapshot.regression.n_observations, 40);
        assert!(snapshot.regression.is_valid);
        assert!((snapshot.regression.hedge_ratio - 0.9).abs() < 0.1);
        assert_eq!(snapshot.spread.points.len(), 40);

        let latest_z = snapshot.latest_z.unwrap();
        assert!(latest_z > 2.0);

        let alert = snapshot.alert.unwrap();
        assert_eq!(alert.direction, AlertDirection::ShortSpread);
        assert_eq!(alert.z, latest_z);
        assert_eq!(alert.timestamp, snapshot.window_end);

        assert!(snapshot.stationarity.is_ok());
        assert!(snapshot.correlation.correlation.unwrap() > 0.9);
        assert_eq!(snapshot.correlation.history.len(), 40 - 20 + 1);
    }

    #[test]
    fn test_compute_invalid_regression_never_alerts() {
        let (returns_x, returns_y) = returns_with_shock(40, 0.01);
        let strict = EngineConfig::default().with_gate(GateConfig {
            max_abs_beta: 0.5,
            ..GateConfig::default()
        });

        let snapshot = engine(strict)
            .compute(&key(), &aligned(&returns_x, &returns_y), base())
            .unwrap();

        assert!(!snapshot.regression.is_valid);
        assert!(snapshot.latest_z.unwrap() > 2.0);
        assert!(snapshot.alert.is_none());
    }

    #[test]
    fn test_compute_constant_regressor_is_degenerate() {
        let returns_x = vec![0.001; 15];
        let returns_y = (0..15)
            .map(|index| 0.001 * (index as f64).sin())
            .collect::<Vec<_>>();

        let actual = engine(EngineConfig::default()).compute(
            &key(),
            &aligned(&returns_x, &returns_y),
            base(),
        );

        assert!(matches!(actual, Err(AnalyticsError::DegenerateInput(_))));
    }

    #[test]
    fn test_compute_short_window_reports_stationarity_not_ready() {
        let (returns_x, returns_y) = returns_with_shock(12, 0.0);

        let snapshot = engine(EngineConfig::default())
            .compute(&key(), &aligned(&returns_x, &returns_y), base())
            .unwrap();

        assert_eq!(
            snapshot.stationarity,
            Err(AnalyticsError::insufficient("stationarity", 20, 12))
        );
        assert!(snapshot.correlation.history.is_empty());
    }

    #[test]
    fn test_compute_too_few_returns() {
        let (returns_x, returns_y) = returns_with_shock(5, 0.0);

        let actual = engine(EngineConfig::default()).compute(
            &key(),
            &aligned(&returns_x, &returns_y),
            base(),
        );

        assert_eq!(actual, Err(AnalyticsError::insufficient("regression", 10, 5)));
    }

    #[test]
    fn test_pair_key_display() {
        assert_eq!(key().to_string(), "BTCUSDT/ETHUSDT@1mx60");
    }
}
