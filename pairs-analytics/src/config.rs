//! Engine configuration.
//!
//! Every threshold the engine uses is injected through [`EngineConfig`]. Defaults match the
//! production setup; [`EngineConfig::from_env`] applies `PAIRS_*` environment overrides.

use crate::interval::Interval;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr, time::Duration};
use tracing::warn;

/// Regression sanity gate thresholds.
///
/// A regression is flagged invalid when `|beta| >= max_abs_beta`, `r_squared <= min_r_squared`
/// or `std_error_beta >= max_relative_std_error * |beta|`.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct GateConfig {
    pub max_abs_beta: f64,
    pub min_r_squared: f64,
    pub max_relative_std_error: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_abs_beta: 3.0,
            min_r_squared: 0.3,
            max_relative_std_error: 1.0,
        }
    }
}

/// Policy for ticks that map to a bucket earlier than the currently open one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Apply the tick to the already sealed bar and re-persist it.
    #[default]
    Correct,
    /// Discard the tick and count it.
    Drop,
}

impl FromStr for LatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correct" => Ok(LatePolicy::Correct),
            "drop" => Ok(LatePolicy::Drop),
            other => Err(format!("unsupported late tick policy: {other}")),
        }
    }
}

/// Bounded retry buffer for bars the store failed to accept.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct WriteRetryConfig {
    /// Maximum bars buffered across all series before the oldest is dropped.
    pub max_pending: usize,
    /// Maximum upsert attempts per bar before it is dropped.
    pub max_attempts: u32,
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Bar intervals maintained by the aggregator.
    pub intervals: Vec<Interval>,
    /// Window length (bars) used when a caller does not specify one.
    pub default_window: usize,
    pub gate: GateConfig,
    /// `|z|` at or above which a valid regression raises a spread alert.
    pub zscore_alert_threshold: f64,
    /// Trailing sub-window for the z-score mean / std, `None` uses the full window.
    pub zscore_window: Option<usize>,
    /// ADF p-value below which the spread is considered stationary.
    pub significance: f64,
    /// Lagged differences included in the ADF regression.
    pub adf_lags: usize,
    /// Rolling window (returns) for the correlation history.
    pub correlation_window: usize,
    pub min_aligned_points: usize,
    pub min_regression_points: usize,
    pub min_adf_points: usize,
    pub min_stats_points: usize,
    /// Cache TTL per interval in milliseconds.
    pub cache_ttl_ms: BTreeMap<Interval, u64>,
    /// Fallback TTL for intervals missing from `cache_ttl_ms`.
    pub default_cache_ttl_ms: u64,
    /// Upper bound a caller waits on an in-flight computation.
    pub compute_timeout_ms: u64,
    pub late_policy: LatePolicy,
    /// Recently sealed bars kept in memory per series for late corrections.
    pub sealed_history: usize,
    /// Late ticks parked per series while the store cannot serve the bar they correct.
    pub deferred_late_ticks: usize,
    pub write_retry: WriteRetryConfig,
    /// A symbol without ticks for longer than this is reported as silent.
    pub health_stale_after_ms: u64,
    /// Capacity of the sealed bar broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intervals: vec![Interval::S1, Interval::M1, Interval::M5],
            default_window: 60,
            gate: GateConfig::default(),
            zscore_alert_threshold: 2.0,
            zscore_window: None,
            significance: 0.05,
            adf_lags: 1,
            correlation_window: 20,
            min_aligned_points: 10,
            min_regression_points: 10,
            min_adf_points: 20,
            min_stats_points: 10,
            cache_ttl_ms: BTreeMap::from([
                (Interval::S1, 5_000),
                (Interval::M1, 10_000),
                (Interval::M5, 30_000),
                (Interval::M15, 60_000),
                (Interval::H1, 60_000),
            ]),
            default_cache_ttl_ms: 10_000,
            compute_timeout_ms: 5_000,
            late_policy: LatePolicy::Correct,
            sealed_history: 64,
            deferred_late_ticks: 1_024,
            write_retry: WriteRetryConfig::default(),
            health_stale_after_ms: 30_000,
            broadcast_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Default configuration with `PAIRS_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(intervals) = env_parse::<String>("PAIRS_INTERVALS") {
            let parsed = intervals
                .split(',')
                .filter(|raw| !raw.trim().is_empty())
                .map(Interval::from_str)
                .collect::<Result<Vec<_>, _>>();
            match parsed {
                Ok(parsed) if !parsed.is_empty() => config.intervals = parsed,
                Ok(_) => warn!("PAIRS_INTERVALS is empty, keeping defaults"),
                Err(error) => warn!(%error, "invalid PAIRS_INTERVALS, keeping defaults"),
            }
        }

        if let Some(value) = env_parse("PAIRS_WINDOW") {
            config.default_window = value;
        }
        if let Some(value) = env_parse("PAIRS_MAX_ABS_BETA") {
            config.gate.max_abs_beta = value;
        }
        if let Some(value) = env_parse("PAIRS_MIN_R_SQUARED") {
            config.gate.min_r_squared = value;
        }
        if let Some(value) = env_parse("PAIRS_MAX_RELATIVE_STD_ERROR") {
            config.gate.max_relative_std_error = value;
        }
        if let Some(value) = env_parse("PAIRS_ZSCORE_ALERT") {
            config.zscore_alert_threshold = value;
        }
        if let Some(value) = env_parse("PAIRS_ZSCORE_WINDOW") {
            config.zscore_window = Some(value);
        }
        if let Some(value) = env_parse("PAIRS_SIGNIFICANCE") {
            config.significance = value;
        }
        if let Some(value) = env_parse("PAIRS_ADF_LAGS") {
            config.adf_lags = value;
        }
        if let Some(value) = env_parse("PAIRS_MIN_ALIGNED_POINTS") {
            config.min_aligned_points = value;
        }
        if let Some(value) = env_parse("PAIRS_MIN_REGRESSION_POINTS") {
            config.min_regression_points = value;
        }
        if let Some(value) = env_parse("PAIRS_MIN_ADF_POINTS") {
            config.min_adf_points = value;
        }
        if let Some(value) = env_parse("PAIRS_COMPUTE_TIMEOUT_MS") {
            config.compute_timeout_ms = value;
        }
        if let Some(value) = env_parse("PAIRS_LATE_POLICY") {
            config.late_policy = value;
        }
        if let Some(value) = env_parse("PAIRS_SEALED_HISTORY") {
            config.sealed_history = value;
        }
        if let Some(value) = env_parse("PAIRS_DEFERRED_LATE_TICKS") {
            config.deferred_late_ticks = value;
        }
        for interval in Interval::ALL {
            let key = format!("PAIRS_CACHE_TTL_MS_{}", interval.to_string().to_uppercase());
            if let Some(value) = env_parse(&key) {
                config.cache_ttl_ms.insert(interval, value);
            }
        }

        config
    }

    pub fn with_intervals(mut self, intervals: impl IntoIterator<Item = Interval>) -> Self {
        self.intervals = intervals.into_iter().collect();
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_min_aligned_points(mut self, points: usize) -> Self {
        self.min_aligned_points = points;
        self
    }

    pub fn with_min_regression_points(mut self, points: usize) -> Self {
        self.min_regression_points = points;
        self
    }

    pub fn with_min_adf_points(mut self, points: usize) -> Self {
        self.min_adf_points = points;
        self
    }

    pub fn with_zscore_window(mut self, window: Option<usize>) -> Self {
        self.zscore_window = window;
        self
    }

    pub fn with_cache_ttl(mut self, interval: Interval, ttl: Duration) -> Self {
        self.cache_ttl_ms.insert(interval, ttl.as_millis() as u64);
        self
    }

    pub fn with_compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_late_policy(mut self, policy: LatePolicy) -> Self {
        self.late_policy = policy;
        self
    }

    pub fn with_sealed_history(mut self, sealed_history: usize) -> Self {
        self.sealed_history = sealed_history;
        self
    }

    pub fn with_deferred_late_ticks(mut self, deferred_late_ticks: usize) -> Self {
        self.deferred_late_ticks = deferred_late_ticks;
        self
    }

    pub fn with_write_retry(mut self, write_retry: WriteRetryConfig) -> Self {
        self.write_retry = write_retry;
        self
    }

    pub fn cache_ttl(&self, interval: Interval) -> Duration {
        let millis = self
            .cache_ttl_ms
            .get(&interval)
            .copied()
            .unwrap_or(self.default_cache_ttl_ms);
        Duration::from_millis(millis)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }

    pub fn health_stale_after(&self) -> Duration {
        Duration::from_millis(self.health_stale_after_ms)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
