use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZScorePoint {
    pub timestamp: DateTime<Utc>,
    pub spread: f64,
    /// `None` when the reference standard deviation is zero or too few points precede it.
    pub z: Option<f64>,
}

/// Spread z-scores over the active window.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZScoreSeries {
    pub points: Vec<ZScorePoint>,
    /// Trailing sub-window used for the reference mean and std, `None` for the full window
    /// (also when the requested sub-window is not shorter than the series).
    pub window: Option<usize>,
}

impl ZScoreSeries {
    /// Z-score of the most recent spread observation.
    pub fn latest_z(&self) -> Option<f64> {
        self.points.last().and_then(|point| point.z)
    }

    pub fn latest(&self) -> Option<&ZScorePoint> {
        self.points.last()
    }
}

/// Compute `z_t = (s_t - mean) / std` for every spread observation.
///
/// With `window = None` the mean and sample std are taken over the full series. With
/// `Some(w)` each point uses the trailing `w` observations ending at that point, and the
/// first `w - 1` points have no z-score.
pub fn zscore_series(
    timestamps: &[DateTime<Utc>],
    spread: &[f64],
    window: Option<usize>,
) -> ZScoreSeries {
    let len = timestamps.len().min(spread.len());

    let window = window.filter(|window| *window < len);
    let points = match window {
        None => {
            let reference = mean_std(&spread[..len]);
            (0..len)
                .map(|index| point(timestamps[index], spread[index], reference))
                .collect()
        }
        Some(window) => (0..len)
            .map(|index| {
                let reference = (index + 1 >= window.max(2))
                    .then(|| mean_std(&spread[index + 1 - window.max(2)..=index]))
                    .flatten();
                point(timestamps[index], spread[index], reference)
            })
            .collect(),
    };

    ZScoreSeries { points, window }
}

fn point(timestamp: DateTime<Utc>, spread: f64, reference: Option<(f64, f64)>) -> ZScorePoint {
    ZScorePoint {
        timestamp,
        spread,
        z: reference.map(|(mean, std)| (spread - mean) / std),
    }
}

/// Mean and sample standard deviation, `None` for fewer than two values or zero dispersion.
fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();

    // Rounding noise on a constant series must not produce huge z-scores
    if !std.is_finite() || std == 0.0 || std <= 1e-9 * mean.abs() {
        return None;
    }

    Some((mean, std))
}
