use crate::{bar::Bar, error::AnalyticsError, interval::Interval};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Descriptive close price and volume statistics of one symbol over a window of bars.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SymbolStats {
    pub symbol: SmolStr,
    pub interval: Interval,
    pub window_size: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub mean: f64,
    /// Sample standard deviation of closes.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub current: f64,
    /// Percentage change from the first to the last close.
    pub change_pct: f64,
    pub mean_volume: f64,
    pub std_volume: f64,
    pub total_volume: f64,
}

/// Compute [`SymbolStats`] over ascending `bars`, requiring at least `min_points` of them.
pub fn symbol_stats(bars: &[Bar], min_points: usize) -> Result<SymbolStats, AnalyticsError> {
    let required = min_points.max(2);
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return Err(AnalyticsError::insufficient("symbol_stats", required, 0));
    };
    if bars.len() < required {
        return Err(AnalyticsError::insufficient("symbol_stats", required, bars.len()));
    }

    let closes = bars.iter().map(|bar| bar.close).collect::<Vec<_>>();
    let volumes = bars.iter().map(|bar| bar.volume).collect::<Vec<_>>();
    let (mean, std) = mean_and_sample_std(&closes);
    let (mean_volume, std_volume) = mean_and_sample_std(&volumes);

    let change_pct = if first.close != 0.0 {
        (last.close - first.close) / first.close * 100.0
    } else {
        0.0
    };

    Ok(SymbolStats {
        symbol: last.symbol.clone(),
        interval: last.interval,
        window_size: bars.len(),
        window_start: first.bucket_start,
        window_end: last.bucket_start,
        mean,
        std,
        min: closes.iter().copied().fold(f64::INFINITY, f64::min),
        max: closes.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        current: last.close,
        change_pct,
        mean_volume,
        std_volume,
        total_volume: volumes.iter().sum(),
    })
}

fn mean_and_sample_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: u32, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: SmolStr::new("BTCUSDT"),
            interval: Interval::M1,
            bucket_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
            trade_count: 1,
        }
    }

    #[test]
    fn test_symbol_stats() {
        let bars = vec![
            bar(0, 100.0, 1.0),
            bar(1, 102.0, 2.0),
            bar(2, 98.0, 3.0),
            bar(3, 110.0, 6.0),
        ];

        let stats = symbol_stats(&bars, 2).unwrap();

        assert_eq!(stats.window_size, 4);
        assert_eq!(stats.mean, 102.5);
        assert_eq!(stats.min, 98.0);
        assert_eq!(stats.max, 110.0);
        assert_eq!(stats.current, 110.0);
        assert!((stats.change_pct - 10.0).abs() < 1e-12);
        assert_eq!(stats.total_volume, 12.0);
        assert_eq!(stats.mean_volume, 3.0);
        // sample variance of closes: (6.25 + 0.25 + 20.25 + 56.25) / 3
        assert!((stats.std - (83.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(stats.window_end, bars[3].bucket_start);
    }

    #[test]
    fn test_symbol_stats_insufficient() {
        assert_eq!(
            symbol_stats(&[], 10),
            Err(AnalyticsError::insufficient("symbol_stats", 10, 0))
        );
        assert_eq!(
            symbol_stats(&[bar(0, 1.0, 1.0)], 10),
            Err(AnalyticsError::insufficient("symbol_stats", 10, 1))
        );
    }
}
