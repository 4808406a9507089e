use crate::{bar::Bar, error::AnalyticsError, interval::Interval, store::SeriesStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Two close series restricted to the buckets present in both.
///
/// Invariant: `timestamps`, `x` and `y` have equal length and `x[i]`, `y[i]` are the closes
/// of the bucket starting at `timestamps[i]`, strictly ascending.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlignedSeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Intersect two ascending bar series on `bucket_start`.
///
/// Buckets present in only one series are skipped, never filled.
pub fn align(bars_x: &[Bar], bars_y: &[Bar]) -> AlignedSeries {
    let capacity = bars_x.len().min(bars_y.len());
    let mut aligned = AlignedSeries {
        timestamps: Vec::with_capacity(capacity),
        x: Vec::with_capacity(capacity),
        y: Vec::with_capacity(capacity),
    };

    let (mut i, mut j) = (0, 0);
    while i < bars_x.len() && j < bars_y.len() {
        let (bar_x, bar_y) = (&bars_x[i], &bars_y[j]);
        match bar_x.bucket_start.cmp(&bar_y.bucket_start) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                aligned.timestamps.push(bar_x.bucket_start);
                aligned.x.push(bar_x.close);
                aligned.y.push(bar_y.close);
                i += 1;
                j += 1;
            }
        }
    }

    aligned
}

/// Fetch the latest `window_len` bars of both symbols and align them.
///
/// Fails with [`AnalyticsError::InsufficientData`] when fewer than `max(2, min_points)`
/// buckets are common to both series.
pub fn align_window(
    store: &dyn SeriesStore,
    symbol_x: &str,
    symbol_y: &str,
    interval: Interval,
    window_len: usize,
    min_points: usize,
) -> Result<AlignedSeries, AnalyticsError> {
    let bars_x = store.latest_bars(symbol_x, interval, window_len)?;
    let bars_y = store.latest_bars(symbol_y, interval, window_len)?;

    let aligned = align(&bars_x, &bars_y);
    let required = min_points.max(2);
    if aligned.len() < required {
        return Err(AnalyticsError::insufficient(
            "alignment",
            required,
            aligned.len(),
        ));
    }

    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySeriesStore;
    use chrono::TimeZone;
    use smol_str::SmolStr;

    fn bar(symbol: &str, minute: u32, close: f64) -> Bar {
        Bar {
            symbol: SmolStr::new(symbol),
            interval: Interval::M1,
            bucket_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: 1,
        }
    }

    #[test]
    fn test_align() {
        struct TestCase {
            minutes_x: Vec<u32>,
            minutes_y: Vec<u32>,
            expected: Vec<u32>,
        }

        let tests = vec![
            TestCase {
                // TC0: identical buckets
                minutes_x: vec![0, 1, 2],
                minutes_y: vec![0, 1, 2],
                expected: vec![0, 1, 2],
            },
            TestCase {
                // TC1: gaps on both sides are skipped, not filled
                minutes_x: vec![0, 1, 3, 4, 6],
                minutes_y: vec![1, 2, 3, 5, 6],
                expected: vec![1, 3, 6],
            },
            TestCase {
                // TC2: disjoint series
                minutes_x: vec![0, 2, 4],
                minutes_y: vec![1, 3, 5],
                expected: vec![],
            },
            TestCase {
                // TC3: one empty series
                minutes_x: vec![],
                minutes_y: vec![1, 3, 5],
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let bars_x = test
                .minutes_x
                .iter()
                .map(|minute| bar("BTCUSDT", *minute, 100.0 + *minute as f64))
                .collect::<Vec<_>>();
            let bars_y = test
                .minutes_y
                .iter()
                .map(|minute| bar("ETHUSDT", *minute, 10.0 + *minute as f64))
                .collect::<Vec<_>>();

            let actual = align(&bars_x, &bars_y);

            let expected_timestamps = test
                .expected
                .iter()
                .map(|minute| Utc.with_ymd_and_hms(2025, 1, 1, 0, *minute, 0).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(actual.timestamps, expected_timestamps, "TC{} failed", index);
            assert_eq!(actual.x.len(), actual.len(), "TC{} failed", index);
            assert_eq!(actual.y.len(), actual.len(), "TC{} failed", index);
            for (position, minute) in test.expected.iter().enumerate() {
                assert_eq!(actual.x[position], 100.0 + *minute as f64, "TC{} failed", index);
                assert_eq!(actual.y[position], 10.0 + *minute as f64, "TC{} failed", index);
            }
        }
    }

    #[test]
    fn test_align_window_insufficient_data() {
        let store = InMemorySeriesStore::new();
        store.upsert_bar(&bar("BTCUSDT", 0, 100.0)).unwrap();
        store.upsert_bar(&bar("ETHUSDT", 0, 10.0)).unwrap();
        store.upsert_bar(&bar("ETHUSDT", 1, 10.0)).unwrap();

        let actual = align_window(&store, "BTCUSDT", "ETHUSDT", Interval::M1, 60, 10);
        assert_eq!(
            actual,
            Err(AnalyticsError::insufficient("alignment", 10, 1))
        );
    }

    #[test]
    fn test_align_window_uses_latest_bars() {
        let store = InMemorySeriesStore::new();
        for minute in 0..10 {
            store.upsert_bar(&bar("BTCUSDT", minute, 100.0 + minute as f64)).unwrap();
            store.upsert_bar(&bar("ETHUSDT", minute, 10.0 + minute as f64)).unwrap();
        }

        let aligned = align_window(&store, "BTCUSDT", "ETHUSDT", Interval::M1, 4, 2).unwrap();
        assert_eq!(aligned.x, vec![106.0, 107.0, 108.0, 109.0]);
        assert_eq!(aligned.y, vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_align_window_store_unavailable() {
        let store = InMemorySeriesStore::new();
        store.set_offline(true);

        let actual = align_window(&store, "BTCUSDT", "ETHUSDT", Interval::M1, 60, 2);
        assert!(matches!(actual, Err(AnalyticsError::StoreUnavailable(_))));
    }
}
