use crate::{
    bar::{Bar, SeriesKey},
    error::StoreError,
    interval::Interval,
    store::SeriesStore,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

/// [`SeriesStore`] holding every bar in memory, ordered per series by `bucket_start`.
///
/// Can be switched "offline" to exercise the [`StoreError::Unavailable`] paths.
#[derive(Debug, Default)]
pub struct InMemorySeriesStore {
    series: RwLock<FnvHashMap<SeriesKey, BTreeMap<DateTime<Utc>, Bar>>>,
    offline: AtomicBool,
}

impl InMemorySeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent operation with [`StoreError::Unavailable`] while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Total bars stored across all series.
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SeriesStore for InMemorySeriesStore {
    fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        self.check_online()?;
        self.series
            .write()
            .entry(bar.key())
            .or_default()
            .insert(bar.bucket_start, bar.clone());
        Ok(())
    }

    fn query_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError> {
        self.check_online()?;
        if from > to {
            return Ok(Vec::new());
        }

        let key = SeriesKey::new(SmolStr::new(symbol), interval);
        Ok(self
            .series
            .read()
            .get(&key)
            .map(|bars| bars.range(from..=to).map(|(_, bar)| bar.clone()).collect())
            .unwrap_or_default())
    }

    fn latest_bars(
        &self,
        symbol: &str,
        interval: Interval,
        n: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        self.check_online()?;

        let key = SeriesKey::new(SmolStr::new(symbol), interval);
        let series = self.series.read();
        let Some(bars) = series.get(&key) else {
            return Ok(Vec::new());
        };

        let mut latest = bars.values().rev().take(n).cloned().collect::<Vec<_>>();
        latest.reverse();
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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
    fn test_upsert_is_idempotent() {
        let store = InMemorySeriesStore::new();
        let original = bar("BTCUSDT", 0, 100.0);

        store.upsert_bar(&original).unwrap();
        store.upsert_bar(&original).unwrap();
        assert_eq!(store.len(), 1);

        let corrected = Bar {
            close: 101.0,
            high: 101.0,
            ..original.clone()
        };
        store.upsert_bar(&corrected).unwrap();

        let stored = store
            .get_bar("BTCUSDT", Interval::M1, original.bucket_start)
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(stored, Some(corrected));
    }

    #[test]
    fn test_query_and_latest_are_ascending() {
        let store = InMemorySeriesStore::new();
        for minute in [3, 1, 0, 2, 4] {
            store.upsert_bar(&bar("BTCUSDT", minute, minute as f64)).unwrap();
        }
        store.upsert_bar(&bar("ETHUSDT", 0, 10.0)).unwrap();

        let range = store
            .query_bars(
                "BTCUSDT",
                Interval::M1,
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 3, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(
            range.iter().map(|bar| bar.close).collect::<Vec<_>>(),
            vec![1.0, 2.0, 3.0]
        );

        let latest = store.latest_bars("BTCUSDT", Interval::M1, 2).unwrap();
        assert_eq!(
            latest.iter().map(|bar| bar.close).collect::<Vec<_>>(),
            vec![3.0, 4.0]
        );

        assert!(store.latest_bars("SOLUSDT", Interval::M1, 10).unwrap().is_empty());
        assert!(store.latest_bars("BTCUSDT", Interval::M5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_offline_store_is_unavailable() {
        let store = InMemorySeriesStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.upsert_bar(&bar("BTCUSDT", 0, 1.0)),
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.upsert_bar(&bar("BTCUSDT", 0, 1.0)).is_ok());
    }
}
