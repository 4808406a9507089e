use crate::{interval::Interval, normalizer::Tick};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Identifies one bar series, ie/ the unit of independent aggregator state and the
/// `(symbol, interval)` prefix of the store's primary key.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Constructor, Deserialize, Serialize,
)]
#[display("{symbol}@{interval}")]
pub struct SeriesKey {
    pub symbol: SmolStr,
    pub interval: Interval,
}

/// OHLCV bar for one `(symbol, interval, bucket_start)` bucket.
///
/// Invariant: `low <= open, close <= high` and `trade_count >= 1`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub symbol: SmolStr,
    pub interval: Interval,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
}

impl Bar {
    /// Open a new bar from the first [`Tick`] of a bucket.
    pub fn from_tick(tick: &Tick, interval: Interval) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            interval,
            bucket_start: interval.bucket_start(tick.time),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size,
            trade_count: 1,
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.interval)
    }

    /// Fold a trade into the extremes, volume and trade count.
    ///
    /// `open` / `close` are owned by the caller, since only it knows the trade's position
    /// relative to the bucket's first and last trade times.
    pub fn absorb(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += size;
        self.trade_count += 1;
    }

    pub fn is_consistent(&self) -> bool {
        self.trade_count >= 1
            && self.low <= self.high
            && (self.low..=self.high).contains(&self.open)
            && (self.low..=self.high).contains(&self.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(price: f64, size: f64, second: u32) -> Tick {
        Tick::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap(),
            price,
            size,
        )
        .unwrap()
    }

    #[test]
    fn test_bar_from_tick_and_absorb() {
        let mut bar = Bar::from_tick(&tick(100.0, 1.0, 5), Interval::M1);
        assert_eq!(
            bar.bucket_start,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );

        bar.absorb(103.0, 0.5);
        bar.absorb(98.0, 0.25);
        bar.close = 98.0;

        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.volume, 1.75);
        assert_eq!(bar.trade_count, 3);
        assert!(bar.is_consistent());
    }

    #[test]
    fn test_series_key_display() {
        let key = SeriesKey::new(SmolStr::new("ETHUSDT"), Interval::M5);
        assert_eq!(key.to_string(), "ETHUSDT@5m");
    }
}
