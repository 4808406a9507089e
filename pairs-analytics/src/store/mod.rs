use crate::{bar::Bar, error::StoreError, interval::Interval};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// In-memory [`SeriesStore`], primarily for tests and ephemeral deployments.
pub mod memory;

/// SQLite backed [`SeriesStore`].
pub mod sqlite;

pub use memory::InMemorySeriesStore;
pub use sqlite::SqliteSeriesStore;

/// Bar history keyed uniquely by `(symbol, interval, bucket_start)`.
///
/// Writers (aggregator sealing / correcting bars) and readers (window aligner) use a store
/// concurrently, so implementations must be internally synchronised. Every write is an
/// upsert: re-delivering a bar for an existing key replaces it, never duplicates it.
pub trait SeriesStore: Send + Sync {
    fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError>;

    /// Bars with `from <= bucket_start <= to`, ascending by `bucket_start`.
    fn query_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError>;

    /// Most recent `n` bars, ascending by `bucket_start`.
    fn latest_bars(&self, symbol: &str, interval: Interval, n: usize)
    -> Result<Vec<Bar>, StoreError>;

    /// Fetch the bar for one exact bucket, if stored.
    fn get_bar(
        &self,
        symbol: &str,
        interval: Interval,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<Bar>, StoreError> {
        self.query_bars(symbol, interval, bucket_start, bucket_start)
            .map(|bars| bars.into_iter().next())
    }
}

impl std::fmt::Debug for dyn SeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SeriesStore")
    }
}

impl<S> SeriesStore for Arc<S>
where
    S: SeriesStore + ?Sized,
{
    fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        S::upsert_bar(self, bar)
    }

    fn query_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError> {
        S::query_bars(self, symbol, interval, from, to)
    }

    fn latest_bars(
        &self,
        symbol: &str,
        interval: Interval,
        n: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        S::latest_bars(self, symbol, interval, n)
    }
}
