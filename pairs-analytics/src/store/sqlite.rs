use crate::{bar::Bar, error::StoreError, interval::Interval, store::SeriesStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};
use smol_str::SmolStr;
use std::path::Path;
use tracing::info;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bars (
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        bucket_start INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        trade_count INTEGER NOT NULL,
        PRIMARY KEY (symbol, interval, bucket_start)
    );
";

const UPSERT: &str = "
    INSERT INTO bars (symbol, interval, bucket_start, open, high, low, close, volume, trade_count)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT (symbol, interval, bucket_start) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        trade_count = excluded.trade_count
";

/// [`SeriesStore`] backed by a single SQLite database.
///
/// Bucket starts are stored as Unix milliseconds. The connection is shared behind a mutex,
/// so every statement is short and never held across an `.await`.
#[derive(Debug)]
pub struct SqliteSeriesStore {
    conn: Mutex<Connection>,
}

impl SqliteSeriesStore {
    /// Open (or create) the database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {error}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        let journal_mode =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), %journal_mode, "SeriesStore SQLite database initialised");
        Ok(store)
    }

    /// Volatile database, used in tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SeriesStore for SqliteSeriesStore {
    fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare_cached(UPSERT)?;
        statement.execute(params![
            bar.symbol.as_str(),
            bar.interval.to_string(),
            bar.bucket_start.timestamp_millis(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.trade_count as i64,
        ])?;
        Ok(())
    }

    fn query_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare_cached(
            "SELECT symbol, interval, bucket_start, open, high, low, close, volume, trade_count
             FROM bars
             WHERE symbol = ?1 AND interval = ?2 AND bucket_start >= ?3 AND bucket_start <= ?4
             ORDER BY bucket_start ASC",
        )?;

        let rows = statement.query_map(
            params![
                symbol,
                interval.to_string(),
                from.timestamp_millis(),
                to.timestamp_millis()
            ],
            RawBarRow::from_row,
        )?;

        rows.map(|row| row.map_err(StoreError::from).and_then(RawBarRow::into_bar))
            .collect()
    }

    fn latest_bars(
        &self,
        symbol: &str,
        interval: Interval,
        n: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare_cached(
            "SELECT symbol, interval, bucket_start, open, high, low, close, volume, trade_count
             FROM bars
             WHERE symbol = ?1 AND interval = ?2
             ORDER BY bucket_start DESC
             LIMIT ?3",
        )?;

        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = statement.query_map(
            params![symbol, interval.to_string(), limit],
            RawBarRow::from_row,
        )?;

        let mut bars = rows
            .map(|row| row.map_err(StoreError::from).and_then(RawBarRow::into_bar))
            .collect::<Result<Vec<_>, _>>()?;
        bars.reverse();
        Ok(bars)
    }
}

/// Row as read from SQLite, before domain validation.
struct RawBarRow {
    symbol: String,
    interval: String,
    bucket_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: i64,
}

impl RawBarRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            interval: row.get(1)?,
            bucket_start: row.get(2)?,
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            trade_count: row.get(8)?,
        })
    }

    fn into_bar(self) -> Result<Bar, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
            reason,
        };

        let interval = self
            .interval
            .parse::<Interval>()
            .map_err(|error| corrupt(error.to_string()))?;
        let bucket_start = DateTime::from_timestamp_millis(self.bucket_start)
            .ok_or_else(|| corrupt(format!("bucket_start out of range: {}", self.bucket_start)))?;
        let trade_count = u64::try_from(self.trade_count)
            .map_err(|_| corrupt(format!("negative trade_count: {}", self.trade_count)))?;

        Ok(Bar {
            symbol: SmolStr::new(&self.symbol),
            interval,
            bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count,
        })
    }
}
