#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Pairs Analytics
//! Streaming tick to bar aggregation and rolling statistical-arbitrage analytics for pairs of
//! correlated instruments.
//!
//! Raw upstream trade events are normalised into [`Tick`]s, aggregated into OHLCV [`Bar`]s
//! per `(symbol, interval)` and persisted to a [`SeriesStore`]. On demand, the
//! [`PairsService`] aligns the latest bars of two symbols and computes an
//! [`AnalyticsSnapshot`]: OLS hedge ratio over log returns (sanity gated), spread z-score,
//! ADF stationarity test and rolling correlation. Snapshots are memoised per
//! [`PairKey`] for an interval dependent TTL, with at most one computation in flight per key.
//!
//! ## Example
//! ```rust,no_run
//! use pairs_analytics::{
//!     EngineConfig, PairsService, interval::Interval, store::SqliteSeriesStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = SqliteSeriesStore::open("data/bars.db").expect("failed to open store");
//!     let service = Arc::new(PairsService::new(EngineConfig::from_env(), Arc::new(store)));
//!
//!     // Feed ticks via pairs_analytics::ingest::spawn_ingest, then:
//!     match service.snapshot("BTCUSDT", "ETHUSDT", Interval::M1, 60).await {
//!         Ok(snapshot) => println!("z = {:?}", snapshot.latest_z),
//!         Err(error) if error.is_not_ready() => println!("warming up: {error}"),
//!         Err(error) => eprintln!("{error}"),
//!     }
//! }
//! ```

/// Streaming tick to OHLCV bar aggregation, with late tick correction and a retrying
/// [`BarWriter`](aggregator::writer::BarWriter).
pub mod aggregator;

/// Timestamp alignment of two bar series.
pub mod align;

/// Pure analytics: returns, regression, spread z-score, stationarity and correlation.
pub mod analytics;

/// OHLCV [`Bar`] and [`SeriesKey`](bar::SeriesKey).
pub mod bar;

/// Single-flight TTL [`ResultCache`](cache::ResultCache).
pub mod cache;

/// [`EngineConfig`] and its sub configurations.
pub mod config;

/// All [`Error`](std::error::Error)s generated in `pairs-analytics`.
pub mod error;

/// Per stream ingestion tasks.
pub mod ingest;

/// Bar [`Interval`](interval::Interval)s and bucket arithmetic.
pub mod interval;

/// Raw trade event to [`Tick`] normalisation.
pub mod normalizer;

/// [`PairsService`] facade.
pub mod service;

/// [`SeriesStore`] trait with in-memory and SQLite implementations.
pub mod store;

pub use analytics::{AnalyticsEngine, AnalyticsSnapshot, PairKey};
pub use bar::Bar;
pub use config::EngineConfig;
pub use error::{AnalyticsError, StoreError};
pub use normalizer::Tick;
pub use service::{HealthReport, PairsService};
pub use store::SeriesStore;

