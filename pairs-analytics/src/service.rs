use crate::{
    aggregator::{BarAggregator, SymbolHealth},
    analytics::{
        AnalyticsEngine, AnalyticsSnapshot, CorrelationMatrix, PairKey, SymbolStats,
        correlation::correlation_matrix, stats::symbol_stats,
    },
    bar::Bar,
    cache::SnapshotCache,
    config::EngineConfig,
    error::AnalyticsError,
    interval::Interval,
    normalizer::Tick,
    store::SeriesStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

/// Point in time view of ingestion and persistence health.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub symbols: Vec<SymbolHealth>,
    /// Bars waiting in the write retry buffer.
    pub pending_bars: usize,
    /// Bars dropped after exhausting the write retry budget.
    pub dropped_bars: u64,
    /// Malformed upstream events rejected by the normalizer.
    pub rejected_events: u64,
    pub late_corrected: u64,
    pub late_dropped: u64,
    /// Late ticks parked until the store can serve the bar they correct.
    pub deferred_late_ticks: usize,
    pub cached_snapshots: usize,
}

impl HealthReport {
    /// True if every symbol has ticked recently and no bar or late tick is waiting on the
    /// store.
    pub fn is_healthy(&self) -> bool {
        self.pending_bars == 0
            && self.deferred_late_ticks == 0
            && self.symbols.iter().all(|symbol| symbol.has_recent_ticks)
    }
}

/// Facade wiring the aggregator, series store, analytics engine and snapshot cache.
#[derive(Debug)]
pub struct PairsService {
    config: Arc<EngineConfig>,
    store: Arc<dyn SeriesStore>,
    aggregator: Arc<BarAggregator>,
    engine: AnalyticsEngine,
    cache: SnapshotCache,
    rejected_events: AtomicU64,
}

impl PairsService {
    pub fn new(config: EngineConfig, store: Arc<dyn SeriesStore>) -> Self {
        let config = Arc::new(config);
        Self {
            aggregator: Arc::new(BarAggregator::new(Arc::clone(&store), &config)),
            engine: AnalyticsEngine::new(Arc::clone(&config)),
            cache: SnapshotCache::new(config.compute_timeout()),
            store,
            config,
            rejected_events: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SeriesStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<BarAggregator> {
        &self.aggregator
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Feed one normalised [`Tick`] to the aggregator, returning the bars it sealed.
    pub fn on_tick(&self, tick: &Tick) -> Vec<Bar> {
        self.aggregator.on_tick(tick)
    }

    /// Count an upstream event the normalizer rejected.
    pub fn record_rejected(&self, error: &AnalyticsError) {
        self.rejected_events.fetch_add(1, Ordering::Relaxed);
        debug!(%error, "rejected upstream event");
    }

    pub fn rejected_events(&self) -> u64 {
        self.rejected_events.load(Ordering::Relaxed)
    }

    /// Retry bars the store previously refused, then late ticks deferred while it was
    /// unavailable. Returns how many bars were persisted or corrected.
    ///
    /// Performs blocking store I/O.
    pub fn retry_pending_writes(&self) -> usize {
        let written = self.aggregator.writer().retry_pending();
        written + self.aggregator.retry_deferred().len()
    }

    /// Seal and persist every open bar, eg/ on shutdown.
    pub fn flush(&self) -> Vec<Bar> {
        self.aggregator.flush_all()
    }

    /// Analytics snapshot of `symbol_y` regressed on `symbol_x` over the latest
    /// `window_len` bars (`0` uses the configured default window).
    ///
    /// Served from the cache while fresh. Otherwise a single computation per key runs on
    /// the blocking pool and every concurrent caller awaits its result.
    pub async fn snapshot(
        &self,
        symbol_x: &str,
        symbol_y: &str,
        interval: Interval,
        window_len: usize,
    ) -> Result<Arc<AnalyticsSnapshot>, AnalyticsError> {
        let key = PairKey::new(
            normalise_symbol(symbol_x),
            normalise_symbol(symbol_y),
            interval,
            self.window_len(window_len),
        );
        let ttl = self.config.cache_ttl(interval);

        let engine = self.engine.clone();
        let store = Arc::clone(&self.store);
        let task_key = key.clone();

        let result = self
            .cache
            .get_or_compute(key.clone(), ttl, move || async move {
                tokio::task::spawn_blocking(move || {
                    engine.compute_from_store(store.as_ref(), &task_key, Utc::now())
                })
                .await
                .map_err(|error| {
                    AnalyticsError::ComputeFailed(format!("analytics task failed: {error}"))
                })?
            })
            .await;

        if let Err(error) = &result {
            if error.is_not_ready() {
                debug!(pair = %key, %error, "snapshot not ready");
            } else {
                warn!(pair = %key, %error, "snapshot failed");
            }
        }
        result
    }

    /// Descriptive statistics of one symbol over its latest `window_len` bars (`0` uses the
    /// configured default window).
    pub async fn symbol_stats(
        &self,
        symbol: &str,
        interval: Interval,
        window_len: usize,
    ) -> Result<SymbolStats, AnalyticsError> {
        let symbol = normalise_symbol(symbol);
        let window_len = self.window_len(window_len);
        let min_points = self.config.min_stats_points;
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || -> Result<SymbolStats, AnalyticsError> {
            let bars = store.latest_bars(&symbol, interval, window_len)?;
            symbol_stats(&bars, min_points)
        })
        .await
        .map_err(|error| AnalyticsError::ComputeFailed(format!("stats task failed: {error}")))?
    }

    /// Pairwise return correlation of `symbols` over their latest `window_len` bars.
    pub async fn correlation_matrix(
        &self,
        symbols: &[&str],
        interval: Interval,
        window_len: usize,
    ) -> Result<CorrelationMatrix, AnalyticsError> {
        let symbols = symbols
            .iter()
            .map(|symbol| normalise_symbol(symbol))
            .collect::<Vec<_>>();
        let window_len = self.window_len(window_len);
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || -> Result<CorrelationMatrix, AnalyticsError> {
            let series = symbols
                .into_iter()
                .map(|symbol| -> Result<(SmolStr, Vec<Bar>), AnalyticsError> {
                    let bars = store.latest_bars(&symbol, interval, window_len)?;
                    Ok((symbol, bars))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(correlation_matrix(interval, window_len, &series))
        })
        .await
        .map_err(|error| {
            AnalyticsError::ComputeFailed(format!("correlation task failed: {error}"))
        })?
    }

    /// Current [`HealthReport`].
    pub fn health(&self) -> HealthReport {
        let now = Utc::now();
        HealthReport {
            generated_at: now,
            symbols: self
                .aggregator
                .symbol_health(now, self.config.health_stale_after()),
            pending_bars: self.aggregator.writer().pending_len(),
            dropped_bars: self.aggregator.writer().dropped(),
            rejected_events: self.rejected_events(),
            late_corrected: self.aggregator.late_corrected(),
            late_dropped: self.aggregator.late_dropped(),
            deferred_late_ticks: self.aggregator.deferred_len(),
            cached_snapshots: self.cache.len(),
        }
    }

    fn window_len(&self, window_len: usize) -> usize {
        if window_len == 0 {
            self.config.default_window
        } else {
            window_len
        }
    }
}

fn normalise_symbol(symbol: &str) -> SmolStr {
    SmolStr::new(symbol.trim().to_ascii_uppercase())
}
