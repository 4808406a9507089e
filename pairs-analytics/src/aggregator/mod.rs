//! Tick to OHLCV bar aggregation.
//!
//! Each `(symbol, interval)` series is an independent state machine held in an arena of
//! individually locked states, so ingestion of one symbol never contends with another.
//! Bucket boundaries are derived from tick (exchange) timestamps, never the wall clock.

use crate::{
    bar::{Bar, SeriesKey},
    config::{EngineConfig, LatePolicy},
    interval::Interval,
    normalizer::Tick,
    error::StoreError,
    store::SeriesStore,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    cmp::Ordering as CmpOrdering,
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Persistence of sealed bars with a bounded retry buffer.
pub mod writer;

pub use writer::BarWriter;

/// Bar plus the first and last tick times seen for its bucket.
///
/// `open` follows the earliest tick and `close` the latest, so a tick arriving out of order
/// within a bucket cannot overwrite `close` with a stale price.
#[derive(Debug, Clone)]
struct TrackedBar {
    bar: Bar,
    first_tick: DateTime<Utc>,
    last_tick: DateTime<Utc>,
}

impl TrackedBar {
    fn new(tick: &Tick, interval: Interval) -> Self {
        Self {
            bar: Bar::from_tick(tick, interval),
            first_tick: tick.time,
            last_tick: tick.time,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.bar.absorb(tick.price, tick.size);
        if tick.time < self.first_tick {
            self.first_tick = tick.time;
            self.bar.open = tick.price;
        }
        if tick.time >= self.last_tick {
            self.last_tick = tick.time;
            self.bar.close = tick.price;
        }
    }
}

/// Aggregation state of one series.
#[derive(Debug, Default)]
struct SeriesState {
    open: Option<TrackedBar>,
    /// Recently sealed bars, ascending by `bucket_start`.
    sealed: VecDeque<TrackedBar>,
    /// Late ticks waiting for the store to serve the bar they correct, oldest first.
    deferred: VecDeque<Tick>,
}

impl SeriesState {
    fn push_sealed(&mut self, bar: TrackedBar, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.sealed.len() >= capacity {
            self.sealed.pop_front();
        }
        self.sealed.push_back(bar);
    }

    /// Most recent bucket this series has opened, sealed or not.
    fn latest_bucket(&self) -> Option<DateTime<Utc>> {
        self.open
            .as_ref()
            .or_else(|| self.sealed.back())
            .map(|tracked| tracked.bar.bucket_start)
    }
}

/// Result of applying one tick to one series.
#[derive(Debug)]
enum Transition {
    Accumulated,
    Sealed(Bar),
    Corrected(Bar),
    Deferred,
    Dropped,
}

/// Per-symbol ingestion liveness.
#[derive(Debug)]
struct SymbolActivity {
    ticks: AtomicU64,
    last_received_ms: AtomicI64,
    last_tick_time_ms: AtomicI64,
}

impl Default for SymbolActivity {
    fn default() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            last_received_ms: AtomicI64::new(i64::MIN),
            last_tick_time_ms: AtomicI64::new(i64::MIN),
        }
    }
}

/// Ingestion liveness of one symbol, as reported by [`BarAggregator::symbol_health`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SymbolHealth {
    pub symbol: SmolStr,
    /// Wall clock time the last tick was received.
    pub last_received_at: Option<DateTime<Utc>>,
    /// Exchange timestamp of the last tick.
    pub last_tick_time: Option<DateTime<Utc>>,
    pub ticks_seen: u64,
    pub has_recent_ticks: bool,
}

/// Streaming tick to bar aggregator for every configured [`Interval`].
///
/// Sealed and corrected bars are persisted through a [`BarWriter`] and published on a
/// broadcast channel (see [`BarAggregator::subscribe`]).
#[derive(Debug)]
pub struct BarAggregator {
    intervals: Vec<Interval>,
    late_policy: LatePolicy,
    sealed_history: usize,
    deferred_capacity: usize,
    series: RwLock<FnvHashMap<SeriesKey, Arc<Mutex<SeriesState>>>>,
    activity: RwLock<FnvHashMap<SmolStr, Arc<SymbolActivity>>>,
    store: Arc<dyn SeriesStore>,
    writer: BarWriter,
    bar_tx: broadcast::Sender<Bar>,
    late_corrected: AtomicU64,
    late_dropped: AtomicU64,
    deferred_len: AtomicUsize,
}

impl BarAggregator {
    pub fn new(store: Arc<dyn SeriesStore>, config: &EngineConfig) -> Self {
        let (bar_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            intervals: config.intervals.clone(),
            late_policy: config.late_policy,
            sealed_history: config.sealed_history,
            deferred_capacity: config.deferred_late_ticks,
            series: RwLock::new(FnvHashMap::default()),
            activity: RwLock::new(FnvHashMap::default()),
            writer: BarWriter::new(Arc::clone(&store), config.write_retry),
            store,
            bar_tx,
            late_corrected: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
            deferred_len: AtomicUsize::new(0),
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Subscribe to every bar this aggregator seals or corrects.
    pub fn subscribe(&self) -> broadcast::Receiver<Bar> {
        self.bar_tx.subscribe()
    }

    pub fn writer(&self) -> &BarWriter {
        &self.writer
    }

    /// Apply a [`Tick`] to every configured interval.
    ///
    /// Returns the bars sealed or corrected by this tick, after they were handed to the
    /// [`BarWriter`].
    pub fn on_tick(&self, tick: &Tick) -> Vec<Bar> {
        self.record_activity(tick);

        let mut emitted = Vec::new();
        for &interval in &self.intervals {
            let state = self.series_state(SeriesKey::new(tick.symbol.clone(), interval));

            // Key lock is released before persisting
            let transition = {
                let mut state = state.lock();
                self.apply(&mut state, tick, interval)
            };

            match transition {
                Transition::Accumulated => {}
                Transition::Sealed(bar) => {
                    debug!(
                        series = %bar.key(),
                        bucket_start = %bar.bucket_start,
                        trades = bar.trade_count,
                        "sealed bar"
                    );
                    emitted.push(bar);
                }
                Transition::Corrected(bar) => {
                    self.late_corrected.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        series = %bar.key(),
                        bucket_start = %bar.bucket_start,
                        tick_time = %tick.time,
                        "corrected sealed bar with late tick"
                    );
                    emitted.push(bar);
                }
                Transition::Deferred => {
                    self.deferred_len.fetch_add(1, Ordering::Relaxed);
                }
                Transition::Dropped => {
                    self.late_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for bar in &emitted {
            self.publish(bar.clone());
        }
        emitted
    }

    /// Seal every open bar with whatever data it has, eg/ on shutdown.
    pub fn flush_all(&self) -> Vec<Bar> {
        let states = self
            .series
            .read()
            .values()
            .map(Arc::clone)
            .collect::<Vec<_>>();

        let mut flushed = states
            .into_iter()
            .filter_map(|state| {
                let mut state = state.lock();
                let open = state.open.take()?;
                let bar = open.bar.clone();
                state.push_sealed(open, self.sealed_history);
                Some(bar)
            })
            .collect::<Vec<_>>();
        flushed.sort_by(|a, b| a.key().cmp(&b.key()));

        for bar in &flushed {
            self.publish(bar.clone());
        }
        flushed
    }

    /// Re-apply late ticks parked while the store was unavailable, oldest first per series.
    ///
    /// Each correction is persisted before the next one reads its bar, so several deferred
    /// ticks for one bucket accumulate. A series stops at its first tick the store still
    /// cannot serve. Returns the corrected bars.
    pub fn retry_deferred(&self) -> Vec<Bar> {
        if self.deferred_len() == 0 {
            return Vec::new();
        }

        let states = self
            .series
            .read()
            .iter()
            .map(|(key, state)| (key.interval, Arc::clone(state)))
            .collect::<Vec<_>>();

        let mut corrected = Vec::new();
        for (interval, state) in states {
            let mut state = state.lock();
            while let Some(tick) = state.deferred.pop_front() {
                let bucket = interval.bucket_start(tick.time);
                match self.correct_persisted(&tick, interval, bucket) {
                    Ok(bar) => {
                        self.deferred_len.fetch_sub(1, Ordering::Relaxed);
                        self.late_corrected.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            series = %bar.key(),
                            bucket_start = %bar.bucket_start,
                            tick_time = %tick.time,
                            "applied deferred late tick"
                        );
                        self.publish(bar.clone());
                        corrected.push(bar);
                    }
                    Err(error) => {
                        debug!(
                            symbol = %tick.symbol,
                            %interval,
                            %error,
                            "store still unavailable for deferred late ticks"
                        );
                        state.deferred.push_front(tick);
                        break;
                    }
                }
            }
        }
        corrected
    }

    /// Late ticks currently parked waiting for the store.
    pub fn deferred_len(&self) -> usize {
        self.deferred_len.load(Ordering::Relaxed)
    }

    /// Snapshot of the currently open bar of a series.
    pub fn open_bar(&self, symbol: &str, interval: Interval) -> Option<Bar> {
        let key = SeriesKey::new(SmolStr::new(symbol), interval);
        let state = self.series.read().get(&key).map(Arc::clone)?;
        let state = state.lock();
        state.open.as_ref().map(|tracked| tracked.bar.clone())
    }

    pub fn late_corrected(&self) -> u64 {
        self.late_corrected.load(Ordering::Relaxed)
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    /// Liveness of every symbol seen so far, sorted by symbol.
    pub fn symbol_health(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<SymbolHealth> {
        let stale_after_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);

        let mut health = self
            .activity
            .read()
            .iter()
            .map(|(symbol, activity)| {
                let received_ms = activity.last_received_ms.load(Ordering::Relaxed);
                let tick_time_ms = activity.last_tick_time_ms.load(Ordering::Relaxed);
                let last_received_at = millis_to_time(received_ms);

                SymbolHealth {
                    symbol: symbol.clone(),
                    last_received_at,
                    last_tick_time: millis_to_time(tick_time_ms),
                    ticks_seen: activity.ticks.load(Ordering::Relaxed),
                    has_recent_ticks: last_received_at.is_some()
                        && now.timestamp_millis().saturating_sub(received_ms) <= stale_after_ms,
                }
            })
            .collect::<Vec<_>>();

        health.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        health
    }

    fn series_state(&self, key: SeriesKey) -> Arc<Mutex<SeriesState>> {
        if let Some(state) = self.series.read().get(&key) {
            return Arc::clone(state);
        }
        Arc::clone(self.series.write().entry(key).or_default())
    }

    fn record_activity(&self, tick: &Tick) {
        let existing = self.activity.read().get(&tick.symbol).map(Arc::clone);
        let activity = match existing {
            Some(activity) => activity,
            None => Arc::clone(self.activity.write().entry(tick.symbol.clone()).or_default()),
        };

        activity.ticks.fetch_add(1, Ordering::Relaxed);
        activity
            .last_received_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        activity
            .last_tick_time_ms
            .fetch_max(tick.time.timestamp_millis(), Ordering::Relaxed);
    }

    fn apply(&self, state: &mut SeriesState, tick: &Tick, interval: Interval) -> Transition {
        let bucket = interval.bucket_start(tick.time);

        let Some(latest) = state.latest_bucket() else {
            state.open = Some(TrackedBar::new(tick, interval));
            return Transition::Accumulated;
        };

        match bucket.cmp(&latest) {
            CmpOrdering::Equal if state.open.is_some() => {
                if let Some(open) = state.open.as_mut() {
                    open.absorb(tick);
                }
                Transition::Accumulated
            }
            CmpOrdering::Greater => match state.open.replace(TrackedBar::new(tick, interval)) {
                Some(sealed) => {
                    let bar = sealed.bar.clone();
                    state.push_sealed(sealed, self.sealed_history);
                    Transition::Sealed(bar)
                }
                None => Transition::Accumulated,
            },
            // Earlier bucket, or the bucket of a bar already sealed by a flush
            _ => self.apply_late(state, tick, interval, bucket),
        }
    }

    fn apply_late(
        &self,
        state: &mut SeriesState,
        tick: &Tick,
        interval: Interval,
        bucket: DateTime<Utc>,
    ) -> Transition {
        if self.late_policy == LatePolicy::Drop {
            debug!(symbol = %tick.symbol, %interval, tick_time = %tick.time, "dropped late tick");
            return Transition::Dropped;
        }

        if let Some(sealed) = state
            .sealed
            .iter_mut()
            .find(|sealed| sealed.bar.bucket_start == bucket)
        {
            sealed.absorb(tick);
            return Transition::Corrected(sealed.bar.clone());
        }

        // Earlier deferred ticks of this series go first
        if !state.deferred.is_empty() {
            return self.defer(state, tick, interval, None);
        }

        match self.correct_persisted(tick, interval, bucket) {
            Ok(bar) => Transition::Corrected(bar),
            Err(error) => self.defer(state, tick, interval, Some(error)),
        }
    }

    /// Correct a bar that has left the in-memory history. Its tick times are unknown so
    /// only extremes, volume and trade count change.
    fn correct_persisted(
        &self,
        tick: &Tick,
        interval: Interval,
        bucket: DateTime<Utc>,
    ) -> Result<Bar, StoreError> {
        let persisted = match self.writer.pending_bar(&tick.symbol, interval, bucket) {
            Some(bar) => Some(bar),
            None => self.store.get_bar(&tick.symbol, interval, bucket)?,
        };

        Ok(match persisted {
            Some(mut bar) => {
                bar.absorb(tick.price, tick.size);
                bar
            }
            None => Bar::from_tick(tick, interval),
        })
    }

    fn defer(
        &self,
        state: &mut SeriesState,
        tick: &Tick,
        interval: Interval,
        error: Option<StoreError>,
    ) -> Transition {
        if state.deferred.len() >= self.deferred_capacity {
            warn!(
                symbol = %tick.symbol,
                %interval,
                tick_time = %tick.time,
                deferred = state.deferred.len(),
                "deferred late tick buffer full, dropping tick"
            );
            return Transition::Dropped;
        }

        if let Some(error) = error {
            warn!(
                symbol = %tick.symbol,
                %interval,
                tick_time = %tick.time,
                %error,
                "failed to load sealed bar for late tick correction, deferring tick"
            );
        }
        state.deferred.push_back(tick.clone());
        Transition::Deferred
    }

    fn publish(&self, bar: Bar) {
        self.writer.write(bar.clone());
        // No subscribers is not an error
        let _ = self.bar_tx.send(bar);
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == i64::MIN {
        None
    } else {
        DateTime::from_timestamp_millis(millis)
    }
}
