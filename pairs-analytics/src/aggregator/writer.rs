use crate::{bar::Bar, config::WriteRetryConfig, interval::Interval, store::SeriesStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use tracing::{debug, warn};

/// Bar awaiting another upsert attempt.
#[derive(Debug, Clone)]
struct PendingBar {
    bar: Bar,
    attempts: u32,
}

/// Persists sealed and corrected bars to a [`SeriesStore`].
///
/// Failed upserts are parked in a bounded FIFO and retried before every new write, oldest
/// first. Store I/O never runs while the buffer lock is held, and a buffered bar stays
/// visible through [`BarWriter::pending_bar`] until the store has accepted it. A bar is dropped (and counted) once it exhausts its attempt budget, or when the
/// buffer is full and a newer failure needs the slot.
#[derive(Debug)]
pub struct BarWriter {
    store: Arc<dyn SeriesStore>,
    config: WriteRetryConfig,
    pending: Mutex<VecDeque<PendingBar>>,
    /// Serialises retry passes.
    retrying: Mutex<()>,
    pending_len: AtomicUsize,
    dropped: AtomicU64,
}

impl BarWriter {
    pub fn new(store: Arc<dyn SeriesStore>, config: WriteRetryConfig) -> Self {
        Self {
            store,
            config,
            pending: Mutex::new(VecDeque::new()),
            retrying: Mutex::new(()),
            pending_len: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Persist `bar`, returning `true` if it reached the store on this call.
    pub fn write(&self, bar: Bar) -> bool {
        if self.pending_len() > 0 {
            self.retry_pending();
        }

        match self.store.upsert_bar(&bar) {
            Ok(()) => {
                if self.pending_len() > 0 {
                    self.discard_superseded(&bar);
                }
                true
            }
            Err(error) => {
                warn!(
                    series = %bar.key(),
                    bucket_start = %bar.bucket_start,
                    %error,
                    "BarWriter failed to upsert bar, buffering for retry"
                );
                self.enqueue(PendingBar { bar, attempts: 1 });
                false
            }
        }
    }

    /// Retry buffered bars oldest first, stopping at the first failure.
    ///
    /// Returns the number of bars that reached the store.
    pub fn retry_pending(&self) -> usize {
        let _retrying = self.retrying.lock();
        let mut flushed = 0;

        loop {
            let Some(next) = self.pending.lock().front().map(|front| front.bar.clone()) else {
                break;
            };

            let result = self.store.upsert_bar(&next);

            let mut pending = self.pending.lock();
            // Front may have been superseded or evicted while unlocked
            let is_front = pending.front().is_some_and(|front| front.bar == next);
            match result {
                Ok(()) => {
                    flushed += 1;
                    if is_front {
                        pending.pop_front();
                    }
                    self.pending_len.store(pending.len(), Ordering::Relaxed);
                }
                Err(error) => {
                    if is_front {
                        if let Some(mut front) = pending.pop_front() {
                            front.attempts += 1;
                            if front.attempts >= self.config.max_attempts {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    series = %front.bar.key(),
                                    bucket_start = %front.bar.bucket_start,
                                    attempts = front.attempts,
                                    %error,
                                    "BarWriter dropped bar after exhausting retry budget"
                                );
                            } else {
                                pending.push_front(front);
                            }
                        }
                    }
                    self.pending_len.store(pending.len(), Ordering::Relaxed);
                    break;
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, remaining = self.pending_len(), "BarWriter flushed buffered bars");
        }
        flushed
    }

    /// Latest buffered version of a bar the store has not accepted yet.
    pub fn pending_bar(
        &self,
        symbol: &str,
        interval: Interval,
        bucket_start: DateTime<Utc>,
    ) -> Option<Bar> {
        if self.pending_len() == 0 {
            return None;
        }
        self.pending
            .lock()
            .iter()
            .rev()
            .find(|buffered| {
                buffered.bar.bucket_start == bucket_start
                    && buffered.bar.interval == interval
                    && buffered.bar.symbol == symbol
            })
            .map(|buffered| buffered.bar.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, entry: PendingBar) {
        let mut pending = self.pending.lock();

        // A newer version of the same bucket replaces any older buffered one
        pending.retain(|buffered| !is_same_bucket(&buffered.bar, &entry.bar));

        if self.config.max_pending == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            while pending.len() >= self.config.max_pending {
                if let Some(oldest) = pending.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        series = %oldest.bar.key(),
                        bucket_start = %oldest.bar.bucket_start,
                        "BarWriter retry buffer full, dropped oldest bar"
                    );
                }
            }
            pending.push_back(entry);
        }

        self.pending_len.store(pending.len(), Ordering::Relaxed);
    }

    fn discard_superseded(&self, written: &Bar) {
        let mut pending = self.pending.lock();
        pending.retain(|buffered| !is_same_bucket(&buffered.bar, written));
        self.pending_len.store(pending.len(), Ordering::Relaxed);
    }
}

fn is_same_bucket(a: &Bar, b: &Bar) -> bool {
    a.bucket_start == b.bucket_start && a.interval == b.interval && a.symbol == b.symbol
}
