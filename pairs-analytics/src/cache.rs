//! Single-flight TTL cache of computed results.

use crate::{
    analytics::{AnalyticsSnapshot, PairKey},
    error::AnalyticsError,
};
use fnv::FnvHashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// [`ResultCache`] of analytics snapshots.
pub type SnapshotCache = ResultCache<PairKey, AnalyticsSnapshot>;

type SharedResult<V> = Shared<BoxFuture<'static, Result<Arc<V>, AnalyticsError>>>;

#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    computed_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.computed_at) <= self.ttl
    }
}

struct InFlight<V> {
    id: u64,
    result: SharedResult<V>,
}

struct Slot<V> {
    ready: Option<CacheEntry<V>>,
    in_flight: Option<InFlight<V>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            ready: None,
            in_flight: None,
        }
    }
}

type Slots<K, V> = Arc<Mutex<FnvHashMap<K, Slot<V>>>>;

/// Memoises the result of an expensive computation per key for a TTL.
///
/// At most one computation per key runs at a time: concurrent callers for a missing or
/// stale key await the same in-flight result, each bounded by `compute_timeout`. The
/// computation runs on its own task, so it completes (and populates the cache) even when
/// every caller has given up. Errors are handed to every waiter but never cached, and a
/// failed recomputation leaves the previous value in place.
pub struct ResultCache<K, V> {
    slots: Slots<K, V>,
    compute_timeout: Duration,
    next_id: AtomicU64,
    computations: AtomicU64,
}

impl<K, V> std::fmt::Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("compute_timeout", &self.compute_timeout)
            .field("computations", &self.computations.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Clone + Eq + Hash + Display + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(compute_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(FnvHashMap::default())),
            compute_timeout,
            next_id: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key` if fresh, else compute it (or join the in-flight
    /// computation) and cache a successful result for `ttl`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: K,
        ttl: Duration,
        compute: F,
    ) -> Result<Arc<V>, AnalyticsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AnalyticsError>> + Send + 'static,
    {
        let result = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_default();

            let now = Instant::now();
            if let Some(entry) = slot.ready.as_ref().filter(|entry| entry.is_fresh(now)) {
                return Ok(Arc::clone(&entry.value));
            }

            match &slot.in_flight {
                Some(in_flight) => {
                    debug!(%key, "joining in-flight computation");
                    in_flight.result.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let result = self.spawn_computation(key.clone(), id, ttl, compute());
                    slot.in_flight = Some(InFlight {
                        id,
                        result: result.clone(),
                    });
                    result
                }
            }
        };

        match tokio::time::timeout(self.compute_timeout, result).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%key, timeout = ?self.compute_timeout, "timed out waiting for computation");
                let timeout_ms = u64::try_from(self.compute_timeout.as_millis()).unwrap_or(u64::MAX);
                Err(AnalyticsError::ComputeTimeout { timeout_ms })
            }
        }
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slots = self.slots.lock();
        slots
            .get(key)?
            .ready
            .as_ref()
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Forget the cached value and any in-flight computation for `key`.
    pub fn invalidate(&self, key: &K) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// Number of keys holding a cached value, fresh or stale.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.ready.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total computations started since creation.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    fn spawn_computation<Fut>(
        &self,
        key: K,
        id: u64,
        ttl: Duration,
        future: Fut,
    ) -> SharedResult<V>
    where
        Fut: Future<Output = Result<V, AnalyticsError>> + Send + 'static,
    {
        self.computations.fetch_add(1, Ordering::Relaxed);

        let slots = Arc::clone(&self.slots);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = future.await.map(Arc::new);

            let mut slots = slots.lock();
            if let Some(slot) = slots.get_mut(&task_key) {
                if slot.in_flight.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                    slot.in_flight = None;
                    match &result {
                        Ok(value) => {
                            slot.ready = Some(CacheEntry {
                                value: Arc::clone(value),
                                computed_at: Instant::now(),
                                ttl,
                            })
                        }
                        Err(error) => {
                            debug!(key = %task_key, %error, "computation failed, nothing cached")
                        }
                    }
                }
            }
            result
        });

        let slots = Arc::clone(&self.slots);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(error) => {
                    // Computation task panicked or was cancelled before clearing its slot
                    let mut slots = slots.lock();
                    if let Some(slot) = slots.get_mut(&key) {
                        if slot.in_flight.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                            slot.in_flight = None;
                        }
                    }
                    Err(AnalyticsError::ComputeFailed(format!(
                        "computation for {key} aborted: {error}"
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache(timeout: Duration) -> Arc<ResultCache<&'static str, u64>> {
        Arc::new(ResultCache::new(timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = cache(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute("BTC/ETH", Duration::from_secs(10), move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(42)
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();

        let mut values = Vec::new();
        for waiter in waiters {
            values.push(waiter.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.computations(), 1);
        assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
        assert_eq!(*values[0], 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_stale_recompute() {
        let cache = cache(Duration::from_secs(5));
        let ttl = Duration::from_secs(10);

        let first = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(1) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let waiters = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute("BTC/ETH", ttl, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(2)
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();

        let mut values = Vec::new();
        for waiter in waiters {
            values.push(waiter.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.computations(), 2);
        assert!(values.iter().all(|value| **value == 2));
        assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
        assert!(!Arc::ptr_eq(&first, &values[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_and_stale_recompute() {
        let cache = cache(Duration::from_secs(5));
        let ttl = Duration::from_secs(10);

        let first = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(1) })
            .await
            .unwrap();
        let hit = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(2) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &hit));
        assert_eq!(cache.computations(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&"BTC/ETH").is_none());

        let recomputed = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(*recomputed, 2);
        assert_eq!(cache.computations(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_cached() {
        let cache = cache(Duration::from_secs(5));
        let ttl = Duration::from_secs(10);

        let actual = cache
            .get_or_compute("BTC/ETH", ttl, || async {
                Err(AnalyticsError::DegenerateInput("zero variance".to_string()))
            })
            .await;
        assert!(matches!(actual, Err(AnalyticsError::DegenerateInput(_))));
        assert!(cache.is_empty());

        let recovered = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(*recovered, 7);
        assert_eq!(cache.computations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recompute_keeps_previous_value() {
        let cache = cache(Duration::from_secs(5));
        let ttl = Duration::from_secs(10);

        cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(1) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let actual = cache
            .get_or_compute("BTC/ETH", ttl, || async {
                Err(AnalyticsError::insufficient("alignment", 10, 3))
            })
            .await;
        assert_eq!(actual, Err(AnalyticsError::insufficient("alignment", 10, 3)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_abandon_computation() {
        let cache = cache(Duration::from_millis(50));
        let ttl = Duration::from_secs(60);

        let actual = cache
            .get_or_compute("BTC/ETH", ttl, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(9)
            })
            .await;
        assert_eq!(actual, Err(AnalyticsError::ComputeTimeout { timeout_ms: 50 }));
        assert!(cache.get(&"BTC/ETH").is_none());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"BTC/ETH").as_deref(), Some(&9));
        assert_eq!(cache.computations(), 1);
    }

    #[tokio::test]
    async fn test_panicked_computation_is_compute_failed() {
        let cache = cache(Duration::from_secs(5));
        let ttl = Duration::from_secs(10);

        let actual = cache
            .get_or_compute("BTC/ETH", ttl, move || async move {
                if ttl > Duration::ZERO {
                    panic!("analytics task panicked");
                }
                Ok(1)
            })
            .await;
        assert!(matches!(actual, Err(AnalyticsError::ComputeFailed(_))));
        assert!(!actual.unwrap_err().is_not_ready());

        // Slot is released, next caller starts a fresh computation
        let recovered = cache
            .get_or_compute("BTC/ETH", ttl, || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(*recovered, 3);
        assert_eq!(cache.computations(), 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = cache(Duration::from_secs(5));
        cache
            .get_or_compute("BTC/ETH", Duration::from_secs(10), || async { Ok(1) })
            .await
            .unwrap();

        assert!(cache.invalidate(&"BTC/ETH"));
        assert!(cache.get(&"BTC/ETH").is_none());
        assert!(!cache.invalidate(&"BTC/ETH"));
    }
}
