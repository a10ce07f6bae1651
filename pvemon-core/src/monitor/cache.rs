//! TTL cache with per-entry jitter.
//!
//! Each entry gets its own deadline, rolled once when it is written:
//! `stored_at + ttl + uniform(-jitter, +jitter)`. Spreading the deadlines
//! keeps every VM from hitting `qm monitor` in the same scrape. Expiry is
//! checked lazily on read; nothing sweeps the map.
//!
//! The lock only guards map access. Computation runs unlocked, so two
//! concurrent misses on one key both compute and the last write wins.

use super::{MonitorCommand, VmId};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Cache key for monitor output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub vmid: VmId,
    pub command: MonitorCommand,
}

impl CacheKey {
    pub fn new(vmid: VmId, command: MonitorCommand) -> Self {
        Self { vmid, command }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl_deadline: Instant,
}

pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    jitter: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, jitter: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, jitter }
    }

    /// Roll a lifetime in `[ttl - jitter, ttl + jitter]`, never below zero.
    pub fn roll_ttl(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.ttl;
        }
        let jitter = self.jitter.as_secs_f64();
        let offset = rand::rng().random_range(-jitter..=jitter);
        Duration::from_secs_f64((self.ttl.as_secs_f64() + offset).max(0.0))
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| Instant::now() < entry.ttl_deadline)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let stored_at = Instant::now();
        let ttl_deadline = stored_at + self.roll_ttl();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, CacheEntry { value, stored_at, ttl_deadline });
    }

    /// Return the cached value or compute, store and return a new one.
    ///
    /// Errors from `compute` are passed through and never stored.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Time left before `key` expires. `None` if absent or already stale.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        debug_assert!(entry.stored_at <= entry.ttl_deadline);
        entry.ttl_deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(vmid: &str) -> CacheKey {
        CacheKey::new(VmId::from(vmid), MonitorCommand::InfoBlock)
    }

    async fn counted(calls: &AtomicUsize) -> Result<usize, String> {
        Ok(calls.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_lower_bound_skips_compute() {
        let cache = TtlCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first = cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();
        tokio::time::advance(Duration::from_secs(539)).await;
        let second = cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_recomputed() {
        let cache = TtlCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();
        tokio::time::advance(Duration::from_secs(661)).await;
        assert!(cache.get(&key("100")).is_none());
        let value = cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_miss() {
        let cache = TtlCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();
        cache.get_or_compute(key("101"), || counted(&calls)).await.unwrap();
        cache.invalidate(&key("100"));
        cache.get_or_compute(key("100"), || counted(&calls)).await.unwrap();
        cache.get_or_compute(key("101"), || counted(&calls)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: TtlCache<CacheKey, usize> =
            TtlCache::new(Duration::from_secs(600), Duration::ZERO);

        let err = cache.get_or_compute(key("100"), || async { Err::<usize, _>("boom") }).await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok = cache.get_or_compute(key("100"), || async { Ok::<_, &str>(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[test]
    fn test_jitter_is_uniform_within_bounds() {
        let cache: TtlCache<CacheKey, ()> =
            TtlCache::new(Duration::from_secs(600), Duration::from_secs(60));
        let samples = 20_000;
        let mut buckets = [0usize; 4];
        let mut sum = 0.0;

        for _ in 0..samples {
            let ttl = cache.roll_ttl().as_secs_f64();
            assert!((540.0..=660.0).contains(&ttl), "ttl {} out of bounds", ttl);
            sum += ttl;
            let bucket = (((ttl - 540.0) / 30.0) as usize).min(3);
            buckets[bucket] += 1;
        }

        let mean = sum / samples as f64;
        assert!((mean - 600.0).abs() < 2.0, "mean {} too far from 600", mean);
        for count in buckets {
            let share = count as f64 / samples as f64;
            assert!((0.22..=0.28).contains(&share), "bucket share {} not uniform", share);
        }
    }

    #[test]
    fn test_jitter_never_goes_negative() {
        let cache: TtlCache<CacheKey, ()> =
            TtlCache::new(Duration::from_secs(1), Duration::from_secs(1));
        for _ in 0..1_000 {
            assert!(cache.roll_ttl() <= Duration::from_secs(2));
        }
    }
}
