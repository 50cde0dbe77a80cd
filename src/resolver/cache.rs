//! Expiring storage shared by the caching handlers.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tokio::time::Instant;

use crate::utils::config::DefMinMax;

/// Configuration limit for the maximum number of entries in a cache.
const MAX_ENTRIES: DefMinMax<u64> = DefMinMax::new(10_000, 1, 1_000_000_000);

/// Limit on the time a cached result is considered valid.
///
/// Results carry their own time to death. This only caps what the
/// directory service hands out.
const MAX_TTD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(3600),
    Duration::from_secs(1),
    Duration::from_secs(7 * 24 * 3600),
);

/// How old a cached result must be before a lookup may bypass it.
///
/// Lookups that skip the cache are still served from it if the result
/// was fetched more recently than this.
const MIN_BYPASS_TIME: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::ZERO,
    Duration::from_secs(60),
);

//------------ Config ---------------------------------------------------------

/// Configuration of a caching handler.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of cache entries.
    max_entries: u64,

    /// Maximum validity of a result.
    max_ttd: Duration,

    /// Minimum age of a result before a bypassing lookup refetches it.
    min_bypass_time: Duration,
}

impl Config {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the maximum number of cache entries.
    ///
    /// The value has to be at least one, at most 1,000,000,000 and the
    /// default is 10,000.
    pub fn set_max_entries(&mut self, value: u64) {
        self.max_entries = MAX_ENTRIES.limit(value)
    }

    /// Returns the maximum number of cache entries.
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Set the maximum validity of cached results.
    ///
    /// The value has to be at least one second, at most one week and the
    /// default is one hour.
    pub fn set_max_ttd(&mut self, value: Duration) {
        self.max_ttd = MAX_TTD.limit(value)
    }

    /// Returns the maximum validity of cached results.
    pub fn max_ttd(&self) -> Duration {
        self.max_ttd
    }

    /// Set how old a result must be before a bypassing lookup refetches it.
    ///
    /// The value has to be at most 60 seconds and the default is one
    /// second.
    pub fn set_min_bypass_time(&mut self, value: Duration) {
        self.min_bypass_time = MIN_BYPASS_TIME.limit(value)
    }

    /// Returns the minimum age for bypassing.
    pub fn min_bypass_time(&self) -> Duration {
        self.min_bypass_time
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: MAX_ENTRIES.default(),
            max_ttd: MAX_TTD.default(),
            min_bypass_time: MIN_BYPASS_TIME.default(),
        }
    }
}

//------------ Timed ----------------------------------------------------------

/// A cached value with its validity.
#[derive(Debug)]
pub struct Timed<V> {
    /// The cached value.
    pub value: V,

    /// When the value stops being valid.
    pub expires: Instant,

    /// When the value was received.
    pub fetched: Instant,
}

impl<V> Timed<V> {
    /// Returns whether the value is still valid at `now`.
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires
    }
}

//------------ ExpiringCache --------------------------------------------------

/// A size bounded cache of values with an absolute expiration time.
///
/// When full, the least recently used value is evicted. Expired values are
/// dropped when they are read.
pub struct ExpiringCache<K, V> {
    cache: Cache<K, Arc<Timed<V>>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_entries` values.
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: lru_cache(max_entries),
        }
    }

    /// Returns the value for `key` if it is still valid at `now`.
    pub fn get(&self, key: &K, now: Instant) -> Option<Arc<Timed<V>>> {
        let value = self.cache.get(key)?;
        if value.is_valid(now) {
            Some(value)
        } else {
            self.cache.invalidate(key);
            None
        }
    }

    /// Stores a value fetched at `now` until `expires`.
    pub fn insert(&self, key: K, value: V, expires: Instant, now: Instant) {
        self.cache.insert(
            key,
            Arc::new(Timed {
                value,
                expires,
                fetched: now,
            }),
        )
    }

    /// Replaces a value while keeping when it was fetched.
    pub fn replace(&self, key: K, value: V, expires: Instant, old: &Timed<V>) {
        self.insert(key, value, expires, old.fetched)
    }

    /// Removes the value for `key`.
    pub fn remove(&self, key: &K) {
        self.cache.invalidate(key)
    }

    /// Returns all keys with a value valid at `now`.
    pub fn keys(&self, now: Instant) -> Vec<Arc<K>> {
        self.cache
            .iter()
            .filter(|(_, value)| value.is_valid(now))
            .map(|(key, _)| key)
            .collect()
    }
}

//------------ Helper Functions ----------------------------------------------

/// Creates a cache evicting the least recently used entry.
pub fn lru_cache<K, V>(max_entries: u64) -> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(max_entries)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let cache = ExpiringCache::new(10);
        let now = Instant::now();
        cache.insert("a", 1, now + Duration::from_secs(5), now);
        assert_eq!(cache.get(&"a", now).map(|t| t.value), Some(1));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get(&"a", Instant::now()).is_none());
    }

    #[test]
    fn config_limits() {
        let mut config = Config::new();
        config.set_max_entries(0);
        assert_eq!(config.max_entries(), 1);
        config.set_max_ttd(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.max_ttd(), Duration::from_secs(7 * 24 * 3600));
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_is_evicted() {
        let cache = ExpiringCache::new(2);
        let now = Instant::now();
        let expires = now + Duration::from_secs(60);
        cache.insert("a", 1, expires, now);
        cache.insert("b", 2, expires, now);
        cache.cache.run_pending_tasks();
        for _ in 0..20 {
            assert!(cache.get(&"a", now).is_some());
        }
        cache.cache.run_pending_tasks();

        cache.insert("c", 3, expires, now);
        cache.cache.run_pending_tasks();
        assert_eq!(cache.get(&"c", now).map(|t| t.value), Some(3));
        assert_eq!(cache.get(&"a", now).map(|t| t.value), Some(1));
        assert!(cache.get(&"b", now).is_none());
    }
}
