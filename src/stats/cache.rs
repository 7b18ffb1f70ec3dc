//! Fingerprint-keyed TTL cache for statistic values.
//!
//! Expiry is lazy: entries carry an absolute `expires_at` and are checked
//! against the injected [`Clock`] on read. There is no background sweep and
//! no single-flight; two callers missing at once both recompute and the last
//! write wins.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{FilterValue, Filters, StatValue};

/// Default number of entries kept by [`MemoryStore`].
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

// -------------------------------------------------------------------------
// Clock
// -------------------------------------------------------------------------

/// Source of the current local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the system clock in the local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually advanced clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_duration(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

fn add_duration(ts: NaiveDateTime, by: Duration) -> NaiveDateTime {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| ts.checked_add_signed(delta))
        .unwrap_or(NaiveDateTime::MAX)
}

// -------------------------------------------------------------------------
// Store
// -------------------------------------------------------------------------

/// Cached value with its absolute expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: StatValue,
    pub expires_at: NaiveDateTime,
}

impl CacheEntry {
    /// Expired once `now` reaches `expires_at`, so a zero TTL never hits.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Key/value store backing the cache.
pub trait CacheStore: Send + Sync {
    fn read(&self, key: &str) -> Option<CacheEntry>;
    fn write(&self, key: &str, entry: CacheEntry);
    fn delete(&self, key: &str);
    fn clear(&self);
}

/// Bounded in-process store; least recently used entries are evicted first.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    evictions: AtomicU64,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped to make room for new ones.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl CacheStore for MemoryStore {
    fn read(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    fn write(&self, key: &str, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        // Only count eviction if full AND key doesn't already exist
        if entries.len() == entries.cap().get() && !entries.contains(key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(key.to_string(), entry);
    }

    fn delete(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

// -------------------------------------------------------------------------
// Fingerprint
// -------------------------------------------------------------------------

#[derive(Serialize)]
struct FingerprintInput<'a> {
    model: &'a str,
    statistic: &'a str,
    filters: BTreeMap<&'a str, &'a FilterValue>,
}

/// Deterministic cache key for (model, statistic, filters).
///
/// `Filters` keeps keys sorted, so insertion order never changes the key.
/// Null values constrain nothing and are left out.
pub fn fingerprint(model: &str, statistic: &str, filters: &Filters) -> String {
    let input = FingerprintInput {
        model,
        statistic,
        filters: filters.iter().filter(|(_, value)| !value.is_null()).collect(),
    };
    let bytes = serde_json::to_vec(&input)
        .unwrap_or_else(|_| format!("{model}\u{1f}{statistic}\u{1f}{filters:?}").into_bytes());
    format!("{model}/{statistic}/{}", blake3::hash(&bytes).to_hex())
}

// -------------------------------------------------------------------------
// TtlCache
// -------------------------------------------------------------------------

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Current counters as `(hits, misses, writes, expirations)`.
    pub fn get(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.expirations.load(Ordering::Relaxed),
        )
    }

    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// TTL layer over a [`CacheStore`].
pub struct TtlCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl TtlCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Bounded memory store on the system clock.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemoryStore::new(capacity)), Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Unexpired value for `fingerprint`; expired entries are deleted.
    pub fn get(&self, fingerprint: &str) -> Option<StatValue> {
        let Some(entry) = self.store.read(fingerprint) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired(self.clock.now()) {
            debug!(fingerprint, expires_at = %entry.expires_at, "Cache entry expired");
            self.store.delete(fingerprint);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value)
    }

    pub fn put(&self, fingerprint: &str, value: StatValue, ttl: Duration) {
        let expires_at = add_duration(self.clock.now(), ttl);
        self.store.write(fingerprint, CacheEntry { value, expires_at });
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.store.delete(fingerprint);
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::in_memory(DEFAULT_CACHE_CAPACITY)
    }
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------
