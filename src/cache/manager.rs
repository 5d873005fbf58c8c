//! Tiered cache manager.

use super::disk::{DiskRead, DiskTier};
use super::entry::CacheEntry;
use super::key::CacheKey;
use super::memory::MemoryTier;
use super::policy::{Matcher, PersistPolicy, PersistRequest, TtlThresholdPolicy};
use crate::analyzer::Analyzer;
use crate::config::duration_secs;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Weight of the newest sample in the retrieval-latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.1;
/// Analyzer calls a single warm-up run keeps in flight.
const WARM_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Disk tier root. `None` runs the cache memory-only.
    pub cache_dir: Option<PathBuf>,
    pub memory_capacity: usize,
    pub disk_capacity: usize,
    /// TTL used by warm-up and by callers that don't pick one. Zero never expires.
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// Entries living longer than this are written to disk by the default policy.
    #[serde(with = "duration_secs")]
    pub persist_threshold: Duration,
    /// Index records inspected when choosing a disk-tier victim.
    pub disk_eviction_sample: usize,
    /// Serialized payloads above this size are not cached.
    pub max_entry_size: usize,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: None,
            memory_capacity: 256,
            disk_capacity: 4096,
            default_ttl: Duration::from_secs(24 * 3600),
            persist_threshold: Duration::from_secs(12 * 3600),
            disk_eviction_sample: 32,
            max_entry_size: 10 * 1024 * 1024,
            sweep_interval: Duration::from_secs(600),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }
    pub fn with_disk_capacity(mut self, capacity: usize) -> Self {
        self.disk_capacity = capacity;
        self
    }
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_persist_threshold(mut self, threshold: Duration) -> Self {
        self.persist_threshold = threshold;
        self
    }
    pub fn with_disk_eviction_sample(mut self, sample: usize) -> Self {
        self.disk_eviction_sample = sample;
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: &str| {
            Err(Error::configuration_with_context(
                format!("invalid cache setting `{}`", field),
                ErrorContext::new()
                    .with_field_path(format!("cache.{}", field))
                    .with_details(details)
                    .with_source("cache_config"),
            ))
        };
        if self.memory_capacity == 0 {
            return invalid("memory_capacity", "must be at least 1");
        }
        if self.cache_dir.is_some() && self.disk_capacity == 0 {
            return invalid("disk_capacity", "must be at least 1 when a cache_dir is set");
        }
        if self.disk_eviction_sample == 0 {
            return invalid("disk_eviction_sample", "must be at least 1");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval", "must be non-zero");
        }
        Ok(())
    }
}

/// Point-in-time cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    /// Lookups that found only an expired entry. Not counted as misses.
    pub expired_hits: u64,
    pub total_requests: u64,
    pub evictions: u64,
    pub expired_removed: u64,
    pub corrupt_pruned: u64,
    pub disk_write_errors: u64,
    pub puts: u64,
    pub invalidated: u64,
    pub hit_rate: f64,
    /// Exponentially weighted average `get` latency in microseconds.
    pub avg_latency_us: f64,
    pub memory_size: usize,
    pub memory_capacity: usize,
    pub disk_size: usize,
    pub disk_capacity: usize,
    /// Distinct keys held by either tier.
    pub cache_size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.memory_hits + self.disk_hits) as f64 / self.total_requests as f64
        }
    }
}

struct AtomicStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    expired_hits: AtomicU64,
    total_requests: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
    corrupt_pruned: AtomicU64,
    disk_write_errors: AtomicU64,
    puts: AtomicU64,
    invalidated: AtomicU64,
    latency_ewma_bits: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_hits: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
            corrupt_pruned: AtomicU64::new(0),
            disk_write_errors: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
            latency_ewma_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000_000.0;
        let _ = self
            .latency_ewma_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if current == 0.0 {
                    sample
                } else {
                    LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * current
                };
                Some(next.to_bits())
            });
    }

    fn to_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_hits: self.expired_hits.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            corrupt_pruned: self.corrupt_pruned.load(Ordering::Relaxed),
            disk_write_errors: self.disk_write_errors.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            avg_latency_us: f64::from_bits(self.latency_ewma_bits.load(Ordering::Relaxed)),
            ..Default::default()
        };
        stats.hit_rate = stats.hit_ratio();
        stats
    }
}

/// Result of one background warm-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub warmed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

enum WarmOutcome {
    Warmed,
    Skipped,
    Failed,
}

enum Lookup<V> {
    Memory(V),
    Disk(V),
    Expired,
    Miss,
}

struct Tiers<V> {
    memory: MemoryTier<V>,
    disk: Option<DiskTier>,
}

/// Two-level result cache: a bounded in-process LRU tier in front of a persisted
/// disk tier.
///
/// Both tiers sit behind one mutex, so every mutation (including the promotion and
/// eviction a `get` may trigger) is serialized per instance. Construct it once at
/// startup and share it through an `Arc`.
pub struct TieredCache<V> {
    config: CacheConfig,
    tiers: Mutex<Tiers<V>>,
    policy: Arc<dyn PersistPolicy>,
    stats: AtomicStats,
    shutdown: CancellationToken,
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the cache, reloading the disk index and sweeping expired or orphaned
    /// entries left from a previous run.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.memory_capacity).ok_or_else(|| {
            Error::configuration_with_context(
                "memory capacity must be at least 1",
                ErrorContext::new().with_field_path("cache.memory_capacity"),
            )
        })?;

        let disk = match &config.cache_dir {
            Some(dir) => Some(DiskTier::open(dir).map_err(|e| {
                Error::configuration_with_context(
                    format!("cannot open cache directory: {}", e),
                    ErrorContext::new()
                        .with_field_path("cache.cache_dir")
                        .with_details(dir.display().to_string())
                        .with_source("tiered_cache"),
                )
            })?),
            None => None,
        };

        let cache = Self {
            policy: Arc::new(TtlThresholdPolicy::new(config.persist_threshold)),
            tiers: Mutex::new(Tiers {
                memory: MemoryTier::new(capacity),
                disk,
            }),
            stats: AtomicStats::new(),
            shutdown: CancellationToken::new(),
            config,
        };
        cache.prune_orphans();
        let expired = cache.sweep();
        if expired > 0 {
            info!(expired, "removed expired cache entries at startup");
        }
        Ok(cache)
    }

    /// Memory-only cache with the given capacity.
    pub fn in_memory(capacity: usize) -> Result<Self> {
        Self::open(CacheConfig::new().with_memory_capacity(capacity))
    }

    /// Replace the default TTL-threshold persistence policy.
    pub fn with_persist_policy(mut self, policy: impl PersistPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Bind background work (warming, sweeping) to an external shutdown signal.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Tiers<V>> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }
        let started = Instant::now();
        let key = CacheKey::new(key);
        let outcome = self.lookup(key.as_str(), Utc::now());

        AtomicStats::bump(&self.stats.total_requests, 1);
        let value = match outcome {
            Lookup::Memory(v) => {
                AtomicStats::bump(&self.stats.memory_hits, 1);
                Some(v)
            }
            Lookup::Disk(v) => {
                AtomicStats::bump(&self.stats.disk_hits, 1);
                Some(v)
            }
            Lookup::Expired => {
                AtomicStats::bump(&self.stats.expired_hits, 1);
                None
            }
            Lookup::Miss => {
                AtomicStats::bump(&self.stats.misses, 1);
                None
            }
        };
        self.stats.record_latency(started.elapsed());
        value
    }

    fn lookup(&self, key: &str, now: DateTime<Utc>) -> Lookup<V> {
        let mut guard = self.lock();
        let tiers = &mut *guard;

        let expired_in_memory = match tiers.memory.get_mut(key) {
            Some(entry) if entry.is_expired_at(now) => true,
            Some(entry) => {
                entry.touch(now);
                return Lookup::Memory(entry.payload.clone());
            }
            None => false,
        };
        if expired_in_memory {
            tiers.memory.remove(key);
            self.remove_from_disk(tiers, key);
            AtomicStats::bump(&self.stats.expired_removed, 1);
            debug!(key, "expired entry removed on lookup");
            return Lookup::Expired;
        }

        let Some(disk) = tiers.disk.as_mut() else {
            return Lookup::Miss;
        };
        if disk.record(key).map_or(false, |r| r.is_expired_at(now)) {
            if let Err(e) = disk.remove(key) {
                warn!(key, error = %e, "failed to remove expired disk entry");
            }
            AtomicStats::bump(&self.stats.expired_removed, 1);
            debug!(key, "expired disk entry removed on lookup");
            return Lookup::Expired;
        }

        match disk.read::<V>(key) {
            DiskRead::Absent => Lookup::Miss,
            DiskRead::Corrupt(reason) => {
                AtomicStats::bump(&self.stats.corrupt_pruned, 1);
                warn!(key, %reason, "corrupt disk entry pruned");
                Lookup::Miss
            }
            DiskRead::Found(mut entry) => {
                entry.touch(now);
                if let Err(e) = disk.touch(key, entry.last_accessed, entry.access_count) {
                    warn!(key, error = %e, "failed to record disk hit");
                }
                let payload = entry.payload.clone();
                if let Some(victim) = tiers.memory.insert(entry) {
                    AtomicStats::bump(&self.stats.evictions, 1);
                    debug!(key, victim = %victim.key, "memory eviction on promotion");
                }
                debug!(key, "promoted disk entry into memory");
                Lookup::Disk(payload)
            }
        }
    }

    /// Store `payload` with the default persistence policy. Returns `false` when the
    /// entry was not cached (cache disabled or payload too large).
    pub fn put(&self, key: &str, payload: V, ttl: Duration, persist_hint: bool) -> bool {
        self.put_tagged(key, payload, ttl, persist_hint, None)
    }

    pub fn put_tagged(
        &self,
        key: &str,
        payload: V,
        ttl: Duration,
        persist_hint: bool,
        tag: Option<&str>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = CacheKey::new(key);
        let size = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                warn!(key = %key, error = %e, "payload not serializable, skipping cache");
                return false;
            }
        };
        if size > self.config.max_entry_size {
            debug!(key = %key, size, max = self.config.max_entry_size, "payload too large to cache");
            return false;
        }

        let persist = self.policy.should_persist(&PersistRequest {
            key: key.as_str(),
            ttl,
            persist_hint,
            tag,
        });
        let entry = CacheEntry::new(key.as_str(), payload, ttl, Utc::now())
            .with_tag(tag.map(str::to_string));

        let mut guard = self.lock();
        let tiers = &mut *guard;
        if let Some(disk) = tiers.disk.as_mut() {
            if persist {
                self.write_disk(disk, &entry);
            } else if disk.contains(key.as_str()) {
                // A newer non-durable value must not be shadowed by an old durable one.
                if let Err(e) = disk.remove(key.as_str()) {
                    warn!(key = %key, error = %e, "failed to drop superseded disk entry");
                }
            }
        }
        if let Some(victim) = tiers.memory.insert(entry) {
            AtomicStats::bump(&self.stats.evictions, 1);
            debug!(key = %key, victim = %victim.key, "memory eviction");
        }
        AtomicStats::bump(&self.stats.puts, 1);
        true
    }

    fn write_disk(&self, disk: &mut DiskTier, entry: &CacheEntry<V>) {
        if !disk.contains(&entry.key) {
            while disk.len() >= self.config.disk_capacity {
                let Some(victim) = disk.sample_victim(self.config.disk_eviction_sample) else {
                    break;
                };
                match disk.remove(&victim) {
                    Ok(_) => {
                        AtomicStats::bump(&self.stats.evictions, 1);
                        debug!(victim = %victim, "disk eviction");
                    }
                    Err(e) => {
                        warn!(victim = %victim, error = %e, "disk eviction failed");
                        break;
                    }
                }
            }
        }
        if let Err(e) = disk.write(entry) {
            AtomicStats::bump(&self.stats.disk_write_errors, 1);
            warn!(key = %entry.key, error = %e, "disk write failed, entry kept in memory only");
            // An older durable copy would otherwise be promoted once memory drops this one.
            if let Err(e) = disk.remove(&entry.key) {
                warn!(key = %entry.key, error = %e, "failed to drop superseded disk entry");
            }
        }
    }

    fn remove_from_disk(&self, tiers: &mut Tiers<V>, key: &str) {
        if let Some(disk) = tiers.disk.as_mut() {
            if let Err(e) = disk.remove(key) {
                warn!(key, error = %e, "failed to remove disk entry");
            }
        }
    }

    fn remove_keys(&self, tiers: &mut Tiers<V>, keys: &[String]) {
        for key in keys {
            tiers.memory.remove(key);
        }
        if let Some(disk) = tiers.disk.as_mut() {
            if let Err(e) = disk.remove_many(keys) {
                warn!(count = keys.len(), error = %e, "failed to remove disk entries");
            }
        }
    }

    /// Remove every entry whose key or tag satisfies `matcher`, from both tiers.
    /// Returns the number of distinct keys removed.
    pub fn invalidate(&self, matcher: &Matcher) -> usize {
        let mut guard = self.lock();
        let tiers = &mut *guard;
        let mut keys: HashSet<String> = tiers
            .memory
            .keys_where(|e| matcher.matches(&e.key, e.tag.as_deref()))
            .into_iter()
            .collect();
        if let Some(disk) = tiers.disk.as_ref() {
            keys.extend(disk.keys_where(|k, r| matcher.matches(k, r.tag.as_deref())));
        }
        let keys: Vec<String> = keys.into_iter().collect();
        self.remove_keys(tiers, &keys);
        drop(guard);

        AtomicStats::bump(&self.stats.invalidated, keys.len() as u64);
        info!(count = keys.len(), ?matcher, "invalidated cache entries");
        keys.len()
    }

    /// Remove expired entries from both tiers. Returns the number of distinct keys removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.lock();
        let tiers = &mut *guard;
        let mut keys: HashSet<String> = tiers.memory.expired_keys(now).into_iter().collect();
        if let Some(disk) = tiers.disk.as_ref() {
            keys.extend(disk.expired_keys(now));
        }
        if keys.is_empty() {
            return 0;
        }
        let keys: Vec<String> = keys.into_iter().collect();
        self.remove_keys(tiers, &keys);
        drop(guard);

        AtomicStats::bump(&self.stats.expired_removed, keys.len() as u64);
        debug!(count = keys.len(), "swept expired cache entries");
        keys.len()
    }

    fn prune_orphans(&self) {
        let mut guard = self.lock();
        let Some(disk) = guard.disk.as_mut() else {
            return;
        };
        match disk.prune_missing() {
            Ok(pruned) if !pruned.is_empty() => {
                AtomicStats::bump(&self.stats.corrupt_pruned, pruned.len() as u64);
                warn!(count = pruned.len(), dir = %disk.dir().display(), "pruned index entries without a backing file");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to prune cache index"),
        }
    }

    /// Whether an unexpired entry for `key` exists in either tier. Does not count
    /// as a request and does not touch access metadata.
    pub fn contains(&self, key: &str) -> bool {
        let key = CacheKey::new(key);
        let now = Utc::now();
        let guard = self.lock();
        if let Some(entry) = guard.memory.peek(key.as_str()) {
            if !entry.is_expired_at(now) {
                return true;
            }
        }
        guard
            .disk
            .as_ref()
            .and_then(|d| d.record(key.as_str()))
            .map_or(false, |r| !r.is_expired_at(now))
    }

    /// All keys held by either tier, sorted.
    pub fn keys(&self) -> Vec<String> {
        let guard = self.lock();
        let mut keys: HashSet<String> = guard.memory.keys().cloned().collect();
        if let Some(disk) = guard.disk.as_ref() {
            keys.extend(disk.keys().cloned());
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys
    }

    /// Distinct keys held by either tier.
    pub fn len(&self) -> usize {
        Self::distinct_len(&self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn distinct_len(tiers: &Tiers<V>) -> usize {
        match tiers.disk.as_ref() {
            Some(disk) => disk.len() + tiers.memory.keys().filter(|k| !disk.contains(k)).count(),
            None => tiers.memory.len(),
        }
    }

    pub fn memory_len(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn disk_len(&self) -> usize {
        self.lock().disk.as_ref().map_or(0, |d| d.len())
    }

    pub fn clear(&self) {
        let mut guard = self.lock();
        guard.memory.clear();
        if let Some(disk) = guard.disk.as_mut() {
            if let Err(e) = disk.clear() {
                warn!(error = %e, "failed to clear disk tier");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (memory_size, memory_capacity, disk_size, cache_size) = {
            let guard = self.lock();
            (
                guard.memory.len(),
                guard.memory.capacity(),
                guard.disk.as_ref().map_or(0, |d| d.len()),
                Self::distinct_len(&guard),
            )
        };
        CacheStats {
            memory_size,
            memory_capacity,
            disk_size,
            disk_capacity: if self.config.cache_dir.is_some() {
                self.config.disk_capacity
            } else {
                0
            },
            cache_size,
            ..self.stats.to_stats()
        }
    }

    /// Prefetch `keys` in the background through `analyzer`, storing results with the
    /// default TTL. Keys already cached are skipped; failures are logged and counted,
    /// never surfaced. The task stops early once the cache's shutdown token fires.
    pub fn warm<A>(self: &Arc<Self>, keys: Vec<String>, analyzer: Arc<A>) -> JoinHandle<WarmReport>
    where
        A: Analyzer<Output = V> + ?Sized + 'static,
    {
        let cache = Arc::clone(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let total = keys.len();
            let mut report = WarmReport::default();
            let outcomes = futures::stream::iter(keys)
                .map(|key| {
                    let cache = Arc::clone(&cache);
                    let analyzer = Arc::clone(&analyzer);
                    async move { cache.warm_one(&key, analyzer.as_ref()).await }
                })
                .buffer_unordered(WARM_CONCURRENCY)
                .take_until(token.cancelled());
            tokio::pin!(outcomes);

            while let Some(outcome) = outcomes.next().await {
                match outcome {
                    WarmOutcome::Warmed => report.warmed += 1,
                    WarmOutcome::Skipped => report.skipped += 1,
                    WarmOutcome::Failed => report.failed += 1,
                }
            }
            report.cancelled = report.warmed + report.skipped + report.failed < total;
            info!(
                warmed = report.warmed,
                skipped = report.skipped,
                failed = report.failed,
                cancelled = report.cancelled,
                "cache warm-up finished"
            );
            report
        })
    }

    async fn warm_one<A>(&self, key: &str, analyzer: &A) -> WarmOutcome
    where
        A: Analyzer<Output = V> + ?Sized,
    {
        if self.contains(key) {
            return WarmOutcome::Skipped;
        }
        match analyzer.analyze(key).await {
            Ok(payload) => {
                if self.put(key, payload, self.config.default_ttl, false) {
                    WarmOutcome::Warmed
                } else {
                    WarmOutcome::Failed
                }
            }
            Err(e) => {
                warn!(key, error = %e, "cache warm-up failed");
                WarmOutcome::Failed
            }
        }
    }

    /// Sweep expired entries every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let token = self.shutdown.child_token();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            info!(removed, "periodic cache sweep");
                        }
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }

    /// Stop background warming and sweeping.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzerError, FnAnalyzer};

    fn disk_cache(dir: &std::path::Path, memory: usize) -> TieredCache<String> {
        TieredCache::open(
            CacheConfig::new()
                .with_cache_dir(dir)
                .with_memory_capacity(memory)
                .with_persist_threshold(Duration::from_secs(60)),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::new().validate().is_ok());
        let err = CacheConfig::new().with_memory_capacity(0).validate().unwrap_err();
        assert!(err.to_string().contains("memory_capacity"));
        assert!(CacheConfig::new()
            .with_cache_dir("/tmp/x")
            .with_disk_capacity(0)
            .validate()
            .is_err());
        assert!(TieredCache::<String>::in_memory(0).is_err());
    }

    #[test]
    fn test_memory_round_trip_and_stats() {
        let cache = TieredCache::in_memory(4).unwrap();
        assert!(cache.get("hades").is_none());
        assert!(cache.put("Hades", "9/10".to_string(), Duration::ZERO, false));
        for _ in 0..9 {
            assert_eq!(cache.get("hades").as_deref(), Some("9/10"));
        }
        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 9);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 10);
        assert!((stats.hit_rate - 0.9).abs() < 1e-9);
        assert!(stats.avg_latency_us >= 0.0);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.disk_capacity, 0);
    }

    #[test]
    fn test_expired_entry_counted_separately() {
        let cache = TieredCache::in_memory(4).unwrap();
        cache.put("a", "x".to_string(), Duration::from_millis(20), false);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("a").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expired_hits, 1);
        assert_eq!(stats.expired_removed, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = TieredCache::open(CacheConfig::new().with_enabled(false)).unwrap();
        assert!(!cache.put("a", "x".to_string(), Duration::ZERO, true));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().total_requests, 0);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cache = TieredCache::open(CacheConfig::new().with_max_entry_size(8)).unwrap();
        assert!(!cache.put("a", "much too long for the limit".to_string(), Duration::ZERO, false));
        assert!(cache.put("b", "ok".to_string(), Duration::ZERO, false));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_persist_policy_routes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 8);
        cache.put("short", "s".to_string(), Duration::from_secs(30), false);
        cache.put("long", "l".to_string(), Duration::from_secs(3600), false);
        cache.put("hinted", "h".to_string(), Duration::from_secs(30), true);
        cache.put("forever", "f".to_string(), Duration::ZERO, false);
        assert_eq!(cache.memory_len(), 4);
        assert_eq!(cache.disk_len(), 3);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_custom_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 8)
            .with_persist_policy(|r: &PersistRequest<'_>| r.tag == Some("popular"));
        cache.put_tagged("a", "1".to_string(), Duration::from_secs(1), false, Some("popular"));
        cache.put("b", "2".to_string(), Duration::ZERO, true);
        assert_eq!(cache.disk_len(), 1);
        assert!(cache.invalidate(&Matcher::tag("popular")) == 1);
        assert_eq!(cache.disk_len(), 0);
    }

    #[test]
    fn test_non_durable_put_drops_stale_disk_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 1);
        cache.put("a", "old".to_string(), Duration::ZERO, true);
        cache.put("a", "new".to_string(), Duration::from_secs(5), false);
        assert_eq!(cache.disk_len(), 0);
        // Evict "a" from memory; it must not come back with the old value.
        cache.put("b", "x".to_string(), Duration::from_secs(5), false);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_disk_hit_promotes_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 1);
        cache.put("a", "alpha".to_string(), Duration::ZERO, true);
        cache.put("b", "beta".to_string(), Duration::ZERO, true);
        // "a" was evicted from memory but lives on disk.
        assert_eq!(cache.memory_len(), 1);
        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_disk_capacity_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::<String>::open(
            CacheConfig::new()
                .with_cache_dir(dir.path())
                .with_memory_capacity(10)
                .with_disk_capacity(3),
        )
        .unwrap();
        for i in 0..6 {
            cache.put(&format!("k{}", i), i.to_string(), Duration::ZERO, true);
            assert!(cache.disk_len() <= 3);
        }
        assert_eq!(cache.disk_len(), 3);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = disk_cache(dir.path(), 4);
            cache.put("durable", "kept".to_string(), Duration::ZERO, true);
            cache.put("volatile", "lost".to_string(), Duration::from_secs(5), false);
        }
        let cache = disk_cache(dir.path(), 4);
        assert_eq!(cache.get("durable").as_deref(), Some("kept"));
        assert!(cache.get("volatile").is_none());
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[test]
    fn test_sweep_removes_expired_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 4);
        cache.put("a", "1".to_string(), Duration::from_millis(20), true);
        cache.put("b", "2".to_string(), Duration::from_millis(20), false);
        cache.put("c", "3".to_string(), Duration::ZERO, true);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.keys(), vec!["c".to_string()]);
        assert_eq!(cache.disk_len(), 1);
        assert_eq!(cache.stats().expired_removed, 2);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 4);
        cache.put("a", "1".to_string(), Duration::ZERO, true);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn test_warm_populates_and_swallows_failures() {
        let cache = Arc::new(TieredCache::<String>::in_memory(16).unwrap());
        cache.put("cached", "already".to_string(), Duration::ZERO, false);
        let analyzer = Arc::new(FnAnalyzer::new(|key: String| async move {
            if key == "broken" {
                Err(AnalyzerError::new("scrape failed"))
            } else {
                Ok(format!("review of {}", key))
            }
        }));

        let report = cache
            .warm(
                vec!["cached".into(), "celeste".into(), "broken".into(), "hades".into()],
                analyzer,
            )
            .await
            .unwrap();
        assert_eq!(report.warmed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.cancelled);
        assert_eq!(cache.get("celeste").as_deref(), Some("review of celeste"));
        assert_eq!(cache.get("cached").as_deref(), Some("already"));
        assert!(!cache.contains("broken"));
    }

    #[tokio::test]
    async fn test_warm_stops_on_shutdown() {
        let cache = Arc::new(TieredCache::<String>::in_memory(16).unwrap());
        let analyzer = Arc::new(FnAnalyzer::new(|key: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, AnalyzerError>(key)
        }));
        let handle = cache.warm(vec!["a".into(), "b".into()], analyzer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.warmed, 0);
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_shutdown() {
        let cache = Arc::new(
            TieredCache::<String>::open(
                CacheConfig::new().with_sweep_interval(Duration::from_millis(20)),
            )
            .unwrap(),
        );
        cache.put("a", "x".to_string(), Duration::from_millis(10), false);
        let handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.memory_len(), 0);
        cache.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
