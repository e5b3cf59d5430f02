//! In-memory KV cache
//!
//! Sharded map with pluggable eviction, lazy expiration and atomic
//! statistics. Reads take shared shard access and update access metadata
//! through atomics; mutations take exclusive access on the affected shard
//! only. The byte and entry budgets hold at every observation point after a
//! completed put or eviction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{MantisError, MantisResult};
use crate::metrics::MetricsSink;
use crate::runtime::RuntimeHandle;

pub mod memory;
pub mod policy;

pub use memory::MemoryMonitor;
pub use policy::{policy_from_name, EntryMeta, EvictionPolicy};

struct CacheEntry {
    value: Vec<u8>,
    size: u64,
    access_count: AtomicU64,
    last_access_ms: AtomicU64,
    created_at_ms: u64,
    /// Zero means no expiry
    ttl: Duration,
    priority: u8,
}

impl CacheEntry {
    fn expired(&self, now_ms: u64) -> bool {
        !self.ttl.is_zero() && now_ms >= self.created_at_ms + self.ttl.as_millis() as u64
    }

    fn meta(&self, key: &str) -> EntryMeta {
        EntryMeta {
            key: key.to_string(),
            size: self.size,
            access_count: self.access_count.load(Ordering::Relaxed),
            last_access_ms: self.last_access_ms.load(Ordering::Relaxed),
            created_at_ms: self.created_at_ms,
            ttl: self.ttl,
            priority: self.priority,
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub puts: u64,
    pub deletes: u64,
    pub current_size_bytes: u64,
    pub entry_count: u64,
    pub max_size_bytes: u64,
    pub max_entries: usize,
    pub policy: String,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

const EVICTION_RETRIES: usize = 3;

/// Sharded KV cache with pluggable eviction
pub struct Cache {
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
    policy: Box<dyn EvictionPolicy>,
    config: CacheConfig,
    epoch: Instant,
    current_size: AtomicU64,
    entry_count: AtomicU64,
    counters: Counters,
    metrics: Arc<dyn MetricsSink>,
}

impl Cache {
    pub fn new(config: CacheConfig, metrics: Arc<dyn MetricsSink>) -> MantisResult<Self> {
        let policy = policy_from_name(&config.eviction_policy)?;
        let shards = (0..config.shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        info!(
            "📦 Cache ready: {} bytes / {} entries max, policy {}",
            config.max_size_bytes,
            config.max_entries,
            policy.name()
        );
        Ok(Self {
            shards,
            policy,
            config,
            epoch: Instant::now(),
            current_size: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            counters: Counters::default(),
            metrics,
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn shard_for(&self, key: &str) -> &RwLock<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Read a value; expired entries are removed lazily and never returned
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.now_ms();
        {
            let shard = self.shard_for(key).read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = shard.get(key) {
                if !entry.expired(now) {
                    entry.access_count.fetch_add(1, Ordering::Relaxed);
                    entry.last_access_ms.store(now, Ordering::Relaxed);
                    self.policy.on_access(&entry.meta(key));
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.metrics.incr_counter("cache_hits_total", 1);
                    return Some(entry.value.clone());
                }
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter("cache_misses_total", 1);
                return None;
            }
        }

        // Present but expired: take the write lock and drop it.
        let mut shard = self.shard_for(key).write().unwrap_or_else(|e| e.into_inner());
        let still_expired = shard.get(key).map(|e| e.expired(now)).unwrap_or(false);
        if still_expired {
            if let Some(entry) = shard.remove(key) {
                self.current_size.fetch_sub(entry.size, Ordering::SeqCst);
                self.entry_count.fetch_sub(1, Ordering::SeqCst);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.policy.on_remove(key);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter("cache_misses_total", 1);
        None
    }

    /// Insert or replace; evicts per policy until the byte and entry
    /// budgets admit the value. A value larger than the whole cache fails
    /// with `CapacityExceeded`.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> MantisResult<()> {
        self.put_with_priority(key, value, ttl, 0)
    }

    /// [`put`](Self::put) with a caller-assigned retention priority
    pub fn put_with_priority(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        priority: u8,
    ) -> MantisResult<()> {
        let size = (key.len() + value.len()) as u64;
        if size > self.config.max_size_bytes {
            return Err(MantisError::CapacityExceeded(format!(
                "value of {} bytes exceeds cache budget {}",
                size, self.config.max_size_bytes
            )));
        }

        let mut pending = Some(value);
        for attempt in 0..=EVICTION_RETRIES {
            let (needed_bytes, needs_slot) = {
                let shard = self.shard_for(key).write().unwrap_or_else(|e| e.into_inner());
                let replaced_size = shard.get(key).map(|e| e.size).unwrap_or(0);
                let replacing = shard.contains_key(key);
                let projected_size =
                    self.current_size.load(Ordering::SeqCst) - replaced_size + size;
                let projected_count =
                    self.entry_count.load(Ordering::SeqCst) + if replacing { 0 } else { 1 };

                if projected_size <= self.config.max_size_bytes
                    && projected_count <= self.config.max_entries as u64
                {
                    // Admit: swap in the new entry under the shard lock.
                    let mut shard = shard;
                    let now = self.now_ms();
                    if let Some(old) = shard.remove(key) {
                        self.current_size.fetch_sub(old.size, Ordering::SeqCst);
                        self.entry_count.fetch_sub(1, Ordering::SeqCst);
                    }
                    let entry = CacheEntry {
                        value: pending.take().unwrap_or_default(),
                        size,
                        access_count: AtomicU64::new(0),
                        last_access_ms: AtomicU64::new(now),
                        created_at_ms: now,
                        ttl,
                        priority,
                    };
                    self.policy.on_insert(&entry.meta(key));
                    shard.insert(key.to_string(), entry);
                    self.current_size.fetch_add(size, Ordering::SeqCst);
                    self.entry_count.fetch_add(1, Ordering::SeqCst);
                    self.counters.puts.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .set_gauge("cache_size_bytes", self.current_size.load(Ordering::SeqCst) as f64);
                    return Ok(());
                }

                let needed = (projected_size).saturating_sub(self.config.max_size_bytes);
                let needs_slot = projected_count > self.config.max_entries as u64;
                (needed, needs_slot)
            };

            if attempt == EVICTION_RETRIES {
                break;
            }
            // Shard lock dropped: eviction scans shards one at a time.
            self.evict_for(needed_bytes, needs_slot, key)?;
        }

        Err(MantisError::CapacityExceeded(format!(
            "cache cannot admit {} ({} bytes) after eviction",
            key, size
        )))
    }

    /// Remove a key; true when it was present
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.remove_entry(key);
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn remove_entry(&self, key: &str) -> bool {
        let mut shard = self.shard_for(key).write().unwrap_or_else(|e| e.into_inner());
        match shard.remove(key) {
            Some(entry) => {
                self.current_size.fetch_sub(entry.size, Ordering::SeqCst);
                self.entry_count.fetch_sub(1, Ordering::SeqCst);
                self.policy.on_remove(key);
                true
            }
            None => false,
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(|e| e.into_inner());
            for key in shard.keys() {
                self.policy.on_remove(key);
            }
            shard.clear();
        }
        self.current_size.store(0, Ordering::SeqCst);
        self.entry_count.store(0, Ordering::SeqCst);
    }

    /// Metadata snapshot across shards (one shard lock at a time), skipping
    /// expired entries
    fn snapshot_meta(&self, exclude: &str, now_ms: u64) -> Vec<EntryMeta> {
        let mut view = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(|e| e.into_inner());
            for (key, entry) in shard.iter() {
                if key != exclude && !entry.expired(now_ms) {
                    view.push(entry.meta(key));
                }
            }
        }
        view
    }

    /// Evict per policy until `needed_bytes` (and an entry slot, when
    /// requested) are reclaimed; insufficient eviction is
    /// `CapacityExceeded`.
    fn evict_for(&self, needed_bytes: u64, needs_slot: bool, exclude: &str) -> MantisResult<()> {
        let now = self.now_ms();
        // Expired entries are free wins before the policy runs.
        self.purge_expired();

        let view = self.snapshot_meta(exclude, now);
        let target = needed_bytes.max(if needs_slot { 1 } else { 0 });
        if target == 0 {
            return Ok(());
        }
        let victims = self.policy.evict(&view, target);
        let reclaimable: u64 = victims
            .iter()
            .filter_map(|k| view.iter().find(|m| &m.key == k))
            .map(|m| m.size)
            .sum();
        if reclaimable < needed_bytes && (!needs_slot || victims.is_empty()) {
            return Err(MantisError::CapacityExceeded(format!(
                "eviction policy {} reclaimed {} of {} needed bytes",
                self.policy.name(),
                reclaimable,
                needed_bytes
            )));
        }

        let mut evicted = 0u64;
        for key in victims {
            if self.remove_entry(&key) {
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.metrics.incr_counter("cache_evictions_total", evicted);
        debug!("Evicted {} entr(ies) for {} bytes", evicted, needed_bytes);
        Ok(())
    }

    /// Remove every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = shard
                .iter()
                .filter(|(_, e)| e.expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                if let Some(entry) = shard.remove(&key) {
                    self.current_size.fetch_sub(entry.size, Ordering::SeqCst);
                    self.entry_count.fetch_sub(1, Ordering::SeqCst);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    self.policy.on_remove(&key);
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Force-evict roughly `bytes` (memory pressure response)
    pub fn force_evict(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Err(e) = self.evict_for(bytes.min(self.current_size.load(Ordering::SeqCst)), false, "") {
            debug!("Forced eviction fell short: {}", e);
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            current_size_bytes: self.current_size(),
            entry_count: self.len(),
            max_size_bytes: self.config.max_size_bytes,
            max_entries: self.config.max_entries,
            policy: self.policy.name().to_string(),
        }
    }

    /// Spawn the periodic expired-entry sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, runtime: RuntimeHandle, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("🧹 Sweeper purged {} expired entr(ies)", purged);
                }
            }
        });
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.len())
            .field("size_bytes", &self.current_size())
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;

    fn cache_with(max_bytes: u64, max_entries: usize, policy: &str) -> Cache {
        let config = CacheConfig {
            max_size_bytes: max_bytes,
            max_entries,
            shards: 4,
            eviction_policy: policy.to_string(),
            ..CacheConfig::default()
        };
        Cache::new(config, Arc::new(NullMetrics)).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = cache_with(1024, 100, "lru");
        cache.put("k1", b"value-1".to_vec(), Duration::ZERO).unwrap();
        assert_eq!(cache.get("k1"), Some(b"value-1".to_vec()));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_oversized_value_is_rejected() {
        let cache = cache_with(64, 100, "lru");
        let err = cache
            .put("big", vec![0u8; 128], Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, MantisError::CapacityExceeded(_)));
    }

    #[test]
    fn test_exact_fit_succeeds_only_when_empty() {
        let cache = cache_with(100, 100, "lru");
        // key (4) + value (96) == budget
        cache.put("full", vec![1u8; 96], Duration::ZERO).unwrap();
        assert_eq!(cache.current_size(), 100);

        // A second entry forces the first out to admit the new exact fit.
        cache.put("next", vec![2u8; 96], Duration::ZERO).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("next").is_some());
        assert!(cache.get("full").is_none());
    }

    #[test]
    fn test_lru_eviction_respects_recent_access() {
        let cache = cache_with(10_000, 3, "lru");
        cache.put("k1", b"a".to_vec(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.put("k2", b"b".to_vec(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.put("k3", b"c".to_vec(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k1").is_some()); // refresh k1
        std::thread::sleep(Duration::from_millis(5));

        cache.put("k4", b"d".to_vec(), Duration::ZERO).unwrap();
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k2").is_none(), "k2 was least recently used");
        assert!(cache.get("k3").is_some());
        assert!(cache.get("k4").is_some());
    }

    #[test]
    fn test_expired_entries_are_never_returned() {
        let cache = cache_with(1024, 100, "ttl");
        cache
            .put("ephemeral", b"x".to_vec(), Duration::from_millis(20))
            .unwrap();
        assert!(cache.get("ephemeral").is_some());
        std::thread::sleep(Duration::from_millis(40));
        // No sweeper has run; the read path must still refuse the entry.
        assert!(cache.get("ephemeral").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_size_budget_holds_after_every_put() {
        let cache = cache_with(256, 1_000, "lru");
        for i in 0..50 {
            let key = format!("key-{:03}", i);
            cache.put(&key, vec![0u8; 24], Duration::ZERO).unwrap();
            assert!(
                cache.current_size() <= 256,
                "size {} exceeded budget after put {}",
                cache.current_size(),
                i
            );
        }
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache_with(1024, 100, "lfu");
        cache.put("a", b"1".to_vec(), Duration::ZERO).unwrap();
        cache.put("b", b"2".to_vec(), Duration::ZERO).unwrap();
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_force_evict_reclaims_bytes() {
        let cache = cache_with(10_000, 1_000, "lru");
        for i in 0..20 {
            cache
                .put(&format!("k{}", i), vec![0u8; 100], Duration::ZERO)
                .unwrap();
        }
        let before = cache.current_size();
        cache.force_evict(before / 10);
        assert!(cache.current_size() < before);
    }
}
