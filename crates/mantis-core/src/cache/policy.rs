//! Pluggable eviction policies
//!
//! Each policy implements a small capability set: access/insert/remove
//! hooks, a name, and `evict(view, needed_bytes)` returning victims whose
//! total size covers the need (or the entire view if it cannot). Policies
//! are selected by configuration name: `lru`, `lfu`, `ttl` or `adaptive`.
//!
//! LRU keeps its recency order in an `IndexSet` for O(1)
//! `on_access`/`on_insert`/`on_remove` (front = least recently used), and
//! TTL keeps an expiry-ordered side set, so eviction walks victims in
//! order instead of re-sorting the whole view. LFU stays scan-based: its
//! sort key (access count) changes on every hit, which an ordered side
//! structure cannot track cheaply.

use indexmap::IndexSet;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{MantisError, MantisResult};

/// Read-only entry metadata handed to policies
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub key: String,
    pub size: u64,
    pub access_count: u64,
    pub last_access_ms: u64,
    pub created_at_ms: u64,
    /// Zero means the entry never expires
    pub ttl: Duration,
    /// Caller-assigned retention priority; the built-in policies ignore
    /// it, custom policies may weigh it
    pub priority: u8,
}

impl EntryMeta {
    /// Expiry instant in cache-epoch milliseconds; `None` when ttl is zero
    pub fn expires_at_ms(&self) -> Option<u64> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(self.created_at_ms + self.ttl.as_millis() as u64)
        }
    }
}

/// Eviction policy capability set
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called after a read hit updates the entry's access metadata
    fn on_access(&self, _meta: &EntryMeta) {}

    /// Called after an insert or replace
    fn on_insert(&self, _meta: &EntryMeta) {}

    /// Called when an entry leaves the cache (delete, eviction, expiry)
    fn on_remove(&self, _key: &str) {}

    /// Pick victims totalling at least `needed_bytes`; when the view cannot
    /// cover the need, the entire view is returned and the caller reports
    /// `CapacityExceeded`.
    fn evict(&self, view: &[EntryMeta], needed_bytes: u64) -> Vec<String>;
}

/// Build a policy from its configuration name
pub fn policy_from_name(name: &str) -> MantisResult<Box<dyn EvictionPolicy>> {
    match name.to_ascii_lowercase().as_str() {
        "lru" => Ok(Box::new(LruPolicy::new())),
        "lfu" => Ok(Box::new(LfuPolicy)),
        "ttl" => Ok(Box::new(TtlPolicy::new())),
        "adaptive" => Ok(Box::new(AdaptivePolicy::new())),
        other => Err(MantisError::invalid(format!(
            "unknown eviction policy: {}",
            other
        ))),
    }
}

fn index_view(view: &[EntryMeta]) -> HashMap<&str, &EntryMeta> {
    view.iter().map(|m| (m.key.as_str(), m)).collect()
}

/// Least recently used
///
/// The `IndexSet` maintains insertion order with O(1) remove-by-value, so
/// moving an entry to the most-recently-used end on every touch is O(1)
/// and eviction pops candidates from the front.
pub struct LruPolicy {
    /// Front = least recently used
    order: Mutex<IndexSet<String>>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(IndexSet::new()),
        }
    }

    fn touch(&self, key: &str) {
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.shift_remove(key);
        order.insert(key.to_string());
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_access(&self, meta: &EntryMeta) {
        self.touch(&meta.key);
    }

    fn on_insert(&self, meta: &EntryMeta) {
        self.touch(&meta.key);
    }

    fn on_remove(&self, key: &str) {
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.shift_remove(key);
    }

    fn evict(&self, view: &[EntryMeta], needed_bytes: u64) -> Vec<String> {
        let live = index_view(view);
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());

        let mut victims = Vec::new();
        let mut stale = Vec::new();
        let mut total = 0u64;
        for key in order.iter() {
            if total >= needed_bytes {
                break;
            }
            match live.get(key.as_str()) {
                Some(meta) => {
                    victims.push(key.clone());
                    total += meta.size;
                }
                // Expired or mid-replacement entries fell out of the view;
                // drop the tracking.
                None => stale.push(key.clone()),
            }
        }
        for key in stale {
            order.shift_remove(&key);
        }

        // Entries the order set never saw (defensive) go last, stalest
        // first.
        if total < needed_bytes {
            let mut untracked: Vec<&EntryMeta> = view
                .iter()
                .filter(|m| !order.contains(&m.key))
                .collect();
            untracked.sort_by_key(|m| (m.last_access_ms, m.created_at_ms));
            for meta in untracked {
                if total >= needed_bytes {
                    break;
                }
                if !victims.contains(&meta.key) {
                    victims.push(meta.key.clone());
                    total += meta.size;
                }
            }
        }
        victims
    }
}

/// Least frequently used; ties broken by earliest creation. Access counts
/// move on every hit, so candidates are ranked by scanning the view.
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn evict(&self, view: &[EntryMeta], needed_bytes: u64) -> Vec<String> {
        let mut ordered: Vec<&EntryMeta> = view.iter().collect();
        ordered.sort_by_key(|m| (m.access_count, m.created_at_ms));

        let mut victims = Vec::new();
        let mut total = 0u64;
        for meta in ordered {
            if total >= needed_bytes {
                break;
            }
            victims.push(meta.key.clone());
            total += meta.size;
        }
        victims
    }
}

#[derive(Default)]
struct TtlState {
    /// Ascending (expiry, key); entries without a TTL sort last
    by_expiry: BTreeSet<(u64, String)>,
    expiry_of: HashMap<String, u64>,
}

impl TtlState {
    fn remove(&mut self, key: &str) {
        if let Some(expiry) = self.expiry_of.remove(key) {
            self.by_expiry.remove(&(expiry, key.to_string()));
        }
    }

    fn insert(&mut self, key: &str, expiry: u64) {
        self.remove(key);
        self.by_expiry.insert((expiry, key.to_string()));
        self.expiry_of.insert(key.to_string(), expiry);
    }
}

/// Soonest expiration first; entries without a TTL sort after all others.
/// Expiry is fixed at insert, so an ordered side set walks victims
/// directly.
pub struct TtlPolicy {
    state: Mutex<TtlState>,
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TtlState::default()),
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn on_insert(&self, meta: &EntryMeta) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.insert(&meta.key, meta.expires_at_ms().unwrap_or(u64::MAX));
    }

    fn on_remove(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove(key);
    }

    fn evict(&self, view: &[EntryMeta], needed_bytes: u64) -> Vec<String> {
        let live = index_view(view);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut victims = Vec::new();
        let mut stale = Vec::new();
        let mut total = 0u64;
        for (_, key) in state.by_expiry.iter() {
            if total >= needed_bytes {
                break;
            }
            match live.get(key.as_str()) {
                Some(meta) => {
                    victims.push(key.clone());
                    total += meta.size;
                }
                None => stale.push(key.clone()),
            }
        }
        for key in stale {
            state.remove(&key);
        }

        if total < needed_bytes {
            let mut untracked: Vec<&EntryMeta> = view
                .iter()
                .filter(|m| !state.expiry_of.contains_key(&m.key))
                .collect();
            untracked.sort_by_key(|m| (m.expires_at_ms().unwrap_or(u64::MAX), m.created_at_ms));
            for meta in untracked {
                if total >= needed_bytes {
                    break;
                }
                if !victims.contains(&meta.key) {
                    victims.push(meta.key.clone());
                    total += meta.size;
                }
            }
        }
        victims
    }
}

/// 70% of the need from LRU order, 30% from LFU order, deduplicated
pub struct AdaptivePolicy {
    lru: LruPolicy,
    lfu: LfuPolicy,
}

impl AdaptivePolicy {
    pub fn new() -> Self {
        Self {
            lru: LruPolicy::new(),
            lfu: LfuPolicy,
        }
    }
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for AdaptivePolicy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn on_access(&self, meta: &EntryMeta) {
        self.lru.on_access(meta);
        self.lfu.on_access(meta);
    }

    fn on_insert(&self, meta: &EntryMeta) {
        self.lru.on_insert(meta);
        self.lfu.on_insert(meta);
    }

    fn on_remove(&self, key: &str) {
        self.lru.on_remove(key);
        self.lfu.on_remove(key);
    }

    fn evict(&self, view: &[EntryMeta], needed_bytes: u64) -> Vec<String> {
        let lru_share = (needed_bytes as f64 * 0.7).ceil() as u64;
        let lfu_share = needed_bytes.saturating_sub(lru_share);

        let mut victims = self.lru.evict(view, lru_share);
        for key in self.lfu.evict(view, lfu_share) {
            if !victims.contains(&key) {
                victims.push(key);
            }
        }

        // Deduplication can leave the combined set short; top up in LRU
        // order until the need is covered or the view is exhausted.
        let size_of = |key: &str| view.iter().find(|m| m.key == key).map(|m| m.size).unwrap_or(0);
        let mut total: u64 = victims.iter().map(|k| size_of(k)).sum();
        if total < needed_bytes {
            for key in self.lru.evict(view, needed_bytes) {
                if total >= needed_bytes {
                    break;
                }
                if !victims.contains(&key) {
                    total += size_of(&key);
                    victims.push(key);
                }
            }
        }
        victims
    }
}
