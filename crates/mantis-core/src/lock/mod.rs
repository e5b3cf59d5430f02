//! Lock Manager
//!
//! Read/write locks over named resources with:
//! - Hierarchy-based deadlock prevention: every resource gets a stable
//!   order number on first observation and a transaction must acquire in
//!   strictly increasing order
//! - Writer preference: a pending writer blocks new read acquisitions
//! - A fast path that grants uncontended resources without allocating a
//!   wait record
//! - Wait queues ordered by (priority desc, arrival asc) with atomic batch
//!   grants for leading readers
//! - An adaptive acquisition timeout driven by a sliding outcome window
//! - A background deadlock detector (see [`deadlock`])
//!
//! Lock tables are sharded by resource hash; at most one shard mutex is
//! held at a time, so the manager cannot deadlock against itself.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LockConfig;
use crate::error::{MantisError, MantisResult};
use crate::metrics::MetricsSink;

pub mod deadlock;

pub use deadlock::{DeadlockDetector, DetectionReport, VictimPolicy};

/// Transaction identifier; ids are monotonic, so the highest id is the
/// youngest transaction
pub type TxnId = u64;

/// Lock modes; reads share, writes exclude everything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// R-R is the only compatible pairing
    fn compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Read, LockMode::Read))
    }
}

/// Default priority used by engine-internal acquisitions
pub const PRIORITY_NORMAL: u8 = 1;

/// Outcome delivered to a waiting request
enum WaitSignal {
    Granted,
    Victim,
}

struct WaitingRequest {
    txn: TxnId,
    resource: String,
    mode: LockMode,
    priority: u8,
    seq: u64,
    order: u64,
    enqueued: Instant,
    signal: oneshot::Sender<WaitSignal>,
}

#[derive(Default)]
struct LockRecord {
    holders: HashMap<TxnId, LockMode>,
    /// Kept sorted by (priority desc, seq asc)
    queue: Vec<WaitingRequest>,
}

impl LockRecord {
    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn insert_sorted(&mut self, request: WaitingRequest) {
        let at = self
            .queue
            .iter()
            .position(|r| (std::cmp::Reverse(r.priority), r.seq) > (std::cmp::Reverse(request.priority), request.seq))
            .unwrap_or(self.queue.len());
        self.queue.insert(at, request);
    }

    /// Can `txn` hold `mode` given the current holders (ignoring itself)?
    fn grantable(&self, txn: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(holder, _)| **holder != txn)
            .all(|(_, held)| mode.compatible(*held))
    }

    fn has_queued_writer(&self) -> bool {
        self.queue.iter().any(|r| r.mode == LockMode::Write)
    }
}

struct TxnState {
    /// resource -> (mode, hierarchy order)
    held: HashMap<String, (LockMode, u64)>,
    started: Instant,
}

impl TxnState {
    fn max_order(&self) -> Option<u64> {
        self.held.values().map(|(_, order)| *order).max()
    }
}

/// Sliding-window adaptive timeout
struct AdaptiveTimeout {
    base_ms: u64,
    factor: f64,
    current_ms: AtomicU64,
    window: Mutex<VecDeque<(u64, bool)>>,
}

const TIMEOUT_WINDOW: usize = 100;
const TIMEOUT_MIN_SAMPLES: usize = 8;

impl AdaptiveTimeout {
    fn new(base_ms: u64, factor: f64) -> Self {
        Self {
            base_ms,
            factor,
            current_ms: AtomicU64::new(base_ms),
            window: Mutex::new(VecDeque::with_capacity(TIMEOUT_WINDOW)),
        }
    }

    fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    fn record(&self, waited: Duration, timed_out: bool) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == TIMEOUT_WINDOW {
            window.pop_front();
        }
        window.push_back((waited.as_millis() as u64, timed_out));
        if window.len() < TIMEOUT_MIN_SAMPLES {
            return;
        }

        let timeouts = window.iter().filter(|(_, t)| *t).count();
        let rate = timeouts as f64 / window.len() as f64;
        let avg_wait = window.iter().map(|(w, _)| *w).sum::<u64>() as f64 / window.len() as f64;
        let current = self.current_ms.load(Ordering::Relaxed) as f64;

        let next = if rate > 0.10 {
            current * (1.0 + self.factor)
        } else if rate < 0.05 && avg_wait * 2.0 < current {
            current * (1.0 - self.factor)
        } else {
            return;
        };
        let clamped = next.clamp(self.base_ms as f64, (self.base_ms * 5) as f64);
        self.current_ms.store(clamped as u64, Ordering::Relaxed);
    }
}

/// Point-in-time lock manager statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStats {
    pub total_locks: usize,
    pub locked_resources: usize,
    pub waiting_requests: usize,
    pub contended_resources: usize,
    pub acquisitions: u64,
    pub fast_path_acquisitions: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub deadlocks_detected: u64,
    pub hierarchy_violations: u64,
    pub adaptive_timeout_ms: u64,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    fast_path: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    deadlocks: AtomicU64,
    hierarchy_violations: AtomicU64,
}

/// Read/write lock manager with deadlock prevention and detection
pub struct LockManager {
    shards: Vec<Mutex<HashMap<String, LockRecord>>>,
    /// Stable order number per resource, assigned on first observation
    orders: DashMap<String, u64>,
    next_order: AtomicU64,
    txns: DashMap<TxnId, TxnState>,
    arrivals: AtomicU64,
    timeout: AdaptiveTimeout,
    config: LockConfig,
    counters: Counters,
    metrics: Arc<dyn MetricsSink>,
}

impl LockManager {
    pub fn new(config: LockConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            orders: DashMap::new(),
            next_order: AtomicU64::new(1),
            txns: DashMap::new(),
            arrivals: AtomicU64::new(0),
            timeout: AdaptiveTimeout::new(config.base_timeout_ms, config.adaptive_factor),
            config,
            counters: Counters::default(),
            metrics,
        }
    }

    fn shard_for(&self, resource: &str) -> &Mutex<HashMap<String, LockRecord>> {
        let mut hasher = DefaultHasher::new();
        resource.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn order_of(&self, resource: &str) -> u64 {
        *self
            .orders
            .entry(resource.to_string())
            .or_insert_with(|| self.next_order.fetch_add(1, Ordering::SeqCst))
    }

    /// Acquire `resource` in `mode` for `txn`, waiting up to `timeout`
    /// (adaptive default when `None`). Re-acquiring an already-held lock of
    /// equal or weaker mode is a no-op; a sole-holder R->W upgrade succeeds
    /// in place.
    pub async fn acquire(
        &self,
        txn: TxnId,
        resource: &str,
        mode: LockMode,
        priority: u8,
        timeout: Option<Duration>,
    ) -> MantisResult<()> {
        self.acquire_with_cancel(txn, resource, mode, priority, timeout, &CancellationToken::new())
            .await
    }

    /// [`acquire`](Self::acquire) with cooperative cancellation; a
    /// cancelled pending request leaves the queue with no side effects.
    pub async fn acquire_with_cancel(
        &self,
        txn: TxnId,
        resource: &str,
        mode: LockMode,
        priority: u8,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> MantisResult<()> {
        let order = self.order_of(resource);

        // Snapshot hierarchy state without holding the registry entry
        // across the shard mutex.
        let (already_held, max_order, holds_any) = {
            match self.txns.get(&txn) {
                Some(state) => (
                    state.held.get(resource).map(|(m, _)| *m),
                    state.max_order(),
                    !state.held.is_empty(),
                ),
                None => (None, None, false),
            }
        };

        match already_held {
            // Same mode, or a writer asking for a read: no-op success.
            Some(held) if held == mode || held == LockMode::Write => return Ok(()),
            Some(_) => {} // R -> W upgrade handled below
            None => {
                if holds_any && self.config.enforce_hierarchy {
                    if let Some(max) = max_order {
                        if order <= max {
                            self.counters
                                .hierarchy_violations
                                .fetch_add(1, Ordering::Relaxed);
                            self.metrics.incr_counter("lock_hierarchy_violations_total", 1);
                            return Err(MantisError::HierarchyViolation {
                                txn,
                                resource: resource.to_string(),
                                requested_order: order,
                                held_order: max,
                            });
                        }
                    }
                }
            }
        }

        let upgrading = already_held == Some(LockMode::Read) && mode == LockMode::Write;

        // Fast / immediate path under the shard mutex.
        let rx = {
            let mut shard = self.shard_for(resource).lock().unwrap_or_else(|e| e.into_inner());
            let record = shard.entry(resource.to_string()).or_default();

            let immediate = if record.holders.is_empty() && record.queue.is_empty() {
                // Uncontended fast path: no wait record allocated.
                self.counters.fast_path.fetch_add(1, Ordering::Relaxed);
                true
            } else if upgrading {
                record.grantable(txn, LockMode::Write)
            } else if mode == LockMode::Read {
                // Writer preference: a queued writer blocks new readers.
                record.grantable(txn, mode) && !record.has_queued_writer()
            } else {
                record.grantable(txn, mode) && record.queue.is_empty()
            };

            if immediate {
                record.holders.insert(txn, mode);
                self.register_grant(txn, resource, mode, order);
                self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter("lock_acquisitions_total", 1);
                return Ok(());
            }

            let (signal, rx) = oneshot::channel();
            record.insert_sorted(WaitingRequest {
                txn,
                resource: resource.to_string(),
                mode,
                priority,
                seq: self.arrivals.fetch_add(1, Ordering::SeqCst),
                order,
                enqueued: Instant::now(),
                signal,
            });
            rx
        };

        // Waiting: granted | timed_out | deadlock_victim | cancelled.
        let effective = timeout.unwrap_or_else(|| self.timeout.current());
        let started = Instant::now();
        let mut rx = rx;

        enum WaitEnd {
            Signal(Result<WaitSignal, oneshot::error::RecvError>),
            TimedOut,
            Cancelled,
        }

        let end = tokio::select! {
            outcome = &mut rx => WaitEnd::Signal(outcome),
            _ = tokio::time::sleep(effective) => WaitEnd::TimedOut,
            _ = cancel.cancelled() => WaitEnd::Cancelled,
        };
        let waited = started.elapsed();

        let signal: Option<WaitSignal> = match end {
            WaitEnd::Signal(outcome) => outcome.ok(),
            WaitEnd::TimedOut => {
                if self.remove_waiter(txn, resource) {
                    self.timeout.record(waited, true);
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.metrics.incr_counter("lock_timeouts_total", 1);
                    return Err(MantisError::Timeout {
                        txn,
                        resource: resource.to_string(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                // The grant (or the detector) raced the timer; honour
                // whatever was signalled.
                rx.try_recv().ok()
            }
            WaitEnd::Cancelled => {
                if self.remove_waiter(txn, resource) {
                    self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                    return Err(MantisError::Cancelled(format!(
                        "lock request for {} cancelled after {}ms",
                        resource,
                        waited.as_millis()
                    )));
                }
                rx.try_recv().ok()
            }
        };

        match signal {
            Some(WaitSignal::Granted) => {
                self.timeout.record(waited, false);
                self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter("lock_acquisitions_total", 1);
                self.metrics.observe("lock_wait_ms", waited.as_millis() as f64);
                Ok(())
            }
            Some(WaitSignal::Victim) => {
                self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter("lock_deadlock_victims_total", 1);
                Err(MantisError::DeadlockVictim {
                    txn,
                    resource: resource.to_string(),
                })
            }
            None => Err(MantisError::Cancelled(format!(
                "lock request for {} dropped",
                resource
            ))),
        }
    }

    /// Remove `txn`'s pending request; true when it was still queued
    fn remove_waiter(&self, txn: TxnId, resource: &str) -> bool {
        let mut shard = self.shard_for(resource).lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = shard.get_mut(resource) else {
            return false;
        };
        let before = record.queue.len();
        record.queue.retain(|r| r.txn != txn);
        let removed = record.queue.len() < before;
        if removed {
            // Removing a writer may unblock a batch of readers behind it.
            Self::grant_waiters(record, &self.txns);
        }
        if record.is_empty() {
            shard.remove(resource);
        }
        removed
    }

    fn register_grant(&self, txn: TxnId, resource: &str, mode: LockMode, order: u64) {
        let mut state = self.txns.entry(txn).or_insert_with(|| TxnState {
            held: HashMap::new(),
            started: Instant::now(),
        });
        state.held.insert(resource.to_string(), (mode, order));
    }

    /// Grant as much of the queue head as compatibility allows: a writer
    /// alone, or the whole leading batch of readers before the next writer.
    fn grant_waiters(record: &mut LockRecord, txns: &DashMap<TxnId, TxnState>) {
        let Some(front) = record.queue.first() else { return };

        match front.mode {
            LockMode::Write => {
                if !record.grantable(front.txn, LockMode::Write) {
                    return;
                }
                let request = record.queue.remove(0);
                record.holders.insert(request.txn, LockMode::Write);
                let mut state = txns.entry(request.txn).or_insert_with(|| TxnState {
                    held: HashMap::new(),
                    started: Instant::now(),
                });
                state
                    .held
                    .insert(request.resource.clone(), (LockMode::Write, request.order));
                drop(state);
                // A granted writer excludes everything behind it.
                let _ = request.signal.send(WaitSignal::Granted);
            }
            LockMode::Read => {
                if !record.grantable(front.txn, LockMode::Read) {
                    return;
                }
                // Atomic batch: every leading reader up to the first queued
                // writer is granted together.
                let batch_len = record
                    .queue
                    .iter()
                    .position(|r| r.mode == LockMode::Write)
                    .unwrap_or(record.queue.len());
                let batch: Vec<WaitingRequest> = record.queue.drain(..batch_len).collect();
                for request in batch {
                    record.holders.insert(request.txn, LockMode::Read);
                    let mut state = txns.entry(request.txn).or_insert_with(|| TxnState {
                        held: HashMap::new(),
                        started: Instant::now(),
                    });
                    state
                        .held
                        .insert(request.resource.clone(), (LockMode::Read, request.order));
                    drop(state);
                    let _ = request.signal.send(WaitSignal::Granted);
                }
            }
        }
    }

    /// Release one lock; releasing a lock the transaction does not hold is
    /// a no-op.
    pub fn release(&self, txn: TxnId, resource: &str) -> MantisResult<()> {
        {
            let mut shard = self.shard_for(resource).lock().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = shard.get_mut(resource) {
                if record.holders.remove(&txn).is_some() {
                    Self::grant_waiters(record, &self.txns);
                }
                if record.is_empty() {
                    shard.remove(resource);
                }
            }
        }
        if let Some(mut state) = self.txns.get_mut(&txn) {
            state.held.remove(resource);
            if state.held.is_empty() {
                drop(state);
                self.txns.remove_if(&txn, |_, s| s.held.is_empty());
            }
        }
        Ok(())
    }

    /// Release every lock held by `txn`; calling twice is equivalent to
    /// calling once.
    pub fn release_all(&self, txn: TxnId) -> MantisResult<()> {
        let Some((_, state)) = self.txns.remove(&txn) else {
            return Ok(());
        };
        for resource in state.held.keys() {
            let mut shard = self.shard_for(resource).lock().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = shard.get_mut(resource.as_str()) {
                if record.holders.remove(&txn).is_some() {
                    Self::grant_waiters(record, &self.txns);
                }
                if record.is_empty() {
                    shard.remove(resource.as_str());
                }
            }
        }
        debug!("🔓 Released all locks of txn {} ({} resources)", txn, state.held.len());
        Ok(())
    }

    /// Abort `txn`'s pending request (signalling `DeadlockVictim`) and
    /// release everything it holds. Used by the deadlock detector.
    pub(crate) fn victimize(&self, txn: TxnId) {
        // Signal any pending requests across the shards.
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            let mut emptied = Vec::new();
            for (resource, record) in shard.iter_mut() {
                let mut signalled = Vec::new();
                record.queue.retain_mut(|r| {
                    if r.txn == txn {
                        signalled.push(r.signal_placeholder());
                        false
                    } else {
                        true
                    }
                });
                for signal in signalled {
                    let _ = signal.send(WaitSignal::Victim);
                }
                Self::grant_waiters(record, &self.txns);
                if record.is_empty() {
                    emptied.push(resource.clone());
                }
            }
            for resource in emptied {
                shard.remove(&resource);
            }
        }
        let _ = self.release_all(txn);
        info!("⚔️ Deadlock victim txn {} aborted and released", txn);
    }

    /// Shard-by-shard wait-for snapshot for the detector: an edge t_i ->
    /// t_j means t_i waits on a resource where t_j holds a conflicting
    /// lock.
    pub(crate) fn wait_graph(&self) -> deadlock::WaitGraph {
        let mut graph = deadlock::WaitGraph::default();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            for (resource, record) in shard.iter() {
                for request in &record.queue {
                    graph
                        .waiting_at
                        .entry(request.txn)
                        .or_insert_with(|| (resource.clone(), request.enqueued.elapsed()));
                    for (holder, held) in &record.holders {
                        if *holder != request.txn && !request.mode.compatible(*held) {
                            graph.add_edge(request.txn, *holder);
                        }
                    }
                }
            }
        }
        for entry in self.txns.iter() {
            graph
                .txn_info
                .insert(*entry.key(), (entry.value().held.len(), entry.value().started));
        }
        graph
    }

    pub(crate) fn note_deadlock_broken(&self) {
        self.metrics.incr_counter("lock_deadlocks_broken_total", 1);
    }

    pub(crate) fn detector_config(&self) -> &LockConfig {
        &self.config
    }

    /// Current statistics
    pub fn stats(&self) -> LockStats {
        let mut total_locks = 0;
        let mut locked_resources = 0;
        let mut waiting = 0;
        let mut contended = 0;
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            for record in shard.values() {
                total_locks += record.holders.len();
                if !record.holders.is_empty() {
                    locked_resources += 1;
                }
                waiting += record.queue.len();
                if !record.queue.is_empty() {
                    contended += 1;
                }
            }
        }
        LockStats {
            total_locks,
            locked_resources,
            waiting_requests: waiting,
            contended_resources: contended,
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            fast_path_acquisitions: self.counters.fast_path.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            deadlocks_detected: self.counters.deadlocks.load(Ordering::Relaxed),
            hierarchy_violations: self.counters.hierarchy_violations.load(Ordering::Relaxed),
            adaptive_timeout_ms: self.timeout.current().as_millis() as u64,
        }
    }

    /// True when `txn` currently holds `resource`
    pub fn holds(&self, txn: TxnId, resource: &str) -> bool {
        self.txns
            .get(&txn)
            .map(|state| state.held.contains_key(resource))
            .unwrap_or(false)
    }
}

impl WaitingRequest {
    /// Take the signal sender out of a request that is being destroyed
    fn signal_placeholder(&mut self) -> oneshot::Sender<WaitSignal> {
        let (replacement, _) = oneshot::channel();
        std::mem::replace(&mut self.signal, replacement)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.shards.len())
            .finish()
    }
}
