//! MantisDb engine
//!
//! Wires the components together: client operation -> lock manager ->
//! WAL append -> copy-on-write hook -> store mutation -> cache update; a
//! commit record's fsync makes the transaction durable. Checkpoints seal a
//! WAL prefix from a committed-state view (active transactions are
//! reverted out via their undo logs), and snapshots anchor on a checkpoint
//! LSN with per-page COW while writers continue.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheStats, MemoryMonitor};
use crate::config::MantisConfig;
use crate::error::{MantisError, MantisResult};
use crate::integrity::{ChecksumAlgorithm, IntegrityManager, IntegrityScanner};
use crate::lock::{DeadlockDetector, LockManager, LockMode, LockStats, PRIORITY_NORMAL};
use crate::metrics::{HealthReport, MetricsSink, NullMetrics};
use crate::runtime::RuntimeHandle;
use crate::storage::checkpoint::{
    CheckpointData, CheckpointEntry, CheckpointKind, CheckpointManager, PinRegistry,
    RecoveredState, RecoveryManager, RecoveryOptions,
};
use crate::storage::snapshot::{
    BackupReport, CronSchedule, PageId, ScheduleStore, SnapshotId, SnapshotManager,
    SnapshotMetadata,
};
use crate::storage::wal::{TxnId, WALManager, WalOp, WalPayload, LSN};

/// Engine-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub keys: usize,
    pub current_lsn: LSN,
    pub durable_lsn: LSN,
    pub active_transactions: usize,
    pub active_snapshots: usize,
}

struct StoredRecord {
    page_id: PageId,
    value: Vec<u8>,
}

/// Per-transaction undo log: the pre-image of every mutated key, in
/// mutation order
#[derive(Default)]
struct TxnState {
    undo: Vec<(String, Option<Vec<u8>>)>,
    /// LSN of the transaction's first mutation; checkpoints taken while
    /// the transaction is active must keep the log replayable from here
    first_lsn: Option<LSN>,
}

#[derive(Default)]
struct DirtySet {
    changed: HashSet<String>,
    removed: HashSet<String>,
}

/// Sharded in-memory record store with stable page ids
struct DataStore {
    shards: Vec<RwLock<HashMap<String, StoredRecord>>>,
    page_ids: DashMap<String, PageId>,
    next_page_id: AtomicU64,
    dirty: Mutex<DirtySet>,
}

impl DataStore {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            page_ids: DashMap::new(),
            next_page_id: AtomicU64::new(1),
            dirty: Mutex::new(DirtySet::default()),
        }
    }

    fn shard_for(&self, key: &str) -> &RwLock<HashMap<String, StoredRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Stable page id for a key, assigned on first use and never reused
    fn page_id_of(&self, key: &str) -> PageId {
        *self
            .page_ids
            .entry(key.to_string())
            .or_insert_with(|| self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let shard = self.shard_for(key).read().unwrap_or_else(|e| e.into_inner());
        shard.get(key).map(|r| r.value.clone())
    }

    /// Insert or replace; returns (page id, previous value)
    fn apply_put(&self, key: &str, value: Vec<u8>) -> (PageId, Option<Vec<u8>>) {
        let page_id = self.page_id_of(key);
        let mut shard = self.shard_for(key).write().unwrap_or_else(|e| e.into_inner());
        let prev = shard
            .insert(key.to_string(), StoredRecord { page_id, value })
            .map(|r| r.value);
        (page_id, prev)
    }

    /// Remove; returns (page id, previous value) when the key existed
    fn apply_delete(&self, key: &str) -> Option<(PageId, Vec<u8>)> {
        let mut shard = self.shard_for(key).write().unwrap_or_else(|e| e.into_inner());
        shard.remove(key).map(|r| (r.page_id, r.value))
    }

    fn mark_changed(&self, key: &str) {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        dirty.removed.remove(key);
        dirty.changed.insert(key.to_string());
    }

    fn mark_removed(&self, key: &str) {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        dirty.changed.remove(key);
        dirty.removed.insert(key.to_string());
    }

    fn take_dirty(&self) -> DirtySet {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut dirty)
    }

    fn restore_dirty(&self, set: DirtySet) {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        dirty.changed.extend(set.changed);
        dirty.removed.extend(set.removed);
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Full copy of the applied state
    fn full_view(&self) -> HashMap<String, Vec<u8>> {
        let mut view = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(|e| e.into_inner());
            for (key, record) in shard.iter() {
                view.insert(key.clone(), record.value.clone());
            }
        }
        view
    }
}

/// Embeddable key-value database engine
pub struct MantisDb {
    config: Arc<MantisConfig>,
    runtime: RuntimeHandle,
    wal: Arc<WALManager>,
    checkpoints: Arc<CheckpointManager>,
    locks: Arc<LockManager>,
    cache: Arc<Cache>,
    snapshots: Arc<SnapshotManager>,
    integrity: Arc<IntegrityManager>,
    schedules: Arc<ScheduleStore>,
    store: DataStore,
    /// page id -> snapshot ids interested in COW, populated at snapshot
    /// creation, cleared at snapshot destruction
    cow_index: DashMap<PageId, Vec<SnapshotId>>,
    txns: DashMap<TxnId, TxnState>,
    next_txn: AtomicU64,
    /// Writers share this latch; checkpoint/snapshot capture takes it
    /// exclusively so the sealed view never tears mid-operation.
    apply_latch: tokio::sync::RwLock<()>,
}

impl MantisDb {
    /// Open the database, recovering persisted state
    pub async fn open(config: MantisConfig) -> MantisResult<Arc<Self>> {
        Self::open_with(config, RecoveryOptions::default(), Arc::new(NullMetrics)).await
    }

    /// Open with explicit recovery options and metrics sink
    pub async fn open_with(
        config: MantisConfig,
        recovery_options: RecoveryOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> MantisResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let runtime = RuntimeHandle::new(metrics);

        tokio::fs::create_dir_all(&config.data_dir).await?;
        tokio::fs::create_dir_all(config.snapshot_dir()).await?;

        let algorithm = ChecksumAlgorithm::from_name(&config.integrity.algorithm)?;
        let integrity = Arc::new(IntegrityManager::new(algorithm));
        let wal = Arc::new(
            WALManager::open(
                config.wal.clone(),
                config.wal_dir(),
                Arc::clone(&integrity),
                Arc::clone(&runtime.metrics),
            )
            .await?,
        );
        let pins = Arc::new(PinRegistry::default());
        let checkpoints = Arc::new(
            CheckpointManager::open(
                config.checkpoint_dir(),
                Arc::clone(&wal),
                Arc::clone(&integrity),
                Arc::clone(&pins),
                runtime.clone(),
            )
            .await?,
        );

        let recovery =
            RecoveryManager::new(Arc::clone(&checkpoints), Arc::clone(&wal), runtime.clone());
        let mut options = recovery_options;
        options.validate = options.validate || config.checkpoint.validate_on_recovery;
        let checkpoint_after = options.checkpoint_after;
        let recovered: RecoveredState = recovery.recover(options).await?;

        let store = DataStore::new(config.cache.shards);
        for (key, value) in &recovered.data {
            store.apply_put(key, value.clone());
        }

        let locks = Arc::new(LockManager::new(
            config.lock.clone(),
            Arc::clone(&runtime.metrics),
        ));
        let cache = Arc::new(Cache::new(
            config.cache.clone(),
            Arc::clone(&runtime.metrics),
        )?);
        let snapshots = Arc::new(SnapshotManager::new(
            config.snapshot.clone(),
            Arc::clone(&pins),
            runtime.clone(),
        ));
        let schedules = Arc::new(ScheduleStore::open(config.schedule_path()).await?);

        let db = Arc::new(Self {
            config: Arc::clone(&config),
            runtime: runtime.clone(),
            wal,
            checkpoints,
            locks,
            cache,
            snapshots,
            integrity,
            schedules,
            store,
            cow_index: DashMap::new(),
            txns: DashMap::new(),
            next_txn: AtomicU64::new(recovered.max_txn_id + 1),
            apply_latch: tokio::sync::RwLock::new(()),
        });

        db.spawn_background_tasks();
        if checkpoint_after {
            db.checkpoint(CheckpointKind::Full, HashMap::new()).await?;
        }

        info!(
            "🚀 MantisDb open at {}: {} key(s) recovered, LSN {}",
            config.data_dir.display(),
            db.store.len(),
            db.wal.current_lsn()
        );
        Ok(db)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        if let Ok(detector) = DeadlockDetector::new(Arc::clone(&self.locks)) {
            detector.spawn(self.runtime.clone());
        }
        if self.config.cache.sweep_interval_secs > 0 {
            self.cache.spawn_sweeper(
                self.runtime.clone(),
                Duration::from_secs(self.config.cache.sweep_interval_secs),
            );
        }
        if self.config.cache.memory_sample_interval_secs > 0 {
            MemoryMonitor::new(
                Arc::clone(&self.cache),
                self.config.cache.memory_pressure_threshold,
                Duration::from_secs(self.config.cache.memory_sample_interval_secs),
            )
            .spawn(self.runtime.clone());
        }
        if self.config.integrity.scan_interval_secs > 0 {
            let scanner = Arc::new(IntegrityScanner::new(
                self.config.checkpoint_dir(),
                Arc::clone(&self.integrity),
            ));
            scanner.spawn(
                self.runtime.clone(),
                Duration::from_secs(self.config.integrity.scan_interval_secs),
            );
        }
        if self.config.checkpoint.interval_secs > 0 {
            let db = Arc::clone(self);
            let interval = Duration::from_secs(self.config.checkpoint.interval_secs);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = db.runtime.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = db.checkpoint(CheckpointKind::Full, HashMap::new()).await {
                        warn!("Periodic checkpoint failed: {}", e);
                    }
                }
            });
        }
    }

    fn ensure_running(&self) -> MantisResult<()> {
        if self.runtime.is_shutting_down() {
            return Err(MantisError::ShuttingDown("engine".to_string()));
        }
        Ok(())
    }

    fn resource_of(key: &str) -> String {
        format!("key:{}", key)
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache.default_ttl_secs)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start an explicit transaction
    pub fn begin(&self) -> MantisResult<TxnId> {
        self.ensure_running()?;
        let txn = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.txns.insert(txn, TxnState::default());
        debug!("🆕 Transaction {} started", txn);
        Ok(txn)
    }

    fn txn_known(&self, txn: TxnId) -> MantisResult<()> {
        if self.txns.contains_key(&txn) {
            Ok(())
        } else {
            Err(MantisError::not_found(format!("transaction {}", txn)))
        }
    }

    /// Write a key inside a transaction; durable once the transaction
    /// commits.
    pub async fn txn_put(&self, txn: TxnId, key: &str, value: &[u8]) -> MantisResult<LSN> {
        self.ensure_running()?;
        self.txn_known(txn)?;
        self.locks
            .acquire(txn, &Self::resource_of(key), LockMode::Write, PRIORITY_NORMAL, None)
            .await?;

        let _apply = self.apply_latch.read().await;
        let prev = self.store.get(key);
        let op = if prev.is_some() { WalOp::Update } else { WalOp::Insert };
        let lsn = self
            .wal
            .append(
                txn,
                op,
                WalPayload::mutation(key, Some(value.to_vec()), prev.clone()),
            )
            .await?;

        // COW before the store changes: interested snapshots capture the
        // pre-write content of this page.
        if let Some(pre_image) = &prev {
            self.trigger_cow(self.store.page_id_of(key), pre_image);
        }

        self.store.apply_put(key, value.to_vec());
        self.store.mark_changed(key);
        if let Some(mut state) = self.txns.get_mut(&txn) {
            state.undo.push((key.to_string(), prev));
            state.first_lsn.get_or_insert(lsn);
        }
        let _ = self.cache.put(key, value.to_vec(), self.default_ttl());
        Ok(lsn)
    }

    /// Delete a key inside a transaction; true when the key existed
    pub async fn txn_delete(&self, txn: TxnId, key: &str) -> MantisResult<bool> {
        self.ensure_running()?;
        self.txn_known(txn)?;
        self.locks
            .acquire(txn, &Self::resource_of(key), LockMode::Write, PRIORITY_NORMAL, None)
            .await?;

        let _apply = self.apply_latch.read().await;
        let Some(prev) = self.store.get(key) else {
            return Ok(false);
        };
        let lsn = self
            .wal
            .append(txn, WalOp::Delete, WalPayload::mutation(key, None, Some(prev.clone())))
            .await?;
        self.trigger_cow(self.store.page_id_of(key), &prev);
        self.store.apply_delete(key);
        self.store.mark_removed(key);
        if let Some(mut state) = self.txns.get_mut(&txn) {
            state.undo.push((key.to_string(), Some(prev)));
            state.first_lsn.get_or_insert(lsn);
        }
        self.cache.delete(key);
        Ok(true)
    }

    /// Read a key inside a transaction (shared lock held until the
    /// transaction ends)
    pub async fn txn_get(&self, txn: TxnId, key: &str) -> MantisResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        self.txn_known(txn)?;
        self.locks
            .acquire(txn, &Self::resource_of(key), LockMode::Read, PRIORITY_NORMAL, None)
            .await?;
        Ok(self.read_through(key))
    }

    /// Commit: the commit record's fsync flushes the whole group, then
    /// locks release.
    pub async fn commit(&self, txn: TxnId) -> MantisResult<LSN> {
        // Removing the transaction from the table is what makes its writes
        // count as committed in the clean view, so it must not become
        // visible to an exclusive checkpoint capture before the commit
        // record is durable.
        let _apply = self.apply_latch.read().await;
        let Some((_, _state)) = self.txns.remove(&txn) else {
            return Err(MantisError::not_found(format!("transaction {}", txn)));
        };
        let result = self
            .wal
            .append_commit(txn, self.runtime.clock.now().timestamp_micros())
            .await;
        // Locks release even when the commit write fails.
        self.locks.release_all(txn)?;
        let lsn = result?;
        self.runtime.metrics.incr_counter("txn_commits_total", 1);
        debug!("✅ Transaction {} committed at LSN {}", txn, lsn);
        Ok(lsn)
    }

    /// Abort: restore pre-images in reverse order, log the abort, release
    /// locks.
    pub async fn abort(&self, txn: TxnId) -> MantisResult<()> {
        // Same latch discipline as commit: the table removal and the undo
        // replay form one unit against checkpoint captures.
        let state = {
            let _apply = self.apply_latch.read().await;
            let Some((_, state)) = self.txns.remove(&txn) else {
                return Err(MantisError::not_found(format!("transaction {}", txn)));
            };
            for (key, prev) in state.undo.iter().rev() {
                match prev {
                    Some(value) => {
                        if let Some(current) = self.store.get(key) {
                            self.trigger_cow(self.store.page_id_of(key), &current);
                        }
                        self.store.apply_put(key, value.clone());
                        self.store.mark_changed(key);
                        let _ = self.cache.put(key, value.clone(), self.default_ttl());
                    }
                    None => {
                        if let Some((page_id, current)) = self.store.apply_delete(key) {
                            self.trigger_cow(page_id, &current);
                        }
                        self.store.mark_removed(key);
                        self.cache.delete(key);
                    }
                }
            }
            state
        };
        self.wal
            .append(txn, WalOp::Abort, WalPayload::control(self.runtime.clock.now().timestamp_micros()))
            .await?;
        self.locks.release_all(txn)?;
        self.runtime.metrics.incr_counter("txn_aborts_total", 1);
        info!("↩️ Transaction {} aborted ({} op(s) reverted)", txn, state.undo.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-operation conveniences
    // ------------------------------------------------------------------

    /// Auto-committed put
    pub async fn put(&self, key: &str, value: &[u8]) -> MantisResult<LSN> {
        let txn = self.begin()?;
        match self.txn_put(txn, key, value).await {
            Ok(_) => self.commit(txn).await,
            Err(e) => {
                let _ = self.abort(txn).await;
                Err(e)
            }
        }
    }

    /// Auto-committed delete; true when the key existed
    pub async fn delete(&self, key: &str) -> MantisResult<bool> {
        let txn = self.begin()?;
        match self.txn_delete(txn, key).await {
            Ok(existed) => {
                self.commit(txn).await?;
                Ok(existed)
            }
            Err(e) => {
                let _ = self.abort(txn).await;
                Err(e)
            }
        }
    }

    /// Read a key: a short shared lock orders the read against writers,
    /// then the cache serves or fills from the store.
    pub async fn get(&self, key: &str) -> MantisResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        let reader = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.locks
            .acquire(reader, &Self::resource_of(key), LockMode::Read, PRIORITY_NORMAL, None)
            .await?;
        let value = self.read_through(key);
        self.locks.release_all(reader)?;
        Ok(value)
    }

    fn read_through(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(hit) = self.cache.get(key) {
            return Some(hit);
        }
        let value = self.store.get(key)?;
        let _ = self.cache.put(key, value.clone(), self.default_ttl());
        Some(value)
    }

    // ------------------------------------------------------------------
    // Copy-on-write plumbing
    // ------------------------------------------------------------------

    fn trigger_cow(&self, page_id: PageId, pre_image: &[u8]) {
        if let Some(interested) = self.cow_index.get(&page_id) {
            for snapshot_id in interested.iter() {
                self.snapshots.freeze_page(*snapshot_id, page_id, pre_image);
            }
        }
    }

    fn deregister_cow(&self, snapshot_id: SnapshotId) {
        self.cow_index.retain(|_, interested| {
            interested.retain(|id| *id != snapshot_id);
            !interested.is_empty()
        });
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// The committed-state view: applied store contents with every active
    /// transaction's effects reverted through its undo log.
    fn clean_view(&self) -> HashMap<String, Vec<u8>> {
        let mut view = self.store.full_view();
        for entry in self.txns.iter() {
            for (key, prev) in entry.value().undo.iter().rev() {
                match prev {
                    Some(value) => {
                        view.insert(key.clone(), value.clone());
                    }
                    None => {
                        view.remove(key);
                    }
                }
            }
        }
        view
    }

    /// Write a checkpoint sealing the committed state up to the flushed
    /// LSN; a completed full checkpoint resets the incremental dirty set.
    pub async fn checkpoint(
        &self,
        kind: CheckpointKind,
        tags: HashMap<String, String>,
    ) -> MantisResult<CheckpointEntry> {
        self.ensure_running()?;
        let _exclusive = self.apply_latch.write().await;
        self.checkpoint_locked(kind, tags).await
    }

    async fn checkpoint_locked(
        &self,
        kind: CheckpointKind,
        tags: HashMap<String, String>,
    ) -> MantisResult<CheckpointEntry> {
        let clean = self.clean_view();
        let dirty = self.store.take_dirty();

        let data = match kind {
            CheckpointKind::Full => {
                let mut pairs: Vec<(String, Vec<u8>)> = clean.into_iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                CheckpointData {
                    pairs,
                    removed: Vec::new(),
                }
            }
            CheckpointKind::Incremental => {
                let mut pairs = Vec::new();
                let mut removed: Vec<String> = dirty.removed.iter().cloned().collect();
                for key in &dirty.changed {
                    match clean.get(key) {
                        Some(value) => pairs.push((key.clone(), value.clone())),
                        None => removed.push(key.clone()),
                    }
                }
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                removed.sort();
                removed.dedup();
                CheckpointData { pairs, removed }
            }
        };

        // Transactions straddling this checkpoint keep the log replayable
        // from their first mutation.
        let replay_floor = self.txns.iter().filter_map(|e| e.value().first_lsn).min();

        match self.checkpoints.create(kind, data, tags, replay_floor).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                // A failed checkpoint must not lose the delta tracking.
                self.store.restore_dirty(dirty);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshots and backups
    // ------------------------------------------------------------------

    /// Create a hot-backup snapshot: checkpoint, pin the anchor LSN,
    /// capture page refs and register COW interest - all under the
    /// exclusive apply latch so the anchor view cannot tear.
    pub async fn create_snapshot(
        &self,
        tags: HashMap<String, String>,
    ) -> MantisResult<SnapshotMetadata> {
        self.ensure_running()?;
        let id = self.snapshots.begin(tags.clone())?;
        match self.create_snapshot_inner(id, tags).await {
            Ok(meta) => Ok(meta),
            Err(e) => {
                self.snapshots.fail_creation(id, &e);
                self.deregister_cow(id);
                Err(e)
            }
        }
    }

    async fn create_snapshot_inner(
        &self,
        id: SnapshotId,
        tags: HashMap<String, String>,
    ) -> MantisResult<SnapshotMetadata> {
        let _exclusive = self.apply_latch.write().await;

        // Provisional pin so a concurrent checkpoint cannot truncate away
        // the range while this one completes.
        self.snapshots.anchor(id, self.wal.current_lsn())?;
        let entry = self.checkpoint_locked(CheckpointKind::Full, tags).await?;
        self.snapshots.anchor(id, entry.lsn)?;

        let clean = self.clean_view();
        let mut pages: Vec<(PageId, String)> = clean
            .keys()
            .map(|key| (self.store.page_id_of(key), key.clone()))
            .collect();
        pages.sort_by_key(|(page_id, _)| *page_id);

        for (page_id, _) in &pages {
            self.cow_index.entry(*page_id).or_default().push(id);
        }
        self.snapshots.attach_pages(id, pages)?;

        // Pages owned by in-flight transactions already differ from the
        // committed anchor view; freeze them now so later writes cannot
        // leak into the stream.
        for entry in self.txns.iter() {
            for (key, _) in &entry.value().undo {
                if let Some(anchor_value) = clean.get(key) {
                    self.snapshots
                        .freeze_page(id, self.store.page_id_of(key), anchor_value);
                }
            }
        }

        self.snapshots.get(id)
    }

    /// Stream a snapshot to a destination URL; COW registrations are
    /// dropped afterwards on success and failure alike.
    pub async fn stream_backup(
        &self,
        id: SnapshotId,
        destination: &str,
    ) -> MantisResult<BackupReport> {
        self.ensure_running()?;
        let result = self
            .snapshots
            .stream_backup(id, destination, |key| self.store.get(key))
            .await;
        self.deregister_cow(id);
        result
    }

    /// Create a snapshot and stream it in one call (CLI `backup create`)
    pub async fn backup_to(
        &self,
        destination: &str,
        tags: HashMap<String, String>,
    ) -> MantisResult<BackupReport> {
        let meta = self.create_snapshot(tags).await?;
        self.stream_backup(meta.id, destination).await
    }

    /// Delete a snapshot; the second call reports `NotFound`.
    pub fn delete_snapshot(&self, id: SnapshotId) -> MantisResult<SnapshotMetadata> {
        let meta = self.snapshots.delete(id)?;
        self.deregister_cow(id);
        Ok(meta)
    }

    /// Run every due schedule: snapshot, stream, record the run, apply
    /// retention.
    pub async fn run_due_backups(&self, cron: &dyn CronSchedule) -> MantisResult<usize> {
        let now = self.runtime.clock.now();
        let due = self.schedules.due(now, cron).await;
        let mut ran = 0;
        for schedule in due {
            match self.backup_to(&schedule.destination, schedule.tags.clone()).await {
                Ok(report) => {
                    self.schedules.mark_ran(schedule.id, now).await?;
                    self.snapshots.apply_retention(&schedule.retention, now);
                    ran += 1;
                    info!(
                        "📅 Scheduled backup {} -> {} ({} bytes)",
                        schedule.id, schedule.destination, report.bytes_streamed
                    );
                }
                Err(e) => warn!("Scheduled backup {} failed: {}", schedule.id, e),
            }
        }
        Ok(ran)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            keys: self.store.len(),
            current_lsn: self.wal.current_lsn(),
            durable_lsn: self.wal.durable_lsn(),
            active_transactions: self.txns.len(),
            active_snapshots: self.snapshots.list().len(),
        }
    }

    pub async fn list_checkpoints(&self) -> Vec<CheckpointEntry> {
        self.checkpoints.list().await
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotMetadata> {
        self.snapshots.list()
    }

    pub fn snapshot_progress(&self, id: SnapshotId) -> MantisResult<(u64, u64, u64)> {
        self.snapshots.progress(id)
    }

    pub fn schedules(&self) -> Arc<ScheduleStore> {
        Arc::clone(&self.schedules)
    }

    pub fn integrity(&self) -> Arc<IntegrityManager> {
        Arc::clone(&self.integrity)
    }

    pub fn wal(&self) -> Arc<WALManager> {
        Arc::clone(&self.wal)
    }

    pub fn config(&self) -> Arc<MantisConfig> {
        Arc::clone(&self.config)
    }

    /// Component health probes
    pub async fn health_check(&self) -> Vec<HealthReport> {
        let mut reports = Vec::new();

        let wal_healthy = self.wal.durable_lsn() <= self.wal.current_lsn();
        reports.push(if wal_healthy {
            HealthReport::healthy("wal")
        } else {
            HealthReport::unhealthy("wal", "durable LSN ahead of assigned LSN")
        });

        let cache_stats = self.cache.stats();
        reports.push(if cache_stats.current_size_bytes <= cache_stats.max_size_bytes {
            HealthReport::healthy("cache")
        } else {
            HealthReport::unhealthy(
                "cache",
                format!(
                    "size {} exceeds budget {}",
                    cache_stats.current_size_bytes, cache_stats.max_size_bytes
                ),
            )
        });

        let catalog = self.checkpoints.list().await;
        let corrupted = catalog
            .iter()
            .filter(|e| e.status == crate::storage::checkpoint::CheckpointStatus::Corrupted)
            .count();
        reports.push(if corrupted == 0 {
            HealthReport::healthy("checkpoints")
        } else {
            HealthReport::unhealthy("checkpoints", format!("{} corrupted artifact(s)", corrupted))
        });

        reports.push(if self.runtime.is_shutting_down() {
            HealthReport::unhealthy("engine", "shutting down")
        } else {
            HealthReport::healthy("engine")
        });
        reports
    }

    /// Stop background tasks and flush the log; subsequent operations
    /// report `ShuttingDown`.
    pub async fn shutdown(&self) -> MantisResult<()> {
        info!("🛑 MantisDb shutting down");
        self.runtime.shutdown.cancel();
        self.wal.sync().await?;
        Ok(())
    }

    /// Data directory this engine runs against
    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir.clone()
    }
}

impl std::fmt::Debug for MantisDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MantisDb")
            .field("data_dir", &self.config.data_dir)
            .field("keys", &self.store.len())
            .field("current_lsn", &self.wal.current_lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_db(temp: &TempDir) -> Arc<MantisDb> {
        let mut config = MantisConfig::with_data_dir(temp.path().join("data"));
        config.checkpoint.interval_secs = 0;
        config.cache.memory_sample_interval_secs = 0;
        config.cache.sweep_interval_secs = 0;
        MantisDb::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;

        db.put("user:1", b"alice").await.unwrap();
        assert_eq!(db.get("user:1").await.unwrap(), Some(b"alice".to_vec()));

        assert!(db.delete("user:1").await.unwrap());
        assert_eq!(db.get("user:1").await.unwrap(), None);
        assert!(!db.delete("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_recovers_committed_state() {
        let temp = TempDir::new().unwrap();
        {
            let db = open_db(&temp).await;
            db.put("a", b"1").await.unwrap();
            db.put("b", b"2").await.unwrap();
            db.shutdown().await.unwrap();
        }
        let db = open_db(&temp).await;
        assert_eq!(db.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_abort_restores_previous_values() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("k", b"committed").await.unwrap();

        let txn = db.begin().unwrap();
        db.txn_put(txn, "k", b"tentative").await.unwrap();
        db.txn_put(txn, "fresh", b"new").await.unwrap();
        db.abort(txn).await.unwrap();

        assert_eq!(db.get("k").await.unwrap(), Some(b"committed".to_vec()));
        assert_eq!(db.get("fresh").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uncommitted_work_lost_on_restart() {
        let temp = TempDir::new().unwrap();
        {
            let db = open_db(&temp).await;
            db.put("durable", b"yes").await.unwrap();
            let txn = db.begin().unwrap();
            db.txn_put(txn, "volatile", b"no").await.unwrap();
            // No commit: the transaction never becomes durable.
            db.wal().sync().await.unwrap();
        }
        let db = open_db(&temp).await;
        assert_eq!(db.get("durable").await.unwrap(), Some(b"yes".to_vec()));
        assert_eq!(db.get("volatile").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_excludes_active_transactions() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("stable", b"1").await.unwrap();

        let txn = db.begin().unwrap();
        db.txn_put(txn, "stable", b"dirty").await.unwrap();
        db.txn_put(txn, "extra", b"dirty").await.unwrap();

        let entry = db.checkpoint(CheckpointKind::Full, HashMap::new()).await.unwrap();
        assert_eq!(entry.status, crate::storage::checkpoint::CheckpointStatus::Completed);
        db.abort(txn).await.unwrap();

        // Recovery from that checkpoint sees only committed state.
        db.shutdown().await.unwrap();
        let db = open_db(&temp).await;
        assert_eq!(db.get("stable").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get("extra").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_streams_anchor_state() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("k", b"old").await.unwrap();

        let meta = db.create_snapshot(HashMap::new()).await.unwrap();
        db.put("k", b"new").await.unwrap();

        let target = temp.path().join("backup.snap");
        let location = format!("file://{}", target.display());
        let report = db.stream_backup(meta.id, &location).await.unwrap();
        assert!(report.verified);

        let bytes = std::fs::read(&target).unwrap();
        let (header, pairs) = crate::storage::snapshot::decode_snapshot(&bytes).unwrap();
        assert_eq!(header.anchor_lsn, meta.anchor_lsn);
        assert_eq!(pairs, vec![("k".to_string(), b"old".to_vec())]);

        // The live database kept moving.
        assert_eq!(db.get("k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_snapshot_twice() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("k", b"v").await.unwrap();
        let meta = db.create_snapshot(HashMap::new()).await.unwrap();

        db.delete_snapshot(meta.id).unwrap();
        let err = db.delete_snapshot(meta.id).unwrap_err();
        assert!(matches!(err, MantisError::NotFound(_)));
        assert!(db.cow_index.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_reports_components() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        let reports = db.health_check().await;
        assert!(crate::metrics::overall_healthy(&reports));
        let components: Vec<&str> = reports.iter().map(|r| r.component).collect();
        assert!(components.contains(&"wal"));
        assert!(components.contains(&"cache"));
        assert!(components.contains(&"checkpoints"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.shutdown().await.unwrap();
        let err = db.put("k", b"v").await.unwrap_err();
        assert!(matches!(err, MantisError::ShuttingDown(_)));
    }

    #[tokio::test]
    async fn test_commit_waits_for_exclusive_checkpoint_latch() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("k", b"committed").await.unwrap();

        let txn = db.begin().unwrap();
        db.txn_put(txn, "k", b"tentative").await.unwrap();

        // Hold the latch the way a checkpoint capture does.
        let capture = db.apply_latch.write().await;
        assert_eq!(
            db.clean_view().get("k"),
            Some(&b"committed".to_vec()),
            "in-flight writes are reverted out of the sealed view"
        );

        let committer = Arc::clone(&db);
        let commit = tokio::spawn(async move { committer.commit(txn).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The commit cannot retire the transaction while the capture is
        // in progress, so the view stays stable for the checkpoint.
        assert!(!commit.is_finished());
        assert!(db.txns.contains_key(&txn));
        assert_eq!(db.clean_view().get("k"), Some(&b"committed".to_vec()));

        drop(capture);
        let lsn = commit.await.unwrap().unwrap();
        assert!(db.wal.durable_lsn() >= lsn, "commit record fsynced");
        assert_eq!(db.get("k").await.unwrap(), Some(b"tentative".to_vec()));
    }

    #[tokio::test]
    async fn test_abort_waits_for_exclusive_checkpoint_latch() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp).await;
        db.put("k", b"committed").await.unwrap();

        let txn = db.begin().unwrap();
        db.txn_put(txn, "k", b"tentative").await.unwrap();

        let capture = db.apply_latch.write().await;
        let aborter = Arc::clone(&db);
        let abort = tokio::spawn(async move { aborter.abort(txn).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Neither the table removal nor the undo replay may interleave
        // with a capture; the transaction is still visibly active.
        assert!(!abort.is_finished());
        assert!(db.txns.contains_key(&txn));

        drop(capture);
        abort.await.unwrap().unwrap();
        assert_eq!(db.get("k").await.unwrap(), Some(b"committed".to_vec()));
    }
}
