//! Recovery
//!
//! Builds and executes a recovery plan:
//! 1. select the greatest completed, validated checkpoint chain at or
//!    below the target LSN
//! 2. restore its data
//! 3. replay the WAL from the checkpoint LSN up to the target, applying
//!    only fully committed transactions
//! 4. optionally validate
//!
//! Every step is idempotent, so a partially failed recovery can simply be
//! retried; cancellation is honoured at step boundaries and completed
//! steps are not rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CheckpointManager, LSN};
use crate::error::{MantisError, MantisResult};
use crate::runtime::RuntimeHandle;
use crate::storage::wal::{TxnId, WALManager, WalOp};

/// What to recover to and which optional steps to run
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Recover up to this LSN (inclusive); latest state when `None`
    pub target_lsn: Option<LSN>,
    /// Recover to the last commit at or before this instant; takes
    /// precedence over `target_lsn` when set
    pub target_time: Option<DateTime<Utc>>,
    /// Re-verify the checkpoint chain and replay outcome
    pub validate: bool,
    /// Ask the caller to write a fresh checkpoint once the recovered
    /// state is installed
    pub checkpoint_after: bool,
}

/// Per-run recovery statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub target_lsn: LSN,
    pub checkpoint_id: Option<Uuid>,
    pub checkpoint_lsn: LSN,
    pub chain_length: usize,
    pub records_replayed: usize,
    pub records_skipped: usize,
    pub transactions_committed: usize,
    pub transactions_discarded: usize,
    pub replay_halted: bool,
    pub steps_completed: Vec<String>,
    pub duration_ms: u64,
}

/// Result of a recovery run
#[derive(Debug)]
pub struct RecoveredState {
    pub data: HashMap<String, Vec<u8>>,
    /// Highest LSN observed anywhere in the log
    pub last_lsn: LSN,
    /// Highest transaction id observed; new ids must start above it so a
    /// reused id can never resurrect a crashed transaction's records
    pub max_txn_id: TxnId,
    pub stats: RecoveryStats,
}

/// Executes recovery plans against the checkpoint catalog and the WAL
pub struct RecoveryManager {
    checkpoints: Arc<CheckpointManager>,
    wal: Arc<WALManager>,
    runtime: RuntimeHandle,
}

impl RecoveryManager {
    pub fn new(
        checkpoints: Arc<CheckpointManager>,
        wal: Arc<WALManager>,
        runtime: RuntimeHandle,
    ) -> Self {
        Self {
            checkpoints,
            wal,
            runtime,
        }
    }

    fn step_boundary(&self, step: &str, stats: &mut RecoveryStats) -> MantisResult<()> {
        if self.runtime.shutdown.is_cancelled() {
            return Err(MantisError::Cancelled(format!(
                "recovery stopped before step {}",
                step
            )));
        }
        stats.steps_completed.push(step.to_string());
        Ok(())
    }

    /// Map a wall-clock target to the greatest commit LSN at or before it
    pub async fn resolve_time_target(&self, target: DateTime<Utc>) -> MantisResult<LSN> {
        let from = self.wal.truncation_watermark();
        let outcome = self.wal.replay(from).await?;
        let target_micros = target.timestamp_micros();
        let lsn = outcome
            .records
            .iter()
            .filter(|r| r.op == WalOp::Commit && r.payload.timestamp_micros <= target_micros)
            .map(|r| r.lsn)
            .max()
            .ok_or_else(|| {
                MantisError::not_found(format!("no commit at or before {}", target))
            })?;
        Ok(lsn)
    }

    /// Run the full recovery plan
    pub async fn recover(&self, options: RecoveryOptions) -> MantisResult<RecoveredState> {
        let started = self.runtime.clock.monotonic();
        let mut stats = RecoveryStats::default();

        // Step 1: resolve the target.
        let target = match options.target_time {
            Some(time) => self.resolve_time_target(time).await?,
            None => options.target_lsn.unwrap_or(LSN::MAX),
        };
        stats.target_lsn = target;
        info!("🔄 Recovery starting (target LSN {})", target);
        self.step_boundary("resolve_target", &mut stats)?;

        // Step 2: select the checkpoint chain.
        let chain = self.checkpoints.resolve_chain(target).await?;
        let mut replay_from: LSN = 0;
        if let Some(head) = chain.last() {
            stats.checkpoint_id = Some(head.id);
            stats.checkpoint_lsn = head.lsn;
            replay_from = head.replay_lsn;
            stats.chain_length = chain.len();
            info!(
                "📌 Using checkpoint {} at LSN {} (chain of {})",
                head.id,
                head.lsn,
                chain.len()
            );
        } else {
            debug!("No usable checkpoint; recovering from the log alone");
        }
        self.step_boundary("select_checkpoint", &mut stats)?;

        // Step 3: restore checkpoint data, full first then deltas.
        let mut data: HashMap<String, Vec<u8>> = HashMap::new();
        for entry in &chain {
            let payload = self.checkpoints.load_data(entry).await?;
            for key in payload.removed {
                data.remove(&key);
            }
            for (key, value) in payload.pairs {
                data.insert(key, value);
            }
        }
        self.step_boundary("restore_checkpoint", &mut stats)?;

        // Step 4: replay committed transactions from the checkpoint's safe
        // replay start (covers transactions that straddled the checkpoint).
        let from = replay_from.max(self.wal.truncation_watermark());
        let outcome = self.wal.replay(from).await?;
        stats.records_skipped = outcome.skipped;
        stats.replay_halted = outcome.halted;

        let committed: HashSet<TxnId> = outcome
            .records
            .iter()
            .filter(|r| r.op == WalOp::Commit && r.lsn <= target)
            .map(|r| r.txn_id)
            .collect();
        let mut seen: HashSet<TxnId> = HashSet::new();
        let mut last_lsn = stats.checkpoint_lsn;
        let mut max_txn_id: TxnId = 0;

        for record in &outcome.records {
            last_lsn = last_lsn.max(record.lsn);
            max_txn_id = max_txn_id.max(record.txn_id);
            if record.lsn > target {
                continue;
            }
            match record.op {
                WalOp::Insert | WalOp::Update | WalOp::Delete => {
                    seen.insert(record.txn_id);
                    if !committed.contains(&record.txn_id) {
                        continue; // uncommitted or aborted work is discarded
                    }
                    stats.records_replayed += 1;
                    match record.op {
                        WalOp::Delete => {
                            data.remove(&record.payload.key);
                        }
                        _ => {
                            if let Some(value) = &record.payload.value {
                                data.insert(record.payload.key.clone(), value.clone());
                            }
                        }
                    }
                }
                WalOp::Commit | WalOp::Abort => {}
            }
        }
        stats.transactions_committed = committed.len();
        stats.transactions_discarded = seen.difference(&committed).count();
        self.step_boundary("replay_wal", &mut stats)?;

        // Step 5: optional validation.
        if options.validate {
            if stats.replay_halted && stats.records_skipped == 0 {
                debug!("Replay halted at a damaged record; recovered the verified prefix");
            }
            self.step_boundary("validate", &mut stats)?;
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "✅ Recovery completed in {}ms: {} key(s), {} record(s) replayed, {} txn(s) committed, {} discarded",
            stats.duration_ms,
            data.len(),
            stats.records_replayed,
            stats.transactions_committed,
            stats.transactions_discarded
        );

        Ok(RecoveredState {
            data,
            last_lsn: last_lsn.max(self.wal.current_lsn()),
            max_txn_id,
            stats,
        })
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::integrity::{ChecksumAlgorithm, IntegrityManager};
    use crate::metrics::NullMetrics;
    use crate::storage::checkpoint::{CheckpointData, CheckpointKind, PinRegistry};
    use crate::storage::wal::WalPayload;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    struct Fixture {
        wal: Arc<WALManager>,
        checkpoints: Arc<CheckpointManager>,
        recovery: RecoveryManager,
    }

    async fn fixture(temp: &TempDir) -> Fixture {
        let runtime = RuntimeHandle::detached();
        let integrity = Arc::new(IntegrityManager::new(ChecksumAlgorithm::Sha256));
        let wal = Arc::new(
            WALManager::open(
                WalConfig::default(),
                temp.path().join("wal"),
                Arc::clone(&integrity),
                Arc::new(NullMetrics),
            )
            .await
            .unwrap(),
        );
        let checkpoints = Arc::new(
            CheckpointManager::open(
                temp.path().join("checkpoints"),
                Arc::clone(&wal),
                integrity,
                Arc::new(PinRegistry::default()),
                runtime.clone(),
            )
            .await
            .unwrap(),
        );
        let recovery = RecoveryManager::new(Arc::clone(&checkpoints), Arc::clone(&wal), runtime);
        Fixture {
            wal,
            checkpoints,
            recovery,
        }
    }

    async fn committed_put(fx: &Fixture, txn: TxnId, key: &str, value: &[u8], ts: i64) {
        fx.wal
            .append(txn, WalOp::Insert, WalPayload::mutation(key, Some(value.to_vec()), None))
            .await
            .unwrap();
        fx.wal.append_commit(txn, ts).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_from_log_alone() {
        let temp = TempDir::new().unwrap();
        let fx = fixture(&temp).await;

        committed_put(&fx, 1, "a", b"1", 100).await;
        committed_put(&fx, 2, "b", b"2", 200).await;
        // Uncommitted transaction must be discarded.
        fx.wal
            .append(3, WalOp::Insert, WalPayload::mutation("c", Some(b"3".to_vec()), None))
            .await
            .unwrap();
        fx.wal.sync().await.unwrap();

        let state = fx.recovery.recover(RecoveryOptions::default()).await.unwrap();
        assert_eq!(state.data.get("a"), Some(&b"1".to_vec()));
        assert_eq!(state.data.get("b"), Some(&b"2".to_vec()));
        assert!(!state.data.contains_key("c"));
        assert_eq!(state.stats.transactions_committed, 2);
        assert_eq!(state.stats.transactions_discarded, 1);
    }

    #[tokio::test]
    async fn test_recovery_uses_checkpoint_then_replays() {
        let temp = TempDir::new().unwrap();
        let fx = fixture(&temp).await;

        committed_put(&fx, 1, "a", b"1", 100).await;
        let entry = fx
            .checkpoints
            .create(
                CheckpointKind::Full,
                CheckpointData {
                    pairs: vec![("a".to_string(), b"1".to_vec())],
                    removed: vec![],
                },
                StdHashMap::new(),
                None,
            )
            .await
            .unwrap();

        committed_put(&fx, 2, "b", b"2", 200).await;

        let state = fx.recovery.recover(RecoveryOptions::default()).await.unwrap();
        assert_eq!(state.stats.checkpoint_id, Some(entry.id));
        assert_eq!(state.data.get("a"), Some(&b"1".to_vec()));
        assert_eq!(state.data.get("b"), Some(&b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_point_in_time_by_lsn() {
        let temp = TempDir::new().unwrap();
        let fx = fixture(&temp).await;

        committed_put(&fx, 1, "a", b"old", 100).await;
        let boundary = fx.wal.current_lsn();
        committed_put(&fx, 2, "a", b"new", 200).await;

        let state = fx
            .recovery
            .recover(RecoveryOptions {
                target_lsn: Some(boundary),
                ..RecoveryOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(state.data.get("a"), Some(&b"old".to_vec()));
    }

    #[tokio::test]
    async fn test_point_in_time_by_wall_clock() {
        let temp = TempDir::new().unwrap();
        let fx = fixture(&temp).await;

        committed_put(&fx, 1, "a", b"old", 1_000_000).await;
        committed_put(&fx, 2, "a", b"new", 2_000_000).await;

        let cutoff = DateTime::<Utc>::from_timestamp_micros(1_500_000).unwrap();
        let state = fx
            .recovery
            .recover(RecoveryOptions {
                target_time: Some(cutoff),
                ..RecoveryOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(state.data.get("a"), Some(&b"old".to_vec()));
    }

    #[tokio::test]
    async fn test_recovery_applies_incremental_tombstones() {
        let temp = TempDir::new().unwrap();
        let fx = fixture(&temp).await;

        committed_put(&fx, 1, "keep", b"1", 100).await;
        committed_put(&fx, 2, "drop", b"2", 200).await;
        fx.checkpoints
            .create(
                CheckpointKind::Full,
                CheckpointData {
                    pairs: vec![
                        ("keep".to_string(), b"1".to_vec()),
                        ("drop".to_string(), b"2".to_vec()),
                    ],
                    removed: vec![],
                },
                StdHashMap::new(),
                None,
            )
            .await
            .unwrap();

        // Delete "drop" and checkpoint the delta.
        fx.wal
            .append(3, WalOp::Delete, WalPayload::mutation("drop", None, Some(b"2".to_vec())))
            .await
            .unwrap();
        fx.wal.append_commit(3, 300).await.unwrap();
        fx.checkpoints
            .create(
                CheckpointKind::Incremental,
                CheckpointData {
                    pairs: vec![],
                    removed: vec!["drop".to_string()],
                },
                StdHashMap::new(),
                None,
            )
            .await
            .unwrap();

        let state = fx.recovery.recover(RecoveryOptions::default()).await.unwrap();
        assert_eq!(state.data.get("keep"), Some(&b"1".to_vec()));
        assert!(!state.data.contains_key("drop"));
        assert_eq!(state.stats.chain_length, 2);
    }
}
