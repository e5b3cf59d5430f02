//! Write-Ahead Log
//!
//! Append-only log of storage operations with:
//! - Atomic LSN assignment under a single monotonic counter
//! - Group fsync: one `sync` makes every buffered record durable, so a
//!   commit record's fsync also covers the records appended before it
//! - Ordered replay from an LSN with torn-tail truncation on open
//! - Truncation strictly below a checkpoint LSN

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::WalConfig;
use crate::error::{MantisError, MantisResult};
use crate::integrity::IntegrityManager;
use crate::metrics::MetricsSink;

pub mod record;
pub mod replay;
pub mod writer;

pub use record::{LSN, TxnId, WALRecord, WalOp, WalPayload};
pub use replay::ReplayOutcome;
pub use writer::SegmentWriter;

/// Write-ahead log manager
///
/// `append` returns once the record is buffered with its LSN assigned;
/// `sync` returns only after every appended record is on stable storage.
pub struct WALManager {
    config: WalConfig,
    writer: Mutex<SegmentWriter>,
    /// Next LSN to assign
    next_lsn: AtomicU64,
    /// Highest LSN known to be fsynced
    durable_lsn: AtomicU64,
    /// Records strictly below this LSN have been truncated away
    truncated_below: AtomicU64,
    integrity: Arc<IntegrityManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl WALManager {
    /// Open (or create) the log under `wal_dir`
    pub async fn open(
        config: WalConfig,
        wal_dir: PathBuf,
        integrity: Arc<IntegrityManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> MantisResult<Self> {
        let (writer, next_lsn, events) = SegmentWriter::open(wal_dir, &config).await?;
        for event in events {
            integrity.report(event);
        }
        let durable = next_lsn.saturating_sub(1);
        let first_retained = writer.first_retained_lsn().unwrap_or(next_lsn);

        Ok(Self {
            config,
            writer: Mutex::new(writer),
            next_lsn: AtomicU64::new(next_lsn),
            durable_lsn: AtomicU64::new(durable),
            truncated_below: AtomicU64::new(first_retained.min(next_lsn)),
            integrity,
            metrics,
        })
    }

    /// Append one operation; returns its LSN. The record is buffered, not
    /// yet durable - call [`sync`](Self::sync) (or append a commit via
    /// [`append_commit`](Self::append_commit)) to make it stable.
    pub async fn append(&self, txn_id: TxnId, op: WalOp, payload: WalPayload) -> MantisResult<LSN> {
        let mut writer = self.writer.lock().await;
        // Assigning under the writer lock keeps file order equal to LSN
        // order.
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = WALRecord::new(lsn, txn_id, op, payload);
        let bytes = record.encode()?;
        writer.check_record_size(bytes.len())?;
        writer.append(lsn, &bytes).await?;
        if self.config.sync_on_append {
            writer.sync().await?;
            self.durable_lsn.store(lsn, Ordering::SeqCst);
        }
        self.metrics.incr_counter("wal_appends_total", 1);
        debug!("✍️ WAL append LSN={} op={:?} ({} bytes)", lsn, op, bytes.len());
        Ok(lsn)
    }

    /// Append a commit record and fsync the group; every record appended
    /// before the commit becomes durable with it.
    pub async fn append_commit(&self, txn_id: TxnId, timestamp_micros: i64) -> MantisResult<LSN> {
        let lsn = self
            .append(txn_id, WalOp::Commit, WalPayload::control(timestamp_micros))
            .await?;
        self.sync().await?;
        Ok(lsn)
    }

    /// Flush and fsync everything appended so far; returns the durable LSN
    pub async fn sync(&self) -> MantisResult<LSN> {
        let mut writer = self.writer.lock().await;
        writer.sync().await?;
        let durable = writer.last_appended();
        self.durable_lsn.store(durable, Ordering::SeqCst);
        self.metrics.incr_counter("wal_syncs_total", 1);
        Ok(durable)
    }

    /// Replay records with `lsn >= from_lsn` in order. Requests below the
    /// truncation watermark fail with `NotFound`; corruption events are
    /// published and replay stops (or skips, when configured) per the
    /// torn-write rules.
    pub async fn replay(&self, from_lsn: LSN) -> MantisResult<ReplayOutcome> {
        let effective_from = from_lsn.max(1);
        let watermark = self.truncated_below.load(Ordering::SeqCst);
        if effective_from < watermark {
            return Err(MantisError::not_found(format!(
                "WAL records below LSN {} are truncated (requested {})",
                watermark, from_lsn
            )));
        }

        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        let segments = writer.segment_files();
        let outcome =
            replay::replay_segments(&segments, effective_from, self.config.skip_corrupt_records)
                .await?;
        for event in &outcome.events {
            self.integrity.report(event.clone());
        }
        Ok(outcome)
    }

    /// Drop records strictly below `lsn`. Physical removal is
    /// segment-granular; the logical watermark moves regardless so replay
    /// requests below it report `NotFound`.
    pub async fn truncate_below(&self, lsn: LSN) -> MantisResult<u64> {
        let mut writer = self.writer.lock().await;
        let removed = writer.remove_segments_below(lsn).await?;
        // Watermark only moves forward.
        self.truncated_below.fetch_max(lsn, Ordering::SeqCst);
        if removed > 0 {
            info!("🧹 WAL truncated below LSN {} ({} segment(s) removed)", lsn, removed);
        }
        self.metrics
            .incr_counter("wal_segments_truncated_total", removed);
        Ok(removed)
    }

    /// Highest LSN assigned so far (0 when the log is empty)
    pub fn current_lsn(&self) -> LSN {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Highest LSN known to be on stable storage
    pub fn durable_lsn(&self) -> LSN {
        self.durable_lsn.load(Ordering::SeqCst)
    }

    /// Records below this LSN are no longer replayable
    pub fn truncation_watermark(&self) -> LSN {
        self.truncated_below.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WALManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WALManager")
            .field("current_lsn", &self.current_lsn())
            .field("durable_lsn", &self.durable_lsn())
            .field("truncation_watermark", &self.truncation_watermark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::ChecksumAlgorithm;
    use crate::metrics::NullMetrics;
    use tempfile::TempDir;

    async fn open_wal(dir: &TempDir, config: WalConfig) -> WALManager {
        WALManager::open(
            config,
            dir.path().join("wal"),
            Arc::new(IntegrityManager::new(ChecksumAlgorithm::Sha256)),
            Arc::new(NullMetrics),
        )
        .await
        .unwrap()
    }

    fn put(key: &str, value: &[u8]) -> WalPayload {
        WalPayload::mutation(key, Some(value.to_vec()), None)
    }

    #[tokio::test]
    async fn test_lsns_are_strictly_increasing() {
        let temp = TempDir::new().unwrap();
        let wal = open_wal(&temp, WalConfig::default()).await;

        let a = wal.append(1, WalOp::Insert, put("a", b"1")).await.unwrap();
        let b = wal.append(1, WalOp::Insert, put("b", b"2")).await.unwrap();
        assert!(b > a);
        assert_eq!(wal.current_lsn(), b);
    }

    #[tokio::test]
    async fn test_sync_advances_durable_lsn() {
        let temp = TempDir::new().unwrap();
        let wal = open_wal(&temp, WalConfig::default()).await;

        wal.append(1, WalOp::Insert, put("a", b"1")).await.unwrap();
        let lsn = wal.append(1, WalOp::Insert, put("b", b"2")).await.unwrap();
        assert!(wal.durable_lsn() < lsn);

        let durable = wal.sync().await.unwrap();
        assert_eq!(durable, lsn);
        assert_eq!(wal.durable_lsn(), lsn);
    }

    #[tokio::test]
    async fn test_commit_makes_group_durable_and_replayable() {
        let temp = TempDir::new().unwrap();
        let wal = open_wal(&temp, WalConfig::default()).await;

        wal.append(1, WalOp::Insert, put("a", b"1")).await.unwrap();
        wal.append(1, WalOp::Update, put("a", b"2")).await.unwrap();
        let commit = wal.append_commit(1, 1_700_000_000_000_000).await.unwrap();
        assert_eq!(wal.durable_lsn(), commit);

        let outcome = wal.replay(1).await.unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[2].op, WalOp::Commit);
        assert_eq!(outcome.records[2].payload.timestamp_micros, 1_700_000_000_000_000);
    }

    #[tokio::test]
    async fn test_replay_below_watermark_is_not_found() {
        let temp = TempDir::new().unwrap();
        let config = WalConfig {
            segment_size: 4096, // small segments so truncation bites
            ..WalConfig::default()
        };
        let wal = open_wal(&temp, config).await;

        for i in 0..100u32 {
            wal.append(1, WalOp::Insert, put(&format!("k{}", i), &i.to_le_bytes()))
                .await
                .unwrap();
        }
        wal.sync().await.unwrap();

        wal.truncate_below(80).await.unwrap();
        assert_eq!(wal.truncation_watermark(), 80);

        let err = wal.replay(50).await.unwrap_err();
        assert!(matches!(err, MantisError::NotFound(_)));

        let outcome = wal.replay(80).await.unwrap();
        assert_eq!(outcome.records.first().map(|r| r.lsn), Some(80));
        assert_eq!(outcome.records.last().map(|r| r.lsn), Some(100));
    }

    #[tokio::test]
    async fn test_reopen_after_torn_tail() {
        let temp = TempDir::new().unwrap();
        {
            let wal = open_wal(&temp, WalConfig::default()).await;
            wal.append(1, WalOp::Insert, put("a", b"1")).await.unwrap();
            wal.append_commit(1, 0).await.unwrap();
            wal.append(2, WalOp::Insert, put("b", b"2")).await.unwrap();
            wal.sync().await.unwrap();
        }

        // Tear the last record.
        let seg = writer::segment_path(&temp.path().join("wal"), 0);
        let data = std::fs::read(&seg).unwrap();
        std::fs::write(&seg, &data[..data.len() - 7]).unwrap();

        let wal = open_wal(&temp, WalConfig::default()).await;
        let outcome = wal.replay(1).await.unwrap();
        // Only the first insert and its commit survive.
        assert_eq!(outcome.records.len(), 2);
        assert!(!outcome.halted);
        assert_eq!(wal.current_lsn(), 2);
    }
}
