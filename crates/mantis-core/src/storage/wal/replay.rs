//! WAL replay
//!
//! Reads segments in order and yields verified records with `lsn >=
//! from_lsn`. A failed record checksum terminates replay at that point
//! (torn-write semantics) unless skipping is enabled and the record header
//! is intact, in which case exactly that record is skipped and an event is
//! emitted.

use std::path::PathBuf;
use tracing::{debug, warn};

use super::record::{decode_at, Decoded, LSN, WALRecord};
use crate::error::MantisResult;
use crate::integrity::{CorruptionEvent, CorruptionKind};

/// Result of one replay pass
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Verified records in LSN order
    pub records: Vec<WALRecord>,
    /// Corruption observed during the pass
    pub events: Vec<CorruptionEvent>,
    /// Records skipped because of checksum damage
    pub skipped: usize,
    /// Replay stopped before the end of the log
    pub halted: bool,
}

/// Replay `segments` (in order) from `from_lsn`
pub async fn replay_segments(
    segments: &[PathBuf],
    from_lsn: LSN,
    skip_corrupt: bool,
) -> MantisResult<ReplayOutcome> {
    let mut outcome = ReplayOutcome::default();

    'segments: for path in segments {
        if !path.exists() {
            continue;
        }
        let data = tokio::fs::read(path).await?;
        let mut offset = 0usize;

        loop {
            match decode_at(&data, offset) {
                Decoded::Record { record, next } => {
                    if record.lsn >= from_lsn {
                        outcome.records.push(record);
                    }
                    offset = next;
                }
                Decoded::End => break,
                Decoded::Torn { offset: at } => {
                    outcome.events.push(CorruptionEvent::new(
                        format!("{} @ {}", path.display(), at),
                        CorruptionKind::TornWrite,
                        "complete record",
                        format!("{} trailing bytes", data.len() - at),
                        (data.len() - at) as u64,
                    ));
                    outcome.halted = true;
                    break 'segments;
                }
                Decoded::BadHeader { offset: at, detail } => {
                    outcome.events.push(CorruptionEvent::new(
                        format!("{} @ {}", path.display(), at),
                        CorruptionKind::HeaderCorruption,
                        "valid record header",
                        detail,
                        (data.len() - at) as u64,
                    ));
                    outcome.halted = true;
                    break 'segments;
                }
                Decoded::BadChecksum { lsn, offset: at, next } => {
                    outcome.events.push(CorruptionEvent::new(
                        format!("{} @ {} (LSN {})", path.display(), at, lsn),
                        CorruptionKind::ChecksumMismatch,
                        "matching record checksum",
                        "mismatch".to_string(),
                        (next - at) as u64,
                    ));
                    if skip_corrupt {
                        warn!("⏭️ Skipping corrupt WAL record LSN {} in {}", lsn, path.display());
                        outcome.skipped += 1;
                        offset = next;
                    } else {
                        outcome.halted = true;
                        break 'segments;
                    }
                }
            }
        }
    }

    outcome.records.sort_by_key(|r| r.lsn);
    debug!(
        "Replayed {} record(s) from LSN {} ({} skipped, halted={})",
        outcome.records.len(),
        from_lsn,
        outcome.skipped,
        outcome.halted
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::{WALRecord, WalOp, WalPayload, HEADER_LEN};
    use tempfile::TempDir;

    fn record(lsn: LSN) -> WALRecord {
        WALRecord::new(
            lsn,
            9,
            WalOp::Update,
            WalPayload::mutation(format!("k{}", lsn), Some(vec![lsn as u8; 16]), None),
        )
    }

    async fn write_segment(path: &std::path::Path, records: &[WALRecord]) {
        let mut bytes = Vec::new();
        for r in records {
            bytes.extend_from_slice(&r.encode().unwrap());
        }
        tokio::fs::write(path, &bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_from_lsn_filters() {
        let temp = TempDir::new().unwrap();
        let seg = temp.path().join("wal-00000000.log");
        write_segment(&seg, &[record(1), record(2), record(3)]).await;

        let outcome = replay_segments(&[seg], 2, false).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].lsn, 2);
        assert!(!outcome.halted);
    }

    #[tokio::test]
    async fn test_replay_halts_at_bad_checksum() {
        let temp = TempDir::new().unwrap();
        let seg = temp.path().join("wal-00000000.log");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&record(1).encode().unwrap());
        let second_at = bytes.len();
        bytes.extend_from_slice(&record(2).encode().unwrap());
        bytes.extend_from_slice(&record(3).encode().unwrap());
        bytes[second_at + HEADER_LEN + 1] ^= 0xFF; // damage record 2's payload
        tokio::fs::write(&seg, &bytes).await.unwrap();

        let outcome = replay_segments(&[seg.clone()], 1, false).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.halted);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind, CorruptionKind::ChecksumMismatch);

        // With skipping enabled the damaged record is stepped over and the
        // rest of the log still replays.
        let outcome = replay_segments(&[seg], 1, true).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[1].lsn, 3);
        assert_eq!(outcome.skipped, 1);
        assert!(!outcome.halted);
    }

    #[tokio::test]
    async fn test_replay_spans_segments() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("wal-00000000.log");
        let b = temp.path().join("wal-00000001.log");
        write_segment(&a, &[record(1), record(2)]).await;
        write_segment(&b, &[record(3)]).await;

        let outcome = replay_segments(&[a, b], 1, false).await.unwrap();
        let lsns: Vec<LSN> = outcome.records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_header_damage_always_halts() {
        let temp = TempDir::new().unwrap();
        let seg = temp.path().join("wal-00000000.log");
        let mut bytes = record(1).encode().unwrap();
        let second_at = bytes.len();
        bytes.extend_from_slice(&record(2).encode().unwrap());
        bytes[second_at] ^= 0xFF; // smash record 2's magic
        tokio::fs::write(&seg, &bytes).await.unwrap();

        let outcome = replay_segments(&[seg], 1, true).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.halted);
        assert_eq!(outcome.events[0].kind, CorruptionKind::HeaderCorruption);
    }
}
