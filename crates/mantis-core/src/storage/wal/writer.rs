//! WAL segment writer
//!
//! Records land in numbered segment files (`wal-00000000.log`, ...) under
//! `<data>/wal/`, rotated by size. The writer tracks the first LSN of every
//! segment so truncation below a checkpoint LSN can drop whole sealed
//! segments, and trims a torn tail back to the last verified record
//! boundary when it opens an existing log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::record::{decode_at, Decoded, HEADER_LEN, LSN};
use crate::config::WalConfig;
use crate::error::{MantisError, MantisResult};
use crate::integrity::{CorruptionEvent, CorruptionKind};

/// Path of segment `n` under `wal_dir`
pub fn segment_path(wal_dir: &Path, segment: u64) -> PathBuf {
    wal_dir.join(format!("wal-{:08}.log", segment))
}

fn parse_segment_number(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

/// Result of scanning the tail segment on open
struct TailScan {
    /// Offset of the last verified record boundary
    valid_len: u64,
    first_lsn: Option<LSN>,
    last_lsn: Option<LSN>,
    torn: bool,
}

/// Append-side state of the log
pub struct SegmentWriter {
    wal_dir: PathBuf,
    segment_size: u64,
    buffer_size: usize,
    current_segment: u64,
    file: BufWriter<File>,
    current_size: u64,
    /// Segment number -> first LSN written into it (None while empty)
    segments: BTreeMap<u64, Option<LSN>>,
    /// LSN of the most recently appended record
    last_appended: LSN,
}

impl SegmentWriter {
    /// Open the log, rebuilding the segment index and trimming any torn
    /// tail. Returns the writer, the next LSN to assign and corruption
    /// events observed while scanning the tail.
    pub async fn open(
        wal_dir: PathBuf,
        config: &WalConfig,
    ) -> MantisResult<(Self, LSN, Vec<CorruptionEvent>)> {
        tokio::fs::create_dir_all(&wal_dir).await?;

        let mut numbers = Vec::new();
        let mut entries = tokio::fs::read_dir(&wal_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_segment_number(name) {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();

        let mut segments: BTreeMap<u64, Option<LSN>> = BTreeMap::new();
        let mut events = Vec::new();
        let mut last_lsn: LSN = 0;
        let current_segment = numbers.last().copied().unwrap_or(0);

        for &n in &numbers {
            if n == current_segment {
                continue;
            }
            segments.insert(n, Self::read_first_lsn(&segment_path(&wal_dir, n)).await?);
        }

        // Scan the tail segment record-by-record; trim past the last
        // verified boundary.
        let tail_path = segment_path(&wal_dir, current_segment);
        let mut tail_len = 0u64;
        let mut tail_first = None;
        if tail_path.exists() {
            let scan = Self::scan_tail(&tail_path, &mut events).await?;
            tail_first = scan.first_lsn;
            if let Some(lsn) = scan.last_lsn {
                last_lsn = lsn;
            }
            let on_disk = tokio::fs::metadata(&tail_path).await?.len();
            if scan.torn || scan.valid_len < on_disk {
                warn!(
                    "✂️ Trimming WAL segment {} from {} to {} bytes",
                    current_segment, on_disk, scan.valid_len
                );
                let file = OpenOptions::new().write(true).open(&tail_path).await?;
                file.set_len(scan.valid_len).await?;
                file.sync_all().await?;
            }
            tail_len = scan.valid_len;
        }
        segments.insert(current_segment, tail_first);

        // Sealed segments may carry later LSNs than an empty tail.
        for first in segments.values().flatten() {
            last_lsn = last_lsn.max(*first);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tail_path)
            .await?;
        let writer = BufWriter::with_capacity(config.buffer_size, file);

        info!(
            "📝 WAL opened: {} segment(s), tail segment {} at {} bytes, last LSN {}",
            segments.len(),
            current_segment,
            tail_len,
            last_lsn
        );

        Ok((
            Self {
                wal_dir,
                segment_size: config.segment_size,
                buffer_size: config.buffer_size,
                current_segment,
                file: writer,
                current_size: tail_len,
                segments,
                last_appended: last_lsn,
            },
            last_lsn + 1,
            events,
        ))
    }

    /// First LSN of a sealed segment, read from its leading header
    async fn read_first_lsn(path: &Path) -> MantisResult<Option<LSN>> {
        let data = tokio::fs::read(path).await?;
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        match decode_at(&data, 0) {
            Decoded::Record { record, .. } => Ok(Some(record.lsn)),
            Decoded::BadChecksum { lsn, .. } => Ok(Some(lsn)),
            _ => Ok(None),
        }
    }

    async fn scan_tail(path: &Path, events: &mut Vec<CorruptionEvent>) -> MantisResult<TailScan> {
        let data = tokio::fs::read(path).await?;
        let mut offset = 0usize;
        let mut first_lsn = None;
        let mut last_lsn = None;
        let mut torn = false;

        loop {
            match decode_at(&data, offset) {
                Decoded::Record { record, next } => {
                    first_lsn.get_or_insert(record.lsn);
                    last_lsn = Some(record.lsn);
                    offset = next;
                }
                Decoded::End => break,
                Decoded::Torn { offset: at } => {
                    torn = true;
                    events.push(CorruptionEvent::new(
                        format!("{} @ {}", path.display(), at),
                        CorruptionKind::TornWrite,
                        "complete record",
                        format!("{} trailing bytes", data.len() - at),
                        (data.len() - at) as u64,
                    ));
                    break;
                }
                Decoded::BadHeader { offset: at, detail } => {
                    torn = true;
                    events.push(CorruptionEvent::new(
                        format!("{} @ {}", path.display(), at),
                        CorruptionKind::HeaderCorruption,
                        "valid record header",
                        detail,
                        (data.len() - at) as u64,
                    ));
                    break;
                }
                Decoded::BadChecksum { lsn, offset: at, next } => {
                    torn = true;
                    events.push(CorruptionEvent::new(
                        format!("{} @ {} (LSN {})", path.display(), at, lsn),
                        CorruptionKind::ChecksumMismatch,
                        "matching record checksum",
                        "mismatch".to_string(),
                        (next - at) as u64,
                    ));
                    break;
                }
            }
        }

        Ok(TailScan {
            valid_len: offset as u64,
            first_lsn,
            last_lsn,
            torn,
        })
    }

    /// Append an encoded record; the caller guarantees `lsn` ordering
    pub async fn append(&mut self, lsn: LSN, bytes: &[u8]) -> MantisResult<()> {
        if self.current_size >= self.segment_size {
            self.rotate().await?;
        }
        self.file.write_all(bytes).await?;
        self.current_size += bytes.len() as u64;
        self.last_appended = lsn;
        let slot = self.segments.entry(self.current_segment).or_insert(None);
        if slot.is_none() {
            *slot = Some(lsn);
        }
        Ok(())
    }

    /// Flush buffered bytes to the file without fsyncing
    pub async fn flush(&mut self) -> MantisResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Flush and fsync; everything appended so far becomes durable
    pub async fn sync(&mut self) -> MantisResult<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        Ok(())
    }

    async fn rotate(&mut self) -> MantisResult<()> {
        self.sync().await?;
        let next = self.current_segment + 1;
        debug!("🔄 Rotating WAL segment {} -> {}", self.current_segment, next);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.wal_dir, next))
            .await?;
        self.file = BufWriter::with_capacity(self.buffer_size, file);
        self.current_segment = next;
        self.current_size = 0;
        self.segments.insert(next, None);
        Ok(())
    }

    /// Delete sealed segments whose records all fall strictly below `lsn`.
    /// Returns the number of segments removed.
    pub async fn remove_segments_below(&mut self, lsn: LSN) -> MantisResult<u64> {
        let numbers: Vec<u64> = self.segments.keys().copied().collect();
        let mut removed = 0u64;

        for window in numbers.windows(2) {
            let (seg, next) = (window[0], window[1]);
            if seg == self.current_segment {
                break;
            }
            // Every record in `seg` is older than the first LSN of the
            // following segment.
            let next_first = self
                .segments
                .range(next..)
                .find_map(|(_, first)| *first);
            match next_first {
                Some(first) if first <= lsn => {
                    let path = segment_path(&self.wal_dir, seg);
                    if path.exists() {
                        tokio::fs::remove_file(&path).await?;
                    }
                    self.segments.remove(&seg);
                    removed += 1;
                    info!("🗑️ Removed WAL segment {} (records below {})", seg, lsn);
                }
                _ => break,
            }
        }
        Ok(removed)
    }

    /// Segments in replay order
    pub fn segment_files(&self) -> Vec<PathBuf> {
        self.segments
            .keys()
            .map(|n| segment_path(&self.wal_dir, *n))
            .collect()
    }

    /// Lowest LSN still present on disk; `None` when the log is empty
    pub fn first_retained_lsn(&self) -> Option<LSN> {
        self.segments.values().flatten().min().copied()
    }

    pub fn last_appended(&self) -> LSN {
        self.last_appended
    }

    pub fn current_segment(&self) -> u64 {
        self.current_segment
    }

    /// Fail fast when a record would exceed the addressable segment space
    pub fn check_record_size(&self, len: usize) -> MantisResult<()> {
        if len as u64 > self.segment_size {
            return Err(MantisError::CapacityExceeded(format!(
                "WAL record of {} bytes exceeds segment size {}",
                len, self.segment_size
            )));
        }
        Ok(())
    }
}
