//! Checkpoints
//!
//! A checkpoint is a durable, self-describing snapshot of the dataset up
//! to a specific LSN. Artifacts are written temp + fsync + rename under
//! `<data>/checkpoints/` and tracked in a JSON catalog carrying the
//! out-of-band SHA-256 checksum. A completed checkpoint authorizes WAL
//! truncation strictly below its LSN, clamped by active snapshot pins.
//!
//! File format:
//!
//! ```text
//! MANTIS_CHECKPOINT_V1\n
//! id=<uuid>\n
//! lsn=<n>\n
//! kind=full|incremental\n
//! base_lsn=<n>\n           (incremental only)
//! tombstones=<n>\n         (incremental only; first n pairs are removed
//!                           keys with empty values)
//! timestamp=<unix secs>\n
//! tag.<key>=<value>\n
//! ---DATA---\n
//! %08d<key>%08d<value> ...
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{MantisError, MantisResult};
use crate::integrity::{ChecksumAlgorithm, CorruptionEvent, CorruptionKind, IntegrityManager};
use crate::runtime::RuntimeHandle;
use crate::storage::wal::{LSN, WALManager};

pub mod recovery;

pub use recovery::{RecoveredState, RecoveryManager, RecoveryOptions, RecoveryStats};

pub const CHECKPOINT_MAGIC: &str = "MANTIS_CHECKPOINT_V1";
const DATA_SENTINEL: &str = "---DATA---";
const CATALOG_FILE: &str = "catalog.json";
/// `%08d` length prefixes cap each key/value at 8 decimal digits
const MAX_FIELD_LEN: usize = 99_999_999;

/// Checkpoint kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Full,
    Incremental,
}

impl CheckpointKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    pub fn from_name(name: &str) -> MantisResult<Self> {
        match name {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(MantisError::invalid(format!(
                "unknown checkpoint kind: {}",
                other
            ))),
        }
    }
}

/// Checkpoint lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Creating,
    Completed,
    Failed,
    Corrupted,
}

/// Catalog entry for one checkpoint artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: Uuid,
    pub lsn: LSN,
    /// Safe replay start: min(lsn, first LSN of any transaction that was
    /// still active when the checkpoint was taken). The checkpoint's data
    /// excludes active transactions, so their earlier records must stay
    /// replayable.
    pub replay_lsn: LSN,
    pub kind: CheckpointKind,
    pub status: CheckpointStatus,
    pub path: PathBuf,
    /// SHA-256 of the artifact, stored out-of-band
    pub checksum: String,
    pub size: u64,
    /// Previous checkpoint in the chain (incremental only)
    pub base_lsn: Option<LSN>,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
    pub error: Option<String>,
}

/// Dataset content carried by a checkpoint
#[derive(Debug, Clone, Default)]
pub struct CheckpointData {
    /// Key/value pairs present (full) or changed since base (incremental)
    pub pairs: Vec<(String, Vec<u8>)>,
    /// Keys removed since base (incremental only)
    pub removed: Vec<String>,
}

/// Snapshot pins: while a snapshot is anchored at LSN A, WAL records with
/// `lsn <= A` cannot be truncated and the checkpoint at A cannot be
/// deleted.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: DashMap<Uuid, LSN>,
}

impl PinRegistry {
    pub fn pin(&self, owner: Uuid, lsn: LSN) {
        self.pins.insert(owner, lsn);
    }

    /// Idempotent
    pub fn unpin(&self, owner: Uuid) {
        self.pins.remove(&owner);
    }

    pub fn min_pinned(&self) -> Option<LSN> {
        self.pins.iter().map(|e| *e.value()).min()
    }

    pub fn is_pinned(&self, lsn: LSN) -> bool {
        self.pins.iter().any(|e| *e.value() == lsn)
    }
}

/// Checkpoint manager: artifact writer/reader plus catalog bookkeeping
pub struct CheckpointManager {
    dir: PathBuf,
    catalog: RwLock<Vec<CheckpointEntry>>,
    wal: Arc<WALManager>,
    integrity: Arc<IntegrityManager>,
    pins: Arc<PinRegistry>,
    runtime: RuntimeHandle,
}

impl CheckpointManager {
    pub async fn open(
        dir: PathBuf,
        wal: Arc<WALManager>,
        integrity: Arc<IntegrityManager>,
        pins: Arc<PinRegistry>,
        runtime: RuntimeHandle,
    ) -> MantisResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let catalog_path = dir.join(CATALOG_FILE);
        let catalog: Vec<CheckpointEntry> = if catalog_path.exists() {
            let raw = tokio::fs::read_to_string(&catalog_path).await?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        info!("🗂️ Checkpoint catalog loaded: {} entr(ies)", catalog.len());
        Ok(Self {
            dir,
            catalog: RwLock::new(catalog),
            wal,
            integrity,
            pins,
            runtime,
        })
    }

    /// Create a checkpoint from `data`. Flushes the WAL first so the
    /// checkpoint LSN covers everything applied, writes the artifact
    /// atomically, records it in the catalog and authorizes truncation of
    /// WAL records strictly below the checkpoint LSN (clamped by pins).
    pub async fn create(
        &self,
        kind: CheckpointKind,
        data: CheckpointData,
        tags: HashMap<String, String>,
        replay_floor: Option<LSN>,
    ) -> MantisResult<CheckpointEntry> {
        if self.runtime.is_shutting_down() {
            return Err(MantisError::ShuttingDown("checkpoint".to_string()));
        }
        let lsn = self.wal.sync().await?;
        let replay_lsn = replay_floor.map_or(lsn, |floor| floor.min(lsn));
        let base_lsn = match kind {
            CheckpointKind::Full => None,
            CheckpointKind::Incremental => {
                let base = self.latest_completed().await.ok_or_else(|| {
                    MantisError::invalid("incremental checkpoint requires a completed base")
                })?;
                Some(base.lsn)
            }
        };

        let id = Uuid::new_v4();
        let path = self.dir.join(format!("checkpoint-{:020}-{}.ckpt", lsn, id));
        let mut entry = CheckpointEntry {
            id,
            lsn,
            replay_lsn,
            kind,
            status: CheckpointStatus::Creating,
            path: path.clone(),
            checksum: String::new(),
            size: 0,
            base_lsn,
            timestamp: self.runtime.clock.now(),
            tags,
            error: None,
        };
        info!("🛑 Creating {} checkpoint {} at LSN {}", kind.as_str(), id, lsn);

        match self.write_artifact(&entry, &data).await {
            Ok((checksum, size)) => {
                entry.checksum = checksum;
                entry.size = size;
                entry.status = CheckpointStatus::Completed;
            }
            Err(e) => {
                entry.status = CheckpointStatus::Failed;
                entry.error = Some(e.to_string());
                warn!("❌ Checkpoint {} failed: {}", id, e);
            }
        }

        self.upsert_entry(entry.clone()).await?;

        if entry.status == CheckpointStatus::Completed {
            // Truncation is bounded by the oldest snapshot pin and by the
            // replay floor of still-active transactions.
            let cutoff = match self.pins.min_pinned() {
                Some(pinned) => replay_lsn.min(pinned),
                None => replay_lsn,
            };
            self.wal.truncate_below(cutoff).await?;
            self.runtime.metrics.incr_counter("checkpoints_completed_total", 1);
            info!("✅ Checkpoint {} completed ({} bytes)", id, entry.size);
            Ok(entry)
        } else {
            self.runtime.metrics.incr_counter("checkpoints_failed_total", 1);
            Err(MantisError::Io(std::io::Error::other(format!(
                "checkpoint {} failed: {}",
                id,
                entry.error.as_deref().unwrap_or("unknown")
            ))))
        }
    }

    async fn write_artifact(
        &self,
        entry: &CheckpointEntry,
        data: &CheckpointData,
    ) -> MantisResult<(String, u64)> {
        let bytes = encode_artifact(entry, data)?;
        let temp = entry.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        let file = tokio::fs::File::open(&temp).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, &entry.path).await?;

        let checksum = ChecksumAlgorithm::Sha256.compute(&bytes);
        Ok((checksum, bytes.len() as u64))
    }

    async fn upsert_entry(&self, entry: CheckpointEntry) -> MantisResult<()> {
        let mut catalog = self.catalog.write().await;
        match catalog.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => catalog.push(entry),
        }
        catalog.sort_by_key(|e| e.lsn);
        self.persist_catalog(&catalog).await
    }

    async fn persist_catalog(&self, catalog: &[CheckpointEntry]) -> MantisResult<()> {
        let path = self.dir.join(CATALOG_FILE);
        let temp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(catalog)?;
        tokio::fs::write(&temp, raw).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    /// Validate an entry's artifact: recognized header plus matching
    /// out-of-band checksum. A failure marks the entry corrupted in the
    /// catalog and reports a corruption event.
    pub async fn validate(&self, entry: &CheckpointEntry) -> MantisResult<bool> {
        if entry.status != CheckpointStatus::Completed {
            return Ok(false);
        }
        let ok = match tokio::fs::read(&entry.path).await {
            Ok(bytes) => {
                let header_ok = bytes.starts_with(CHECKPOINT_MAGIC.as_bytes());
                if !header_ok {
                    self.integrity.report(CorruptionEvent::new(
                        entry.path.display().to_string(),
                        CorruptionKind::HeaderCorruption,
                        CHECKPOINT_MAGIC,
                        "unrecognized header",
                        bytes.len() as u64,
                    ));
                    false
                } else {
                    let actual = ChecksumAlgorithm::Sha256.compute(&bytes);
                    if actual != entry.checksum {
                        self.integrity.report(CorruptionEvent::new(
                            entry.path.display().to_string(),
                            CorruptionKind::ChecksumMismatch,
                            entry.checksum.clone(),
                            actual,
                            bytes.len() as u64,
                        ));
                        false
                    } else {
                        true
                    }
                }
            }
            Err(e) => {
                warn!("Checkpoint {} unreadable: {}", entry.id, e);
                false
            }
        };

        if !ok {
            let mut catalog = self.catalog.write().await;
            if let Some(existing) = catalog.iter_mut().find(|e| e.id == entry.id) {
                existing.status = CheckpointStatus::Corrupted;
            }
            self.persist_catalog(&catalog).await?;
        }
        Ok(ok)
    }

    /// Load a checkpoint's dataset
    pub async fn load_data(&self, entry: &CheckpointEntry) -> MantisResult<CheckpointData> {
        let bytes = tokio::fs::read(&entry.path).await?;
        decode_artifact(&bytes, &entry.path.display().to_string())
    }

    /// Greatest completed + validated checkpoint with `lsn <= target`,
    /// resolved into its restore chain (full first, then incrementals in
    /// LSN order). Corrupted candidates are skipped in favor of older
    /// valid ones.
    pub async fn resolve_chain(&self, target: LSN) -> MantisResult<Vec<CheckpointEntry>> {
        let candidates: Vec<CheckpointEntry> = {
            let catalog = self.catalog.read().await;
            catalog
                .iter()
                .filter(|e| e.status == CheckpointStatus::Completed && e.lsn <= target)
                .cloned()
                .collect()
        };

        // Newest first; fall back past anything that fails validation.
        for head in candidates.iter().rev() {
            if !self.validate(head).await? {
                continue;
            }
            match self.chain_for(head, &candidates).await? {
                Some(chain) => return Ok(chain),
                None => continue,
            }
        }
        Ok(Vec::new())
    }

    /// Walk base links down to a full checkpoint, validating each link
    async fn chain_for(
        &self,
        head: &CheckpointEntry,
        candidates: &[CheckpointEntry],
    ) -> MantisResult<Option<Vec<CheckpointEntry>>> {
        let mut chain = vec![head.clone()];
        let mut current = head.clone();
        while let Some(base_lsn) = current.base_lsn {
            let Some(base) = candidates.iter().find(|e| e.lsn == base_lsn) else {
                warn!("Checkpoint {} misses base at LSN {}", current.id, base_lsn);
                return Ok(None);
            };
            if !self.validate(base).await? {
                return Ok(None);
            }
            chain.push(base.clone());
            current = base.clone();
        }
        if chain.last().map(|e| e.kind) != Some(CheckpointKind::Full) {
            return Ok(None);
        }
        chain.reverse();
        Ok(Some(chain))
    }

    async fn latest_completed(&self) -> Option<CheckpointEntry> {
        let catalog = self.catalog.read().await;
        catalog
            .iter()
            .filter(|e| e.status == CheckpointStatus::Completed)
            .max_by_key(|e| e.lsn)
            .cloned()
    }

    pub async fn list(&self) -> Vec<CheckpointEntry> {
        self.catalog.read().await.clone()
    }

    pub async fn get(&self, id: Uuid) -> MantisResult<CheckpointEntry> {
        self.catalog
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| MantisError::not_found(format!("checkpoint {}", id)))
    }

    /// Delete a checkpoint artifact and its catalog entry. Pinned
    /// checkpoints cannot be deleted.
    pub async fn delete(&self, id: Uuid) -> MantisResult<()> {
        let entry = self.get(id).await?;
        if self.pins.is_pinned(entry.lsn) {
            return Err(MantisError::busy(format!(
                "checkpoint {} at LSN {} is pinned by a snapshot",
                id, entry.lsn
            )));
        }
        if entry.path.exists() {
            tokio::fs::remove_file(&entry.path).await?;
        }
        let mut catalog = self.catalog.write().await;
        catalog.retain(|e| e.id != id);
        self.persist_catalog(&catalog).await?;
        info!("🗑️ Deleted checkpoint {}", id);
        Ok(())
    }

    pub fn pins(&self) -> Arc<PinRegistry> {
        Arc::clone(&self.pins)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").field("dir", &self.dir).finish()
    }
}

fn push_field(buf: &mut Vec<u8>, field: &[u8]) -> MantisResult<()> {
    if field.len() > MAX_FIELD_LEN {
        return Err(MantisError::CapacityExceeded(format!(
            "checkpoint field of {} bytes exceeds the 8-digit length prefix",
            field.len()
        )));
    }
    buf.extend_from_slice(format!("{:08}", field.len()).as_bytes());
    buf.extend_from_slice(field);
    Ok(())
}

fn encode_artifact(entry: &CheckpointEntry, data: &CheckpointData) -> MantisResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(CHECKPOINT_MAGIC.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(format!("id={}\n", entry.id).as_bytes());
    buf.extend_from_slice(format!("lsn={}\n", entry.lsn).as_bytes());
    buf.extend_from_slice(format!("kind={}\n", entry.kind.as_str()).as_bytes());
    if let Some(base) = entry.base_lsn {
        buf.extend_from_slice(format!("base_lsn={}\n", base).as_bytes());
    }
    if !data.removed.is_empty() {
        buf.extend_from_slice(format!("tombstones={}\n", data.removed.len()).as_bytes());
    }
    buf.extend_from_slice(format!("timestamp={}\n", entry.timestamp.timestamp()).as_bytes());
    let mut tags: Vec<(&String, &String)> = entry.tags.iter().collect();
    tags.sort();
    for (key, value) in tags {
        buf.extend_from_slice(format!("tag.{}={}\n", key, value).as_bytes());
    }
    buf.extend_from_slice(DATA_SENTINEL.as_bytes());
    buf.push(b'\n');

    for key in &data.removed {
        push_field(&mut buf, key.as_bytes())?;
        push_field(&mut buf, b"")?;
    }
    for (key, value) in &data.pairs {
        push_field(&mut buf, key.as_bytes())?;
        push_field(&mut buf, value)?;
    }
    Ok(buf)
}

fn corrupt_at(location: &str, detail: &str) -> MantisError {
    MantisError::CorruptionDetected {
        location: location.to_string(),
        detail: detail.to_string(),
    }
}

fn read_line(bytes: &[u8], offset: &mut usize, location: &str) -> MantisResult<String> {
    let start = *offset;
    while *offset < bytes.len() && bytes[*offset] != b'\n' {
        *offset += 1;
    }
    if *offset >= bytes.len() {
        return Err(corrupt_at(location, "unterminated header line"));
    }
    let line = String::from_utf8_lossy(&bytes[start..*offset]).into_owned();
    *offset += 1;
    Ok(line)
}

fn read_field(bytes: &[u8], offset: &mut usize, location: &str) -> MantisResult<Vec<u8>> {
    if *offset + 8 > bytes.len() {
        return Err(corrupt_at(location, "truncated length prefix"));
    }
    let len: usize = std::str::from_utf8(&bytes[*offset..*offset + 8])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| corrupt_at(location, "invalid length prefix"))?;
    *offset += 8;
    if *offset + len > bytes.len() {
        return Err(corrupt_at(location, "truncated field"));
    }
    let field = bytes[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(field)
}

fn decode_artifact(bytes: &[u8], location: &str) -> MantisResult<CheckpointData> {
    let mut offset = 0usize;
    if read_line(bytes, &mut offset, location)? != CHECKPOINT_MAGIC {
        return Err(corrupt_at(location, "bad checkpoint magic"));
    }
    let mut tombstones = 0usize;
    loop {
        let line = read_line(bytes, &mut offset, location)?;
        if line == DATA_SENTINEL {
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key == "tombstones" {
                tombstones = value
                    .parse()
                    .map_err(|_| corrupt_at(location, "invalid tombstone count"))?;
            }
        }
    }

    let mut data = CheckpointData::default();
    let mut seen = 0usize;
    while offset < bytes.len() {
        let key = read_field(bytes, &mut offset, location)?;
        let value = read_field(bytes, &mut offset, location)?;
        let key = String::from_utf8(key).map_err(|_| corrupt_at(location, "non-UTF-8 key"))?;
        if seen < tombstones {
            data.removed.push(key);
        } else {
            data.pairs.push((key, value));
        }
        seen += 1;
    }
    Ok(data)
}
