//! Hot-backup snapshots
//!
//! A snapshot pins a checkpoint LSN (the anchor) and captures page refs
//! for every logical record reachable at that LSN. Writers keep going:
//! the engine materializes the pre-anchor content of a page into its ref
//! on the first post-anchor write (copy-on-write), so streaming always
//! observes the exact anchor state. Streaming tees through a SHA-256
//! hasher, file destinations get a verification pass, and cleanup
//! (unpin + page-ref destruction) is idempotent on success, failure and
//! cancellation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SnapshotConfig;
use crate::error::{MantisError, MantisResult};
use crate::integrity::ChecksumAlgorithm;
use crate::runtime::RuntimeHandle;
use crate::storage::checkpoint::PinRegistry;
use crate::storage::wal::LSN;

pub mod destination;
pub mod schedule;
pub mod stream;

pub use destination::{destination_for, file_path_of, BackupDestination, DestinationWriter};
pub use schedule::{BackupSchedule, CronSchedule, RetentionPolicy, ScheduleStore};
pub use stream::{decode_snapshot, Compression, SnapshotHeader, StreamProgress, SNAPSHOT_MAGIC};

pub type SnapshotId = Uuid;

/// Stable logical page identifier (one key/value record per page)
pub type PageId = u64;

/// Snapshot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Creating,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// Copy-on-write page reference owned by its snapshot
#[derive(Debug)]
pub struct PageRef {
    pub page_id: PageId,
    /// Original location: the record's key in the live store
    pub key: String,
    /// Copy location: pre-anchor content, materialized on first
    /// post-anchor write. Its own small lock guards the COW transition.
    frozen: Mutex<Option<Vec<u8>>>,
    dirty: AtomicBool,
}

impl PageRef {
    fn new(page_id: PageId, key: String) -> Self {
        Self {
            page_id,
            key,
            frozen: Mutex::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    /// Materialize the pre-anchor content once; later writes are no-ops
    /// because the first freeze already captured the anchor state.
    pub fn freeze(&self, pre_image: &[u8]) {
        let mut frozen = self.frozen.lock().unwrap_or_else(|e| e.into_inner());
        if frozen.is_none() {
            *frozen = Some(pre_image.to_vec());
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Frozen copy, when the page was modified after the anchor
    pub fn frozen_value(&self) -> Option<Vec<u8>> {
        self.frozen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Snapshot descriptor surfaced to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub anchor_lsn: LSN,
    pub status: SnapshotStatus,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub destination: Option<String>,
    pub compression: Compression,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Outcome of a completed backup stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub snapshot_id: SnapshotId,
    pub destination: String,
    pub checksum: String,
    pub bytes_streamed: u64,
    pub pages_streamed: u64,
    pub verified: bool,
    pub duration_ms: u64,
}

struct SnapshotState {
    meta: RwLock<SnapshotMetadata>,
    pages: RwLock<HashMap<PageId, Arc<PageRef>>>,
    progress: StreamProgress,
    cancel: CancellationToken,
}

impl SnapshotState {
    fn meta(&self) -> SnapshotMetadata {
        self.meta.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_meta(&self, update: impl FnOnce(&mut SnapshotMetadata)) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        update(&mut meta);
    }
}

/// Snapshot and backup coordinator
pub struct SnapshotManager {
    snapshots: DashMap<SnapshotId, Arc<SnapshotState>>,
    pins: Arc<PinRegistry>,
    /// Snapshots being created plus streams in flight
    active: AtomicUsize,
    config: SnapshotConfig,
    runtime: RuntimeHandle,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig, pins: Arc<PinRegistry>, runtime: RuntimeHandle) -> Self {
        Self {
            snapshots: DashMap::new(),
            pins,
            active: AtomicUsize::new(0),
            config,
            runtime,
        }
    }

    fn try_activate(&self, what: &str) -> MantisResult<()> {
        let limit = self.config.max_concurrent;
        let result = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < limit {
                    Some(current + 1)
                } else {
                    None
                }
            });
        result.map(|_| ()).map_err(|_| {
            MantisError::busy(format!(
                "{}: {} concurrent snapshot operation(s) already active",
                what, limit
            ))
        })
    }

    fn deactivate(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Start a snapshot record in `creating` state. The engine follows up
    /// with [`anchor`](Self::anchor) and [`attach_pages`](Self::attach_pages).
    pub fn begin(&self, tags: HashMap<String, String>) -> MantisResult<SnapshotId> {
        if self.runtime.is_shutting_down() {
            return Err(MantisError::ShuttingDown("snapshot".to_string()));
        }
        self.try_activate("create_snapshot")?;
        let id = Uuid::new_v4();
        let state = SnapshotState {
            meta: RwLock::new(SnapshotMetadata {
                id,
                anchor_lsn: 0,
                status: SnapshotStatus::Creating,
                checksum: None,
                size_bytes: None,
                destination: None,
                compression: self.config.compression,
                tags,
                created_at: self.runtime.clock.now(),
                completed_at: None,
                error: None,
            }),
            pages: RwLock::new(HashMap::new()),
            progress: StreamProgress::default(),
            cancel: self.runtime.shutdown.child_token(),
        };
        self.snapshots.insert(id, Arc::new(state));
        info!("📸 Snapshot {} creating", id);
        Ok(id)
    }

    /// Pin the checkpoint LSN the snapshot observes; WAL truncation and
    /// checkpoint deletion below it are blocked until cleanup.
    pub fn anchor(&self, id: SnapshotId, lsn: LSN) -> MantisResult<()> {
        let state = self.state(id)?;
        self.pins.pin(id, lsn);
        state.update_meta(|m| m.anchor_lsn = lsn);
        debug!("Snapshot {} anchored at LSN {}", id, lsn);
        Ok(())
    }

    /// Attach the captured page set; the snapshot becomes usable.
    pub fn attach_pages(&self, id: SnapshotId, pages: Vec<(PageId, String)>) -> MantisResult<()> {
        let state = self.state(id)?;
        {
            let mut map = state.pages.write().unwrap_or_else(|e| e.into_inner());
            for (page_id, key) in pages {
                map.insert(page_id, Arc::new(PageRef::new(page_id, key)));
            }
        }
        state.update_meta(|m| m.status = SnapshotStatus::Completed);
        self.deactivate();
        let count = state.pages.read().unwrap_or_else(|e| e.into_inner()).len();
        info!("📸 Snapshot {} captured {} page(s)", id, count);
        Ok(())
    }

    /// Record a failed creation and release everything; idempotent.
    pub fn fail_creation(&self, id: SnapshotId, error: &MantisError) {
        if let Some(state) = self.snapshots.get(&id) {
            let already_failed = state.meta().status == SnapshotStatus::Failed;
            state.update_meta(|m| {
                m.status = SnapshotStatus::Failed;
                m.error = Some(error.to_string());
            });
            if !already_failed {
                self.deactivate();
            }
        }
        self.cleanup(id);
        warn!("❌ Snapshot {} creation failed: {}", id, error);
    }

    /// First-write-after-anchor hook: materialize the pre-anchor value
    /// into the page ref before the writer proceeds.
    pub fn freeze_page(&self, id: SnapshotId, page_id: PageId, pre_image: &[u8]) {
        if let Some(state) = self.snapshots.get(&id) {
            let pages = state.pages.read().unwrap_or_else(|e| e.into_inner());
            if let Some(page) = pages.get(&page_id) {
                page.freeze(pre_image);
            }
        }
    }

    /// Stream the snapshot's anchor view to a destination. `read_current`
    /// resolves pages the writers never touched (their live value still
    /// equals the anchor value).
    pub async fn stream_backup<F>(
        &self,
        id: SnapshotId,
        destination_url: &str,
        read_current: F,
    ) -> MantisResult<BackupReport>
    where
        F: Fn(&str) -> Option<Vec<u8>> + Send + Sync,
    {
        let state = self.state(id)?;
        {
            let meta = state.meta();
            match meta.status {
                SnapshotStatus::Completed => {}
                SnapshotStatus::Creating | SnapshotStatus::Streaming => {
                    return Err(MantisError::busy(format!(
                        "snapshot {} is {:?}",
                        id, meta.status
                    )))
                }
                other => {
                    return Err(MantisError::invalid(format!(
                        "snapshot {} is {:?} and cannot stream",
                        id, other
                    )))
                }
            }
        }
        self.try_activate("stream_backup")?;
        state.update_meta(|m| {
            m.status = SnapshotStatus::Streaming;
            m.destination = Some(destination_url.to_string());
        });
        info!("🚚 Streaming snapshot {} to {}", id, destination_url);
        let started = self.runtime.clock.monotonic();

        let result = self
            .stream_inner(&state, id, destination_url, read_current)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((checksum, bytes, pages, verified)) => {
                state.update_meta(|m| {
                    m.status = SnapshotStatus::Completed;
                    m.checksum = Some(checksum.clone());
                    m.size_bytes = Some(bytes);
                    m.completed_at = Some(self.runtime.clock.now());
                });
                self.cleanup(id);
                self.deactivate();
                self.runtime.metrics.incr_counter("backups_completed_total", 1);
                info!(
                    "✅ Backup of snapshot {} completed: {} byte(s), sha256 {}",
                    id, bytes, checksum
                );
                Ok(BackupReport {
                    snapshot_id: id,
                    destination: destination_url.to_string(),
                    checksum,
                    bytes_streamed: bytes,
                    pages_streamed: pages,
                    verified,
                    duration_ms,
                })
            }
            Err(e) => {
                let cancelled = matches!(e, MantisError::Cancelled(_));
                state.update_meta(|m| {
                    m.status = if cancelled {
                        SnapshotStatus::Cancelled
                    } else {
                        SnapshotStatus::Failed
                    };
                    m.error = Some(e.to_string());
                    m.completed_at = Some(self.runtime.clock.now());
                });
                self.cleanup(id);
                self.deactivate();
                self.runtime.metrics.incr_counter("backups_failed_total", 1);
                warn!("❌ Backup of snapshot {} did not complete: {}", id, e);
                Err(e)
            }
        }
    }

    async fn stream_inner<F>(
        &self,
        state: &Arc<SnapshotState>,
        id: SnapshotId,
        destination_url: &str,
        read_current: F,
    ) -> MantisResult<(String, u64, u64, bool)>
    where
        F: Fn(&str) -> Option<Vec<u8>> + Send + Sync,
    {
        // Resolve the anchor view in stable page order: frozen copy when a
        // writer touched the page, live value otherwise.
        let mut refs: Vec<Arc<PageRef>> = {
            let pages = state.pages.read().unwrap_or_else(|e| e.into_inner());
            pages.values().cloned().collect()
        };
        refs.sort_by_key(|p| p.page_id);

        let mut view: Vec<(String, Vec<u8>)> = Vec::with_capacity(refs.len());
        for page in &refs {
            // Live value first, frozen copy second: a writer freezes the
            // page strictly before mutating it, so whenever the live read
            // observes a post-anchor value the frozen copy is already in
            // place and wins.
            let live = read_current(&page.key);
            match page.frozen_value().or(live) {
                Some(value) => view.push((page.key.clone(), value)),
                None => debug!("Snapshot {} page {} vanished before streaming", id, page.page_id),
            }
        }

        let header = SnapshotHeader {
            id,
            anchor_lsn: state.meta().anchor_lsn,
            timestamp_secs: self.runtime.clock.now().timestamp(),
            compression: self.config.compression,
        };

        let destination = destination_for(destination_url)?;
        let mut writer = destination.open(destination_url).await?;
        let streamed = stream::stream_snapshot(
            &header,
            &view,
            writer.as_mut(),
            &state.progress,
            &state.cancel,
        )
        .await;

        let (checksum, bytes) = match streamed {
            Ok(ok) => {
                writer.close().await?;
                ok
            }
            Err(e) => {
                let _ = writer.abort().await;
                return Err(e);
            }
        };

        // Verification pass: re-read file destinations and compare the
        // on-disk hash with the streamed one.
        let mut verified = false;
        if self.config.verify_after_stream {
            if let Some(path) = file_path_of(destination_url) {
                let actual = ChecksumAlgorithm::Sha256.compute_file(&path).await?;
                if actual != checksum {
                    return Err(MantisError::IntegrityFailure {
                        location: path.display().to_string(),
                        expected: checksum,
                        actual,
                    });
                }
                verified = true;
            }
        }

        Ok((checksum, bytes, view.len() as u64, verified))
    }

    /// Cooperative cancellation of an in-flight stream
    pub fn cancel(&self, id: SnapshotId) -> MantisResult<()> {
        let state = self.state(id)?;
        state.cancel.cancel();
        Ok(())
    }

    /// Release the pin and destroy page refs; safe to call repeatedly.
    pub fn cleanup(&self, id: SnapshotId) {
        self.pins.unpin(id);
        if let Some(state) = self.snapshots.get(&id) {
            let mut pages = state.pages.write().unwrap_or_else(|e| e.into_inner());
            pages.clear();
        }
    }

    /// Delete a snapshot record; the second call reports `NotFound`.
    pub fn delete(&self, id: SnapshotId) -> MantisResult<SnapshotMetadata> {
        let Some((_, state)) = self.snapshots.remove(&id) else {
            return Err(MantisError::not_found(format!("snapshot {}", id)));
        };
        state.cancel.cancel();
        self.pins.unpin(id);
        info!("🗑️ Deleted snapshot {}", id);
        Ok(state.meta())
    }

    pub fn get(&self, id: SnapshotId) -> MantisResult<SnapshotMetadata> {
        Ok(self.state(id)?.meta())
    }

    pub fn list(&self) -> Vec<SnapshotMetadata> {
        let mut all: Vec<SnapshotMetadata> = self.snapshots.iter().map(|e| e.value().meta()).collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    /// Streaming progress: (total pages, streamed pages, bytes)
    pub fn progress(&self, id: SnapshotId) -> MantisResult<(u64, u64, u64)> {
        Ok(self.state(id)?.progress.snapshot())
    }

    /// Pages this snapshot watches for copy-on-write
    pub fn watched_pages(&self, id: SnapshotId) -> Vec<PageId> {
        self.snapshots
            .get(&id)
            .map(|state| {
                let pages = state.pages.read().unwrap_or_else(|e| e.into_inner());
                pages.keys().copied().collect()
            })
            .unwrap_or_default()
    }

    /// Apply a retention policy over completed snapshots; returns the ids
    /// that were deleted.
    pub fn apply_retention(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<SnapshotId> {
        let mut completed: Vec<SnapshotMetadata> = self
            .snapshots
            .iter()
            .map(|e| e.value().meta())
            .filter(|m| m.status == SnapshotStatus::Completed)
            .collect();
        completed.sort_by_key(|m| std::cmp::Reverse(m.created_at));

        let mut doomed: Vec<SnapshotId> = Vec::new();
        if let Some(keep_last) = policy.keep_last {
            for meta in completed.iter().skip(keep_last as usize) {
                doomed.push(meta.id);
            }
        }
        if let Some(keep_days) = policy.keep_days {
            let cutoff = now - chrono::Duration::days(i64::from(keep_days));
            for meta in &completed {
                if meta.created_at < cutoff && !doomed.contains(&meta.id) {
                    doomed.push(meta.id);
                }
            }
        }
        for id in &doomed {
            let _ = self.delete(*id);
        }
        if !doomed.is_empty() {
            info!("🧹 Retention removed {} snapshot(s)", doomed.len());
        }
        doomed
    }

    fn state(&self, id: SnapshotId) -> MantisResult<Arc<SnapshotState>> {
        self.snapshots
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| MantisError::not_found(format!("snapshot {}", id)))
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("snapshots", &self.snapshots.len())
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(max_concurrent: usize) -> SnapshotManager {
        let config = SnapshotConfig {
            max_concurrent,
            ..SnapshotConfig::default()
        };
        SnapshotManager::new(
            config,
            Arc::new(PinRegistry::default()),
            RuntimeHandle::detached(),
        )
    }

    fn capture(manager: &SnapshotManager, pages: &[(PageId, &str)]) -> SnapshotId {
        let id = manager.begin(HashMap::new()).unwrap();
        manager.anchor(id, 10).unwrap();
        manager
            .attach_pages(id, pages.iter().map(|(p, k)| (*p, k.to_string())).collect())
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_stream_reads_frozen_copies_over_live_values() {
        let temp = TempDir::new().unwrap();
        let manager = manager(2);
        let id = capture(&manager, &[(1, "k")]);

        // Writer touched the page after the anchor: COW froze "old".
        manager.freeze_page(id, 1, b"old");

        let target = temp.path().join("backup.snap");
        let location = format!("file://{}", target.display());
        let report = manager
            .stream_backup(id, &location, |_key| Some(b"new".to_vec()))
            .await
            .unwrap();
        assert!(report.verified);
        assert_eq!(report.pages_streamed, 1);

        let bytes = std::fs::read(&target).unwrap();
        let (header, pairs) = decode_snapshot(&bytes).unwrap();
        assert_eq!(header.anchor_lsn, 10);
        assert_eq!(pairs, vec![("k".to_string(), b"old".to_vec())]);
    }

    #[tokio::test]
    async fn test_unmodified_pages_stream_live_values() {
        let temp = TempDir::new().unwrap();
        let manager = manager(2);
        let id = capture(&manager, &[(1, "a"), (2, "b")]);

        let location = format!("file://{}", temp.path().join("s.snap").display());
        manager
            .stream_backup(id, &location, |key| Some(format!("live-{}", key).into_bytes()))
            .await
            .unwrap();

        let bytes = std::fs::read(temp.path().join("s.snap")).unwrap();
        let (_, pairs) = decode_snapshot(&bytes).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), b"live-a".to_vec()),
                ("b".to_string(), b"live-b".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_returns_busy() {
        let manager = manager(1);
        let _first = manager.begin(HashMap::new()).unwrap();
        // The first snapshot is still creating; a second one must bounce.
        let err = manager.begin(HashMap::new()).unwrap_err();
        assert!(matches!(err, MantisError::Busy(_)));
    }

    #[tokio::test]
    async fn test_freeze_is_first_write_wins() {
        let page = PageRef::new(1, "k".to_string());
        assert!(page.frozen_value().is_none());
        page.freeze(b"anchor value");
        page.freeze(b"later write");
        assert_eq!(page.frozen_value(), Some(b"anchor value".to_vec()));
        assert!(page.is_dirty());
    }

    #[tokio::test]
    async fn test_delete_twice_reports_not_found() {
        let manager = manager(2);
        let id = capture(&manager, &[(1, "k")]);
        manager.delete(id).unwrap();
        let err = manager.delete(id).unwrap_err();
        assert!(matches!(err, MantisError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_final_file() {
        let temp = TempDir::new().unwrap();
        let manager = manager(2);
        let id = capture(&manager, &[(1, "k")]);
        manager.cancel(id).unwrap();

        let target = temp.path().join("cancelled.snap");
        let location = format!("file://{}", target.display());
        let err = manager
            .stream_backup(id, &location, |_key| Some(b"v".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, MantisError::Cancelled(_)));
        assert!(!target.exists());

        let meta = manager.get(id).unwrap();
        assert_eq!(meta.status, SnapshotStatus::Cancelled);
        assert!(meta.error.is_some());
    }

    #[tokio::test]
    async fn test_pin_released_after_stream() {
        let temp = TempDir::new().unwrap();
        let pins = Arc::new(PinRegistry::default());
        let manager = SnapshotManager::new(
            SnapshotConfig::default(),
            Arc::clone(&pins),
            RuntimeHandle::detached(),
        );
        let id = manager.begin(HashMap::new()).unwrap();
        manager.anchor(id, 50).unwrap();
        manager.attach_pages(id, vec![(1, "k".to_string())]).unwrap();
        assert_eq!(pins.min_pinned(), Some(50));

        let location = format!("file://{}", temp.path().join("s.snap").display());
        manager
            .stream_backup(id, &location, |_key| Some(b"v".to_vec()))
            .await
            .unwrap();
        assert_eq!(pins.min_pinned(), None);

        // Idempotent cleanup.
        manager.cleanup(id);
        manager.cleanup(id);
    }

    #[tokio::test]
    async fn test_retention_keep_last() {
        let temp = TempDir::new().unwrap();
        let manager = manager(4);
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = capture(&manager, &[(1, "k")]);
            let location = format!("file://{}", temp.path().join(format!("s{}.snap", i)).display());
            manager
                .stream_backup(id, &location, |_key| Some(b"v".to_vec()))
                .await
                .unwrap();
            ids.push(id);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let policy = RetentionPolicy {
            keep_last: Some(2),
            keep_days: None,
        };
        let deleted = manager.apply_retention(&policy, Utc::now());
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0], ids[0], "oldest completed snapshot goes first");
        assert_eq!(manager.list().len(), 2);
    }
}
