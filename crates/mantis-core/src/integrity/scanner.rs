//! Background integrity scanner
//!
//! Periodically re-hashes the files under a directory and compares them to a
//! cached baseline, emitting corruption events for mismatches. New files are
//! absorbed into the baseline; vanished files are dropped from it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{CorruptionEvent, CorruptionKind, IntegrityManager};
use crate::error::MantisResult;
use crate::runtime::RuntimeHandle;

/// Outcome of one scan pass
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub mismatches: usize,
    pub new_files: usize,
    pub removed_files: usize,
}

/// Directory scanner with a cached digest baseline
pub struct IntegrityScanner {
    directory: PathBuf,
    integrity: Arc<IntegrityManager>,
    baseline: RwLock<HashMap<PathBuf, String>>,
}

impl IntegrityScanner {
    pub fn new(directory: PathBuf, integrity: Arc<IntegrityManager>) -> Self {
        Self {
            directory,
            integrity,
            baseline: RwLock::new(HashMap::new()),
        }
    }

    /// Hash every regular file under the directory (non-recursive), compare
    /// against the baseline and emit events for mismatches.
    pub async fn scan_once(&self) -> MantisResult<ScanReport> {
        let mut report = ScanReport::default();
        let algorithm = self.integrity.algorithm();
        let mut current: HashMap<PathBuf, String> = HashMap::new();

        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let digest = algorithm.compute_file(&path).await?;
            report.files_scanned += 1;
            current.insert(path, digest);
        }

        let mut baseline = self.baseline.write().await;
        for (path, digest) in &current {
            match baseline.get(path) {
                Some(known) if known != digest => {
                    report.mismatches += 1;
                    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
                    self.integrity.report(CorruptionEvent::new(
                        path.display().to_string(),
                        CorruptionKind::ChecksumMismatch,
                        known.clone(),
                        digest.clone(),
                        size,
                    ));
                }
                Some(_) => {}
                None => report.new_files += 1,
            }
        }
        report.removed_files = baseline.keys().filter(|p| !current.contains_key(*p)).count();
        *baseline = current;

        debug!(
            "Integrity scan of {}: {} files, {} mismatches",
            self.directory.display(),
            report.files_scanned,
            report.mismatches
        );
        Ok(report)
    }

    /// Spawn the periodic scan loop; exits when the runtime token cancels.
    pub fn spawn(self: Arc<Self>, runtime: RuntimeHandle, interval: Duration) {
        tokio::spawn(async move {
            info!(
                "🔍 Integrity scanner watching {} every {:?}",
                self.directory.display(),
                interval
            );
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.scan_once().await {
                    tracing::warn!("Integrity scan failed: {}", e);
                }
            }
            debug!("Integrity scanner stopped");
        });
    }
}
