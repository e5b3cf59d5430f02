//! Integrity subsystem
//!
//! Binds checksums to on-disk artifacts:
//! - CRC32, MD5 and SHA-256 digests over byte slices and streamed files
//! - Corruption events with size-scaled severity
//! - A broadcast event sink consumed by the embedder
//! - A background directory scanner (see [`scanner`])

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{MantisError, MantisResult};

pub mod scanner;

pub use scanner::{IntegrityScanner, ScanReport};

/// File read chunk size for streamed hashing
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Parse the configuration name
    pub fn from_name(name: &str) -> MantisResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(MantisError::invalid(format!(
                "unknown checksum algorithm: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Crc32 => "crc32",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    /// Compute a lowercase hex digest over a byte slice
    pub fn compute(&self, data: &[u8]) -> String {
        match self {
            Self::Crc32 => format!("{:08x}", crc32fast::hash(data)),
            Self::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(data);
                format!("{:x}", hasher.finalize())
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                format!("{:x}", hasher.finalize())
            }
        }
    }

    /// Verify a byte slice against an expected hex digest
    pub fn verify(&self, data: &[u8], expected: &str) -> bool {
        self.compute(data).eq_ignore_ascii_case(expected)
    }

    /// Compute a digest by streaming a file through the hasher
    pub async fn compute_file(&self, path: &Path) -> MantisResult<String> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];

        match self {
            Self::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(format!("{:08x}", hasher.finalize()))
            }
            Self::Md5 => {
                let mut hasher = Md5::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
        }
    }

    /// Verify a file against an expected hex digest
    pub async fn verify_file(&self, path: &Path, expected: &str) -> MantisResult<bool> {
        let actual = self.compute_file(path).await?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }
}

/// What kind of damage was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorruptionKind {
    /// Content hash does not match the recorded checksum
    ChecksumMismatch,
    /// Header magic or version is unrecognized
    HeaderCorruption,
    /// Record or file ends mid-write
    TornWrite,
}

/// Severity of a corruption event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Structured corruption report published to the event sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionEvent {
    /// Artifact location (file path, WAL segment + LSN, ...)
    pub location: String,
    pub kind: CorruptionKind,
    pub expected: String,
    pub actual: String,
    /// Size of the damaged artifact in bytes
    pub size: u64,
    pub severity: Severity,
}

impl CorruptionEvent {
    /// Build an event, applying the severity rule: header and torn-write
    /// damage is always High; checksum mismatches scale with size.
    pub fn new(
        location: impl Into<String>,
        kind: CorruptionKind,
        expected: impl Into<String>,
        actual: impl Into<String>,
        size: u64,
    ) -> Self {
        let severity = match kind {
            CorruptionKind::HeaderCorruption | CorruptionKind::TornWrite => Severity::High,
            CorruptionKind::ChecksumMismatch => {
                if size > 1024 * 1024 {
                    Severity::High
                } else if size > 1024 {
                    Severity::Medium
                } else {
                    Severity::Low
                }
            }
        };
        Self {
            location: location.into(),
            kind,
            expected: expected.into(),
            actual: actual.into(),
            size,
            severity,
        }
    }
}

/// Hub that computes digests and publishes corruption events
pub struct IntegrityManager {
    algorithm: ChecksumAlgorithm,
    events: broadcast::Sender<CorruptionEvent>,
}

impl IntegrityManager {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { algorithm, events }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Subscribe to corruption events
    pub fn subscribe(&self) -> broadcast::Receiver<CorruptionEvent> {
        self.events.subscribe()
    }

    /// Publish a corruption event; delivery is best-effort when nobody
    /// is subscribed
    pub fn report(&self, event: CorruptionEvent) {
        warn!(
            location = %event.location,
            kind = ?event.kind,
            severity = ?event.severity,
            "🛑 Corruption detected"
        );
        let _ = self.events.send(event);
    }

    /// Verify a file and report + fail on mismatch
    pub async fn verify_file(&self, path: &Path, expected: &str) -> MantisResult<()> {
        let actual = self.algorithm.compute_file(path).await?;
        if actual.eq_ignore_ascii_case(expected) {
            debug!("Verified {} ({})", path.display(), self.algorithm.name());
            return Ok(());
        }
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        self.report(CorruptionEvent::new(
            path.display().to_string(),
            CorruptionKind::ChecksumMismatch,
            expected,
            actual.clone(),
            size,
        ));
        Err(MantisError::IntegrityFailure {
            location: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

impl std::fmt::Debug for IntegrityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityManager")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}
