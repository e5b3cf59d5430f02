//! Configuration for the MantisDB core
//!
//! One config struct per component, a top-level [`MantisConfig`] combining
//! them, and JSON loading for embedders that keep configuration on disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MantisError, MantisResult};

/// Top-level configuration handed to [`crate::storage::MantisDb::open`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MantisConfig {
    /// Root data directory; WAL, checkpoints and snapshots live below it
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    pub checkpoint: CheckpointConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub snapshot: SnapshotConfig,
    pub integrity: IntegrityConfig,
}

impl Default for MantisConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            wal: WalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            lock: LockConfig::default(),
            cache: CacheConfig::default(),
            snapshot: SnapshotConfig::default(),
            integrity: IntegrityConfig::default(),
        }
    }
}

impl MantisConfig {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> MantisResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints before the engine starts
    pub fn validate(&self) -> MantisResult<()> {
        if self.wal.segment_size < 4096 {
            return Err(MantisError::invalid(format!(
                "wal.segment_size must be at least 4096 bytes, got {}",
                self.wal.segment_size
            )));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(MantisError::invalid("cache.max_size_bytes must be non-zero"));
        }
        if self.cache.max_entries == 0 {
            return Err(MantisError::invalid("cache.max_entries must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.cache.memory_pressure_threshold) {
            return Err(MantisError::invalid(format!(
                "cache.memory_pressure_threshold must be within [0, 1], got {}",
                self.cache.memory_pressure_threshold
            )));
        }
        if self.lock.shards == 0 {
            return Err(MantisError::invalid("lock.shards must be non-zero"));
        }
        if self.lock.max_cycle_length < 2 {
            return Err(MantisError::invalid(
                "lock.max_cycle_length must be at least 2",
            ));
        }
        if self.snapshot.max_concurrent == 0 {
            return Err(MantisError::invalid(
                "snapshot.max_concurrent must be non-zero",
            ));
        }
        crate::cache::policy_from_name(&self.cache.eviction_policy)?;
        crate::lock::VictimPolicy::from_name(&self.lock.victim_policy)?;
        crate::integrity::ChecksumAlgorithm::from_name(&self.integrity.algorithm)?;
        Ok(())
    }

    /// Directory for WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory for checkpoint artifacts and the catalog
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory for streamed snapshot files
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Path of the persisted backup schedule definitions
    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir.join("backup_schedules.json")
    }
}

/// Write-ahead log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Maximum size of a single WAL segment file before rotation
    pub segment_size: u64,
    /// Fsync on every append instead of at commit boundaries
    pub sync_on_append: bool,
    /// Buffer size for the segment writer
    pub buffer_size: usize,
    /// Continue replay past a record whose payload checksum fails but whose
    /// header is intact, emitting a corruption event per skipped record
    pub skip_corrupt_records: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024, // 64 MB
            sync_on_append: false,
            buffer_size: 256 * 1024, // 256 KB
            skip_corrupt_records: false,
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Seconds between automatic checkpoints (0 disables the timer)
    pub interval_secs: u64,
    /// Validate data consistency as part of recovery
    pub validate_on_recovery: bool,
    /// Write a fresh checkpoint once recovery completes
    pub checkpoint_after_recovery: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // 5 minutes
            validate_on_recovery: true,
            checkpoint_after_recovery: false,
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Number of lock table shards (resource-hash distributed)
    pub shards: usize,
    /// Reject out-of-order acquisitions with `HierarchyViolation`; when
    /// disabled, cycles are left to the deadlock detector
    pub enforce_hierarchy: bool,
    /// Base acquisition timeout in milliseconds; the adaptive timeout is
    /// clamped to [base, 5 * base]
    pub base_timeout_ms: u64,
    /// Adaptive timeout adjustment factor
    pub adaptive_factor: f64,
    /// Deadlock detector sweep interval in milliseconds
    pub detector_interval_ms: u64,
    /// Cycles longer than this are ignored by the detector
    pub max_cycle_length: usize,
    /// Victim selection policy: youngest, oldest, fewest_locks, most_locks,
    /// lowest_cost or adaptive
    pub victim_policy: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            enforce_hierarchy: true,
            base_timeout_ms: 5_000,
            adaptive_factor: 0.15,
            detector_interval_ms: 100,
            max_cycle_length: 16,
            victim_policy: "adaptive".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget across all shards
    pub max_size_bytes: u64,
    /// Entry count budget across all shards
    pub max_entries: usize,
    /// Number of cache shards
    pub shards: usize,
    /// Eviction policy name: lru, lfu, ttl or adaptive
    pub eviction_policy: String,
    /// Default TTL in seconds applied by the engine's read-fill path
    /// (0 means entries do not expire)
    pub default_ttl_secs: u64,
    /// Process-RSS / total-memory ratio that triggers forced eviction
    pub memory_pressure_threshold: f64,
    /// Seconds between memory pressure samples (0 disables the monitor)
    pub memory_sample_interval_secs: u64,
    /// Seconds between expired-entry sweeps (0 disables the sweeper)
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            max_entries: 100_000,
            shards: 16,
            eviction_policy: "lru".to_string(),
            default_ttl_secs: 0,
            memory_pressure_threshold: 0.85,
            memory_sample_interval_secs: 10,
            sweep_interval_secs: 30,
        }
    }
}

/// Snapshot and backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum snapshots and backup streams active at once
    pub max_concurrent: usize,
    /// Compression applied to streamed snapshot files
    pub compression: crate::storage::snapshot::Compression,
    /// Verify file destinations by re-reading after streaming
    pub verify_after_stream: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            compression: crate::storage::snapshot::Compression::None,
            verify_after_stream: true,
        }
    }
}

/// Integrity subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Algorithm for file-level digests: crc32, md5 or sha256
    pub algorithm: String,
    /// Seconds between background directory scans (0 disables the scanner)
    pub scan_interval_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            algorithm: "sha256".to_string(),
            scan_interval_secs: 0,
        }
    }
}
