//! # MantisDB Core
//!
//! Embeddable key-value database core: a write-ahead log with
//! checkpointing, an in-memory cache with pluggable eviction and memory
//! pressure response, a read/write lock manager with hierarchy-based
//! deadlock prevention and cycle-based detection, hot-backup snapshots
//! with copy-on-write and streaming verification, and a checksum
//! integrity subsystem.
//!
//! ```no_run
//! use mantis_core::{MantisConfig, MantisDb};
//!
//! # async fn demo() -> mantis_core::MantisResult<()> {
//! let db = MantisDb::open(MantisConfig::with_data_dir("./data")).await?;
//! db.put("user:1", b"alice").await?;
//! assert_eq!(db.get("user:1").await?, Some(b"alice".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod integrity;
pub mod lock;
pub mod metrics;
pub mod runtime;
pub mod storage;

pub use cache::{Cache, CacheStats, EvictionPolicy};
pub use cache::policy_from_name;
pub use config::MantisConfig;
pub use error::{ErrorKind, ErrorSeverity, MantisError, MantisResult};
pub use integrity::{ChecksumAlgorithm, CorruptionEvent, CorruptionKind, IntegrityManager, Severity};
pub use lock::{DeadlockDetector, LockManager, LockMode, LockStats, VictimPolicy};
pub use metrics::{HealthReport, InMemoryMetrics, MetricsSink, NullMetrics};
pub use runtime::{Clock, RuntimeHandle, SystemClock};
pub use storage::{
    BackupReport, CheckpointEntry, CheckpointKind, Compression, CronSchedule, DbStats, MantisDb,
    RecoveryOptions, RetentionPolicy, SnapshotId, SnapshotMetadata, SnapshotStatus, TxnId, LSN,
};
