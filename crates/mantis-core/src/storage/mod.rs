//! Storage layer: WAL, checkpoints/recovery, snapshots/backups and the
//! engine facade binding them to the lock manager and cache.

pub mod checkpoint;
pub mod engine;
pub mod snapshot;
pub mod wal;

pub use checkpoint::{
    CheckpointData, CheckpointEntry, CheckpointKind, CheckpointManager, CheckpointStatus,
    PinRegistry, RecoveredState, RecoveryManager, RecoveryOptions, RecoveryStats,
};
pub use engine::{DbStats, MantisDb};
pub use snapshot::{
    decode_snapshot, destination_for, BackupDestination, BackupReport, BackupSchedule,
    Compression, CronSchedule, DestinationWriter, PageId, PageRef, RetentionPolicy, ScheduleStore,
    SnapshotId, SnapshotManager, SnapshotMetadata, SnapshotStatus, StreamProgress,
};
pub use wal::{LSN, ReplayOutcome, TxnId, WALManager, WALRecord, WalOp, WalPayload};
