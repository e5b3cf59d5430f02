//! Hot-backup integration tests: COW consistency, verification, limits
//! and scheduled backups.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tempfile::TempDir;

use mantis_core::storage::decode_snapshot;
use mantis_core::{CronSchedule, ErrorKind, MantisConfig, MantisDb, RetentionPolicy, SnapshotStatus};

fn test_config(temp: &TempDir) -> MantisConfig {
    let mut config = MantisConfig::with_data_dir(temp.path().join("data"));
    config.checkpoint.interval_secs = 0;
    config.cache.memory_sample_interval_secs = 0;
    config.cache.sweep_interval_secs = 0;
    config
}

#[tokio::test]
async fn test_snapshot_sees_pre_write_state() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    db.put("k", b"old").await.unwrap();

    let snapshot = db.create_snapshot(HashMap::new()).await.unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Completed);

    // A writer lands between snapshot creation and streaming.
    db.put("k", b"new").await.unwrap();

    let target = temp.path().join("backups/pre-write.snap");
    let location = format!("file://{}", target.display());
    let report = db.stream_backup(snapshot.id, &location).await.unwrap();
    assert!(report.verified);

    let bytes = std::fs::read(&target).unwrap();
    let (header, pairs) = decode_snapshot(&bytes).unwrap();
    assert_eq!(header.anchor_lsn, snapshot.anchor_lsn);
    assert_eq!(pairs, vec![("k".to_string(), b"old".to_vec())]);

    // The stored checksum equals the hash of the streamed bytes.
    let meta = db.list_snapshots().into_iter().find(|m| m.id == snapshot.id).unwrap();
    assert_eq!(meta.checksum.as_deref(), Some(report.checksum.as_str()));

    // After the snapshot completes, the live value is visible.
    assert_eq!(db.get("k").await.unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
async fn test_deletes_after_anchor_do_not_leak() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    db.put("kept", b"1").await.unwrap();
    db.put("doomed", b"2").await.unwrap();

    let snapshot = db.create_snapshot(HashMap::new()).await.unwrap();
    db.delete("doomed").await.unwrap();

    let target = temp.path().join("backups/deleted.snap");
    let location = format!("file://{}", target.display());
    db.stream_backup(snapshot.id, &location).await.unwrap();

    let (_, mut pairs) = decode_snapshot(&std::fs::read(&target).unwrap()).unwrap();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("doomed".to_string(), b"2".to_vec()),
            ("kept".to_string(), b"1".to_vec()),
        ],
        "the anchor view still contains the later-deleted key"
    );
    assert_eq!(db.get("doomed").await.unwrap(), None);
}

#[tokio::test]
async fn test_uncommitted_transaction_stays_out_of_snapshot() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    db.put("k", b"committed").await.unwrap();

    let txn = db.begin().unwrap();
    db.txn_put(txn, "k", b"tentative").await.unwrap();

    let snapshot = db.create_snapshot(HashMap::new()).await.unwrap();
    db.commit(txn).await.unwrap();

    let target = temp.path().join("backups/clean.snap");
    let location = format!("file://{}", target.display());
    db.stream_backup(snapshot.id, &location).await.unwrap();

    let (_, pairs) = decode_snapshot(&std::fs::read(&target).unwrap()).unwrap();
    assert_eq!(
        pairs,
        vec![("k".to_string(), b"committed".to_vec())],
        "the anchor observes committed state only"
    );
    assert_eq!(db.get("k").await.unwrap(), Some(b"tentative".to_vec()));
}

#[tokio::test]
async fn test_concurrent_snapshot_limit() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.snapshot.max_concurrent = 2;
    let db = MantisDb::open(config).await.unwrap();
    db.put("k", b"v").await.unwrap();

    let first = db.create_snapshot(HashMap::new()).await.unwrap();
    let second = db.create_snapshot(HashMap::new()).await.unwrap();
    assert_ne!(first.id, second.id);

    // Both completed snapshots release their slots; two more fit.
    let third = db.create_snapshot(HashMap::new()).await.unwrap();
    assert_eq!(third.status, SnapshotStatus::Completed);
}

#[tokio::test]
async fn test_unsupported_destination_schemes() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    db.put("k", b"v").await.unwrap();
    let snapshot = db.create_snapshot(HashMap::new()).await.unwrap();

    let err = db
        .stream_backup(snapshot.id, "gcs://bucket/object")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let meta = db.list_snapshots().into_iter().find(|m| m.id == snapshot.id).unwrap();
    assert_eq!(meta.status, SnapshotStatus::Failed);
    assert!(meta.error.is_some(), "failures are recorded, not garbage-collected");
}

/// Fixed-interval cron stand-in (real cron parsing is external)
struct EveryFiveMinutes;

impl CronSchedule for EveryFiveMinutes {
    fn next_fire(&self, _expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(after + chrono::Duration::minutes(5))
    }
}

#[tokio::test]
async fn test_scheduled_backup_runs_and_records() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    db.put("k", b"v").await.unwrap();

    let destination = format!("file://{}", temp.path().join("backups/sched.snap").display());
    let schedule = db
        .schedules()
        .add(
            "*/5 * * * *".to_string(),
            destination.clone(),
            RetentionPolicy::parse("keep-last=3").unwrap(),
            HashMap::new(),
            Utc::now() - chrono::Duration::hours(1),
        )
        .await
        .unwrap();

    let ran = db.run_due_backups(&EveryFiveMinutes).await.unwrap();
    assert_eq!(ran, 1);
    assert!(temp.path().join("backups/sched.snap").exists());

    let listed = db.schedules().list().await;
    assert_eq!(listed[0].id, schedule.id);
    assert!(listed[0].last_run.is_some());

    // Freshly run schedules are no longer due.
    assert_eq!(db.run_due_backups(&EveryFiveMinutes).await.unwrap(), 0);
}

#[tokio::test]
async fn test_backup_schedules_persist_across_restart() {
    let temp = TempDir::new().unwrap();
    let schedule_id = {
        let db = MantisDb::open(test_config(&temp)).await.unwrap();
        let schedule = db
            .schedules()
            .add(
                "0 3 * * *".to_string(),
                "file:///backups/nightly.snap".to_string(),
                RetentionPolicy::default(),
                HashMap::from([("purpose".to_string(), "nightly".to_string())]),
                Utc::now(),
            )
            .await
            .unwrap();
        db.shutdown().await.unwrap();
        schedule.id
    };

    let db = MantisDb::open(test_config(&temp)).await.unwrap();
    let listed = db.schedules().list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, schedule_id);
    assert_eq!(listed[0].tags.get("purpose").map(String::as_str), Some("nightly"));
}
