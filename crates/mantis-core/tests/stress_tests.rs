//! Concurrency stress tests: mixed random workloads against the engine
//! with invariants checked along the way and after a restart.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use mantis_core::storage::CheckpointKind;
use mantis_core::{MantisConfig, MantisDb};

fn stress_config(temp: &TempDir) -> MantisConfig {
    let mut config = MantisConfig::with_data_dir(temp.path().join("data"));
    config.checkpoint.interval_secs = 0;
    config.cache.memory_sample_interval_secs = 0;
    config.cache.sweep_interval_secs = 0;
    config.cache.max_size_bytes = 16 * 1024;
    config.cache.max_entries = 64;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_workload_keeps_invariants() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(stress_config(&temp)).await.unwrap();

    let mut writers = Vec::new();
    for worker in 0..4u64 {
        let db = Arc::clone(&db);
        writers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(worker);
            for i in 0..100u32 {
                let key = format!("key-{:02}", rng.gen_range(0..32));
                match rng.gen_range(0..10) {
                    0..=5 => {
                        let value = format!("w{}-i{}", worker, i).into_bytes();
                        db.put(&key, &value).await.unwrap();
                    }
                    6..=8 => {
                        let _ = db.get(&key).await.unwrap();
                    }
                    _ => {
                        let _ = db.delete(&key).await.unwrap();
                    }
                }
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    // Cache budgets hold after the dust settles.
    let cache = db.cache_stats();
    assert!(cache.current_size_bytes <= cache.max_size_bytes);
    assert!(cache.entry_count <= cache.max_entries as u64);

    // No deadlocks possible: every operation touches a single key.
    let locks = db.lock_stats();
    assert_eq!(locks.deadlocks_detected, 0);
    assert_eq!(locks.waiting_requests, 0);

    // Cached reads agree with the store after a restart.
    let mut expectation = HashMap::new();
    for i in 0..32u32 {
        let key = format!("key-{:02}", i);
        expectation.insert(key.clone(), db.get(&key).await.unwrap());
    }
    db.shutdown().await.unwrap();
    drop(db);

    let db = MantisDb::open(stress_config(&temp)).await.unwrap();
    for (key, expected) in expectation {
        assert_eq!(
            db.get(&key).await.unwrap(),
            expected,
            "key {} diverged across restart",
            key
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoints_race_commits() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(stress_config(&temp)).await.unwrap();

    // Writers commit continuously while checkpoints capture the sealed
    // view; every acknowledged put must survive recovery exactly once.
    let mut workers = Vec::new();
    for worker in 0..3u64 {
        let db = Arc::clone(&db);
        workers.push(tokio::spawn(async move {
            for i in 0..60u32 {
                let key = format!("w{}-k{:02}", worker, i % 8);
                let value = format!("w{}-i{}", worker, i).into_bytes();
                db.put(&key, &value).await.unwrap();
            }
        }));
    }
    let checkpointer = {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            for _ in 0..12 {
                db.checkpoint(CheckpointKind::Full, HashMap::new())
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    for worker in workers {
        worker.await.unwrap();
    }
    checkpointer.await.unwrap();

    let mut expected = HashMap::new();
    for worker in 0..3u64 {
        for slot in 0..8u32 {
            let key = format!("w{}-k{:02}", worker, slot);
            expected.insert(key.clone(), db.get(&key).await.unwrap());
        }
    }
    db.shutdown().await.unwrap();
    drop(db);

    let db = MantisDb::open(stress_config(&temp)).await.unwrap();
    for (key, value) in expected {
        assert_eq!(
            db.get(&key).await.unwrap(),
            value,
            "key {} diverged after checkpoint-heavy recovery",
            key
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_under_write_load() {
    let temp = TempDir::new().unwrap();
    let db = MantisDb::open(stress_config(&temp)).await.unwrap();

    for i in 0..16u32 {
        db.put(&format!("base-{:02}", i), b"anchor").await.unwrap();
    }

    let snapshot = db.create_snapshot(HashMap::new()).await.unwrap();

    // Hammer the same keys while the snapshot streams.
    let writer_db = Arc::clone(&db);
    let writer = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let key = format!("base-{:02}", rng.gen_range(0..16));
            writer_db.put(&key, b"mutated").await.unwrap();
        }
    });

    let target = temp.path().join("backups/underload.snap");
    let location = format!("file://{}", target.display());
    let report = db.stream_backup(snapshot.id, &location).await.unwrap();
    writer.await.unwrap();

    assert!(report.verified);
    let bytes = std::fs::read(&target).unwrap();
    let (_, pairs) = mantis_core::storage::decode_snapshot(&bytes).unwrap();
    assert_eq!(pairs.len(), 16);
    for (key, value) in pairs {
        assert_eq!(
            value,
            b"anchor".to_vec(),
            "page {} leaked a post-anchor write into the stream",
            key
        );
    }
}
