//! CLI for MantisDB backups, checkpoints and recovery
//!
//! Usage:
//!   mantis --data ./data backup create --destination file:///backups/full.snap --tag env=prod
//!   mantis --data ./data backup schedule add --cron "0 3 * * *" --destination s3://bucket/nightly --retention keep-last=7
//!   mantis --data ./data checkpoint create --type incremental
//!   mantis --data ./data recover --to-lsn 1200
//!   mantis --data ./data cache stats
//!   mantis --data ./data lock stats

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use mantis_core::storage::CheckpointKind;
use mantis_core::{
    ErrorKind, MantisConfig, MantisDb, MantisError, NullMetrics, RecoveryOptions, RetentionPolicy,
};

/// Exit codes: 0 success, 2 config error, 3 integrity failure, 4 timeout,
/// 5 busy
fn exit_code_for(err: &MantisError) -> i32 {
    match err.kind() {
        ErrorKind::InvalidArgument => 2,
        ErrorKind::IntegrityFailure | ErrorKind::CorruptionDetected => 3,
        ErrorKind::Timeout => 4,
        ErrorKind::Busy => 5,
        _ => 1,
    }
}

#[derive(Parser)]
#[command(name = "mantis")]
#[command(about = "MantisDB backup, checkpoint and recovery tooling", long_about = None)]
struct Cli {
    /// Data directory of the database
    #[arg(short, long, default_value = "./data")]
    data: PathBuf,

    /// Optional JSON configuration file (overrides --data)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Checkpoint operations
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Recover the database to a target LSN or point in time
    Recover {
        /// Target LSN (inclusive)
        #[arg(long)]
        to_lsn: Option<u64>,

        /// Target time (ISO 8601, e.g. 2026-08-01T12:00:00Z)
        #[arg(long)]
        to_time: Option<String>,
    },
    /// Cache introspection
    Cache {
        #[command(subcommand)]
        command: StatsCommands,
    },
    /// Lock manager introspection
    Lock {
        #[command(subcommand)]
        command: StatsCommands,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a snapshot and stream it to a destination
    Create {
        /// Destination URL (file://, s3://, gcs://, azure://)
        #[arg(short, long)]
        destination: String,

        /// Tags attached to the snapshot (key=value, repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Manage backup schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Register a new schedule
    Add {
        /// Cron expression (interpreted by the embedding scheduler)
        #[arg(long)]
        cron: String,

        /// Destination URL
        #[arg(short, long)]
        destination: String,

        /// Retention policy, e.g. keep-last=7,keep-days=30
        #[arg(short, long, default_value = "")]
        retention: String,

        /// Tags attached to scheduled snapshots (key=value, repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// List registered schedules
    List,
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Write a checkpoint sealing the current state
    Create {
        /// Checkpoint type
        #[arg(short = 't', long = "type", default_value = "full")]
        kind: String,
    },
}

#[derive(Subcommand)]
enum StatsCommands {
    /// Print statistics as JSON
    Stats,
}

fn parse_tags(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut tags = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("tag must be key=value, got: {}", entry))?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

fn load_config(cli: &Cli) -> Result<MantisConfig, MantisError> {
    match &cli.config {
        Some(path) => MantisConfig::from_file(path),
        None => Ok(MantisConfig::with_data_dir(&cli.data)),
    }
}

async fn open_db(cli: &Cli) -> Result<Arc<MantisDb>, MantisError> {
    MantisDb::open(load_config(cli)?).await
}

async fn run(cli: Cli) -> Result<(), MantisError> {
    match &cli.command {
        Commands::Backup { command } => match command {
            BackupCommands::Create { destination, tag } => {
                let tags = parse_tags(tag).map_err(|e| MantisError::invalid(e.to_string()))?;
                let db = open_db(&cli).await?;
                let report = db.backup_to(destination, tags).await?;
                db.shutdown().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            BackupCommands::Schedule { command } => match command {
                ScheduleCommands::Add {
                    cron,
                    destination,
                    retention,
                    tag,
                } => {
                    let tags = parse_tags(tag).map_err(|e| MantisError::invalid(e.to_string()))?;
                    let retention = RetentionPolicy::parse(retention)?;
                    let db = open_db(&cli).await?;
                    let schedule = db
                        .schedules()
                        .add(cron.clone(), destination.clone(), retention, tags, Utc::now())
                        .await?;
                    db.shutdown().await?;
                    println!("{}", serde_json::to_string_pretty(&schedule)?);
                    Ok(())
                }
                ScheduleCommands::List => {
                    let db = open_db(&cli).await?;
                    let schedules = db.schedules().list().await;
                    db.shutdown().await?;
                    println!("{}", serde_json::to_string_pretty(&schedules)?);
                    Ok(())
                }
            },
        },
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Create { kind } => {
                let kind = CheckpointKind::from_name(kind)?;
                let db = open_db(&cli).await?;
                let entry = db.checkpoint(kind, HashMap::new()).await?;
                db.shutdown().await?;
                println!("{}", serde_json::to_string_pretty(&entry)?);
                Ok(())
            }
        },
        Commands::Recover { to_lsn, to_time } => {
            let target_time = match to_time {
                Some(raw) => Some(
                    raw.parse::<DateTime<Utc>>()
                        .map_err(|e| MantisError::invalid(format!("bad --to-time: {}", e)))?,
                ),
                None => None,
            };
            let options = RecoveryOptions {
                target_lsn: *to_lsn,
                target_time,
                validate: true,
                // Seal the recovered state so a later restart does not
                // replay past the target again.
                checkpoint_after: true,
            };
            let config = load_config(&cli)?;
            let db = MantisDb::open_with(config, options, Arc::new(NullMetrics)).await?;
            let stats = db.stats();
            db.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Cache { command: StatsCommands::Stats } => {
            let db = open_db(&cli).await?;
            let stats = db.cache_stats();
            db.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Lock { command: StatsCommands::Stats } => {
            let db = open_db(&cli).await?;
            let stats = db.lock_stats();
            db.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(exit_code_for(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&MantisError::invalid("bad flag")), 2);
        assert_eq!(
            exit_code_for(&MantisError::IntegrityFailure {
                location: "f".to_string(),
                expected: "a".to_string(),
                actual: "b".to_string(),
            }),
            3
        );
        assert_eq!(
            exit_code_for(&MantisError::Timeout {
                txn: 1,
                resource: "r".to_string(),
                waited_ms: 10,
            }),
            4
        );
        assert_eq!(exit_code_for(&MantisError::busy("limit")), 5);
        assert_eq!(exit_code_for(&MantisError::not_found("x")), 1);
    }

    #[test]
    fn test_tag_parsing() {
        let tags = parse_tags(&["env=prod".to_string(), "team=storage".to_string()]).unwrap();
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(tags.len(), 2);
        assert!(parse_tags(&["no-equals".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_backup_create() {
        let cli = Cli::try_parse_from([
            "mantis",
            "--data",
            "/tmp/db",
            "backup",
            "create",
            "--destination",
            "file:///tmp/out.snap",
            "--tag",
            "env=test",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup {
                command: BackupCommands::Create { destination, tag },
            } => {
                assert_eq!(destination, "file:///tmp/out.snap");
                assert_eq!(tag, vec!["env=test".to_string()]);
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn test_cli_parses_recover_targets() {
        let cli = Cli::try_parse_from(["mantis", "recover", "--to-lsn", "1200"]).unwrap();
        match cli.command {
            Commands::Recover { to_lsn, to_time } => {
                assert_eq!(to_lsn, Some(1200));
                assert!(to_time.is_none());
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
