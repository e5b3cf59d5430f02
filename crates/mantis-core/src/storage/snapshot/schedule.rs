//! Backup schedules
//!
//! Schedule definitions persist to `<data>/backup_schedules.json` (written
//! temp + rename). Cron *parsing* is out of scope for the core: the
//! expression is stored verbatim and due-time computation happens behind
//! the [`CronSchedule`] trait supplied by the embedder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MantisError, MantisResult};

/// How many streamed backups a schedule keeps around
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_days: Option<u32>,
}

impl RetentionPolicy {
    /// Parse `keep-last=5,keep-days=30` style policies
    pub fn parse(raw: &str) -> MantisResult<Self> {
        let mut policy = Self::default();
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| MantisError::invalid(format!("bad retention clause: {}", part)))?;
            let parsed: u32 = value
                .parse()
                .map_err(|_| MantisError::invalid(format!("bad retention value: {}", value)))?;
            match key {
                "keep-last" => policy.keep_last = Some(parsed),
                "keep-days" => policy.keep_days = Some(parsed),
                other => {
                    return Err(MantisError::invalid(format!(
                        "unknown retention key: {}",
                        other
                    )))
                }
            }
        }
        Ok(policy)
    }
}

/// One persisted schedule definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: Uuid,
    /// Stored verbatim; interpreted by the embedder's [`CronSchedule`]
    pub cron: String,
    pub destination: String,
    pub retention: RetentionPolicy,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Externally supplied cron semantics
pub trait CronSchedule: Send + Sync {
    /// Next fire time of `expr` strictly after `after`; `None` when the
    /// expression never fires again
    fn next_fire(&self, expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Persistent schedule store
pub struct ScheduleStore {
    path: PathBuf,
    schedules: RwLock<Vec<BackupSchedule>>,
}

impl ScheduleStore {
    pub async fn open(path: PathBuf) -> MantisResult<Self> {
        let schedules = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            schedules: RwLock::new(schedules),
        })
    }

    async fn persist(&self, schedules: &[BackupSchedule]) -> MantisResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_string_pretty(schedules)?).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    /// Register a schedule and persist the store
    pub async fn add(
        &self,
        cron: String,
        destination: String,
        retention: RetentionPolicy,
        tags: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> MantisResult<BackupSchedule> {
        if cron.trim().is_empty() {
            return Err(MantisError::invalid("empty cron expression"));
        }
        let schedule = BackupSchedule {
            id: Uuid::new_v4(),
            cron,
            destination,
            retention,
            tags,
            created_at: now,
            last_run: None,
        };
        let mut schedules = self.schedules.write().await;
        schedules.push(schedule.clone());
        self.persist(&schedules).await?;
        info!("📅 Backup schedule {} added ({})", schedule.id, schedule.cron);
        Ok(schedule)
    }

    /// Remove a schedule; `NotFound` when absent
    pub async fn remove(&self, id: Uuid) -> MantisResult<()> {
        let mut schedules = self.schedules.write().await;
        let before = schedules.len();
        schedules.retain(|s| s.id != id);
        if schedules.len() == before {
            return Err(MantisError::not_found(format!("schedule {}", id)));
        }
        self.persist(&schedules).await?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<BackupSchedule> {
        self.schedules.read().await.clone()
    }

    /// Schedules due at `now` per the embedder's cron semantics
    pub async fn due(&self, now: DateTime<Utc>, cron: &dyn CronSchedule) -> Vec<BackupSchedule> {
        let schedules = self.schedules.read().await;
        schedules
            .iter()
            .filter(|s| {
                let reference = s.last_run.unwrap_or(s.created_at);
                match cron.next_fire(&s.cron, reference) {
                    Some(fire) => fire <= now,
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    /// Record a completed run
    pub async fn mark_ran(&self, id: Uuid, at: DateTime<Utc>) -> MantisResult<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| MantisError::not_found(format!("schedule {}", id)))?;
        schedule.last_run = Some(at);
        self.persist(&schedules).await?;
        debug!("Schedule {} ran at {}", id, at);
        Ok(())
    }
}

impl std::fmt::Debug for ScheduleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleStore").field("path", &self.path).finish()
    }
}
