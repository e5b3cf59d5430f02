//! Memory pressure monitor
//!
//! Samples the process resident set against system memory via sysinfo.
//! When the ratio crosses the configured threshold, 10% of the cache's
//! current size is force-evicted.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use super::Cache;
use crate::runtime::RuntimeHandle;

/// Share of current cache size reclaimed per pressure event
const PRESSURE_EVICT_RATIO: f64 = 0.10;

/// Background sampler driving forced eviction
pub struct MemoryMonitor {
    cache: Arc<Cache>,
    threshold: f64,
    interval: Duration,
}

impl MemoryMonitor {
    pub fn new(cache: Arc<Cache>, threshold: f64, interval: Duration) -> Self {
        Self {
            cache,
            threshold,
            interval,
        }
    }

    /// One sample: returns the observed ratio, or `None` when the process
    /// is not visible to sysinfo.
    fn sample(system: &mut System) -> Option<f64> {
        let pid = sysinfo::get_current_pid().ok()?;
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let resident = system.process(pid)?.memory();
        Some(resident as f64 / total as f64)
    }

    /// Spawn the sampling loop; exits on runtime shutdown.
    pub fn spawn(self, runtime: RuntimeHandle) {
        tokio::spawn(async move {
            info!(
                "🧠 Memory monitor sampling every {:?} (threshold {:.0}%)",
                self.interval,
                self.threshold * 100.0
            );
            let mut system = System::new();
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                match Self::sample(&mut system) {
                    Some(ratio) => {
                        runtime.metrics.set_gauge("memory_pressure_ratio", ratio);
                        if ratio > self.threshold {
                            let target =
                                (self.cache.current_size() as f64 * PRESSURE_EVICT_RATIO) as u64;
                            warn!(
                                "⚠️ Memory pressure {:.1}% > {:.1}%, evicting {} bytes",
                                ratio * 100.0,
                                self.threshold * 100.0,
                                target
                            );
                            self.cache.force_evict(target.max(1));
                        }
                    }
                    None => debug!("Memory sample unavailable"),
                }
            }
            debug!("Memory monitor stopped");
        });
    }
}
