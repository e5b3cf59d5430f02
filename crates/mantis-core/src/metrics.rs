//! Observability interface
//!
//! The core reports counters, gauges and histograms through an abstract
//! sink; formatting (Prometheus, JSON, ...) lives outside the core.
//! [`InMemoryMetrics`] keeps atomic registries for embedders and tests,
//! [`NullMetrics`] drops everything.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Abstract metrics sink implemented by the embedder
pub trait MetricsSink: Send + Sync {
    /// Add `delta` to a monotonically increasing counter
    fn incr_counter(&self, name: &'static str, delta: u64);

    /// Set a point-in-time gauge value
    fn set_gauge(&self, name: &'static str, value: f64);

    /// Record one observation into a histogram
    fn observe(&self, name: &'static str, value: f64);
}

/// Sink that discards all metrics
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr_counter(&self, _name: &'static str, _delta: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
    fn observe(&self, _name: &'static str, _value: f64) {}
}

/// In-memory sink backed by atomic registries
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<&'static str, AtomicU64>,
    gauges: DashMap<&'static str, AtomicU64>,
    histograms: DashMap<&'static str, Mutex<HistogramState>>,
}

#[derive(Debug, Default, Clone)]
struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value, 0 when never incremented
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current gauge value, if ever set
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    /// Aggregated histogram view
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.get(name).map(|h| {
            let state = h.lock().unwrap_or_else(|e| e.into_inner());
            HistogramSummary {
                count: state.count,
                sum: state.sum,
                min: state.min,
                max: state.max,
                mean: if state.count > 0 {
                    state.sum / state.count as f64
                } else {
                    0.0
                },
            }
        })
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &'static str, delta: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.gauges
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn observe(&self, name: &'static str, value: f64) {
        let entry = self
            .histograms
            .entry(name)
            .or_insert_with(|| Mutex::new(HistogramState::default()));
        let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
        if state.count == 0 {
            state.min = value;
            state.max = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
        state.count += 1;
        state.sum += value;
    }
}

/// Aggregate view of one histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Health state of one component, surfaced by the engine's health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub component: &'static str,
    pub healthy: bool,
    pub detail: String,
}

impl HealthReport {
    pub fn healthy(component: &'static str) -> Self {
        Self {
            component,
            healthy: true,
            detail: String::new(),
        }
    }

    pub fn unhealthy(component: &'static str, detail: impl Into<String>) -> Self {
        Self {
            component,
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Aggregate health across components
pub fn overall_healthy(reports: &[HealthReport]) -> bool {
    reports.iter().all(|r| r.healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = InMemoryMetrics::new();
        metrics.incr_counter("wal_appends_total", 1);
        metrics.incr_counter("wal_appends_total", 2);
        assert_eq!(metrics.counter("wal_appends_total"), 3);
        assert_eq!(metrics.counter("never_touched"), 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = InMemoryMetrics::new();
        metrics.set_gauge("cache_size_bytes", 10.0);
        metrics.set_gauge("cache_size_bytes", 4.5);
        assert_eq!(metrics.gauge("cache_size_bytes"), Some(4.5));
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = InMemoryMetrics::new();
        metrics.observe("lock_wait_ms", 2.0);
        metrics.observe("lock_wait_ms", 6.0);
        let summary = metrics.histogram("lock_wait_ms").unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 6.0);
        assert_eq!(summary.mean, 4.0);
    }

    #[test]
    fn test_overall_health() {
        let reports = vec![
            HealthReport::healthy("wal"),
            HealthReport::unhealthy("cache", "pressure above threshold"),
        ];
        assert!(!overall_healthy(&reports));
    }
}
