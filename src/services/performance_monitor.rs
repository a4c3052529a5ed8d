use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::types::TenantId;

/// Overall verdict of a performance summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: String,
    pub tenant_id: TenantId,
    /// Calls since start or last reset
    pub count: u64,
    /// Statistics over the rolling window
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub slow_count: u64,
    pub alert_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSummary {
    /// Lookup that consulted the cache
    pub operation: String,
    pub tenant_id: TenantId,
    pub hits: u64,
    pub misses: u64,
    /// None until the first lookup
    pub hit_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub operations: Vec<OperationSummary>,
    pub cache: Vec<CacheSummary>,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct OperationStats {
    count: AtomicU64,
    slow: AtomicU64,
    alerts: AtomicU64,
    recent: Mutex<VecDeque<u64>>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Latency and cache-hit bookkeeping for hierarchy operations.
///
/// Recording is a counter bump plus a bounded push; it never fails the
/// operation being measured.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    operations: DashMap<(&'static str, TenantId), Arc<OperationStats>>,
    cache: DashMap<(&'static str, TenantId), Arc<CacheCounters>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            operations: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start timing an operation; elapsed time is recorded when the guard drops
    pub fn start(&self, operation: &'static str, tenant_id: TenantId) -> OperationTimer<'_> {
        OperationTimer {
            monitor: self,
            operation,
            tenant_id,
            started: Instant::now(),
        }
    }

    pub fn record(&self, operation: &'static str, tenant_id: TenantId, elapsed: Duration) {
        let stats = self
            .operations
            .entry((operation, tenant_id))
            .or_default()
            .value()
            .clone();

        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        stats.count.fetch_add(1, Ordering::Relaxed);

        match stats.recent.lock() {
            Ok(mut window) => {
                while window.len() >= self.config.latency_window.max(1) {
                    window.pop_front();
                }
                window.push_back(micros);
            }
            Err(_) => debug!("Latency window for '{}' unavailable, sample dropped", operation),
        }

        let millis = elapsed.as_millis();
        if millis > u128::from(self.config.alert_threshold_ms) {
            stats.alerts.fetch_add(1, Ordering::Relaxed);
            error!(
                "Performance alert: {} took {}ms for tenant {} (threshold {}ms)",
                operation, millis, tenant_id, self.config.alert_threshold_ms
            );
        } else if millis > u128::from(self.config.slow_query_threshold_ms) {
            stats.slow.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Slow hierarchy query: {} took {}ms for tenant {} (threshold {}ms)",
                operation, millis, tenant_id, self.config.slow_query_threshold_ms
            );
        }
    }

    pub fn record_cache_hit(&self, operation: &'static str, tenant_id: TenantId) {
        self.cache
            .entry((operation, tenant_id))
            .or_default()
            .hits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, operation: &'static str, tenant_id: TenantId) {
        self.cache
            .entry((operation, tenant_id))
            .or_default()
            .misses
            .fetch_add(1, Ordering::Relaxed);
        debug!("Manager cache miss in {} for tenant {}", operation, tenant_id);
    }

    /// Clear every counter and window
    pub fn reset(&self) {
        self.operations.clear();
        self.cache.clear();
    }

    /// Compute per-operation and per-tenant statistics and a health verdict
    pub fn summarize(&self) -> PerformanceSummary {
        let mut operations: Vec<OperationSummary> = self
            .operations
            .iter()
            .map(|entry| {
                let (operation, tenant_id) = *entry.key();
                Self::summarize_operation(operation, tenant_id, entry.value())
            })
            .collect();
        operations.sort_by(|a, b| (a.tenant_id, &a.operation).cmp(&(b.tenant_id, &b.operation)));

        let mut cache: Vec<CacheSummary> = self
            .cache
            .iter()
            .map(|entry| {
                let (operation, tenant_id) = *entry.key();
                let hits = entry.value().hits.load(Ordering::Relaxed);
                let misses = entry.value().misses.load(Ordering::Relaxed);
                let total = hits + misses;
                CacheSummary {
                    operation: operation.to_string(),
                    tenant_id,
                    hits,
                    misses,
                    hit_rate: (total > 0).then(|| hits as f64 / total as f64),
                }
            })
            .collect();
        cache.sort_by(|a, b| (a.tenant_id, &a.operation).cmp(&(b.tenant_id, &b.operation)));

        let (status, recommendations) = self.evaluate(&operations, &cache);

        PerformanceSummary {
            generated_at: Utc::now(),
            status,
            operations,
            cache,
            recommendations,
        }
    }

    /// Summarize and log at a severity matching the verdict
    pub fn report(&self) -> PerformanceSummary {
        let summary = self.summarize();
        let calls: u64 = summary.operations.iter().map(|o| o.count).sum();
        match summary.status {
            HealthStatus::Healthy => info!(
                "Hierarchy performance HEALTHY: {} operations tracked, {} calls",
                summary.operations.len(),
                calls
            ),
            HealthStatus::Warning => warn!(
                "Hierarchy performance WARNING: {}",
                summary.recommendations.join("; ")
            ),
            HealthStatus::Critical => error!(
                "Hierarchy performance CRITICAL: {}",
                summary.recommendations.join("; ")
            ),
        }
        summary
    }

    fn summarize_operation(operation: &str, tenant_id: TenantId, stats: &OperationStats) -> OperationSummary {
        let mut samples: Vec<u64> = match stats.recent.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => {
                debug!("Latency window for '{}' unavailable during summary", operation);
                Vec::new()
            }
        };
        samples.sort_unstable();

        let to_ms = |micros: u64| micros as f64 / 1000.0;
        let avg_ms = if samples.is_empty() {
            0.0
        } else {
            to_ms(samples.iter().sum::<u64>()) / samples.len() as f64
        };
        let p95_ms = if samples.is_empty() {
            0.0
        } else {
            let idx = ((samples.len() as f64 * 0.95).ceil() as usize).clamp(1, samples.len()) - 1;
            to_ms(samples[idx])
        };

        OperationSummary {
            operation: operation.to_string(),
            tenant_id,
            count: stats.count.load(Ordering::Relaxed),
            avg_ms,
            p95_ms,
            max_ms: samples.last().copied().map(to_ms).unwrap_or(0.0),
            slow_count: stats.slow.load(Ordering::Relaxed),
            alert_count: stats.alerts.load(Ordering::Relaxed),
        }
    }

    fn evaluate(&self, operations: &[OperationSummary], cache: &[CacheSummary]) -> (HealthStatus, Vec<String>) {
        let slow_ms = self.config.slow_query_threshold_ms as f64;
        let alert_ms = self.config.alert_threshold_ms as f64;
        let mut status = HealthStatus::Healthy;
        let mut recommendations = Vec::new();

        for op in operations {
            if op.avg_ms > alert_ms {
                status = status.max(HealthStatus::Critical);
                recommendations.push(format!(
                    "{} averages {:.1}ms for tenant {}, above the {}ms alert threshold; check closure table indexes and subtree size",
                    op.operation, op.avg_ms, op.tenant_id, self.config.alert_threshold_ms
                ));
            } else if op.avg_ms > slow_ms {
                status = status.max(HealthStatus::Warning);
                recommendations.push(format!(
                    "{} averages {:.1}ms for tenant {}, above the {}ms slow-query threshold",
                    op.operation, op.avg_ms, op.tenant_id, self.config.slow_query_threshold_ms
                ));
            }
        }

        for c in cache {
            let Some(rate) = c.hit_rate else { continue };
            if rate < self.config.cache_hit_rate_critical {
                status = status.max(HealthStatus::Critical);
                recommendations.push(format!(
                    "Manager cache hit rate for {} in tenant {} is {:.0}%; rebuild the tenant's manager cache",
                    c.operation,
                    c.tenant_id,
                    rate * 100.0
                ));
            } else if rate < self.config.cache_hit_rate_warning {
                status = status.max(HealthStatus::Warning);
                recommendations.push(format!(
                    "Manager cache hit rate for {} in tenant {} is {:.0}%; consider warming the cache after structural changes",
                    c.operation,
                    c.tenant_id,
                    rate * 100.0
                ));
            }
        }

        if recommendations.is_empty() {
            recommendations.push("All hierarchy operations are within thresholds".to_string());
        }
        (status, recommendations)
    }
}

/// Records elapsed time into its monitor when dropped
pub struct OperationTimer<'a> {
    monitor: &'a PerformanceMonitor,
    operation: &'static str,
    tenant_id: TenantId,
    started: Instant,
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        self.monitor.record(self.operation, self.tenant_id, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn monitor() -> PerformanceMonitor {
        let mut config = AppConfig::development().monitor;
        config.latency_window = 4;
        config.slow_query_threshold_ms = 100;
        config.alert_threshold_ms = 500;
        PerformanceMonitor::new(config)
    }

    #[test]
    fn empty_monitor_is_healthy() {
        let summary = monitor().summarize();
        assert_eq!(summary.status, HealthStatus::Healthy);
        assert!(summary.operations.is_empty());
        assert_eq!(summary.recommendations.len(), 1);
    }

    #[test]
    fn window_is_bounded() {
        let m = monitor();
        for ms in [1, 2, 3, 4, 5, 6] {
            m.record("find_ancestors", 1, Duration::from_millis(ms));
        }
        let summary = m.summarize();
        let op = &summary.operations[0];
        assert_eq!(op.count, 6);
        // Window keeps the last four samples: 3, 4, 5, 6
        assert!((op.avg_ms - 4.5).abs() < 1e-9);
        assert!((op.max_ms - 6.0).abs() < 1e-9);
        assert!((op.p95_ms - 6.0).abs() < 1e-9);
    }

    #[test]
    fn classifies_slow_and_alert_samples() {
        let m = monitor();
        m.record("move_node", 1, Duration::from_millis(150));
        m.record("move_node", 1, Duration::from_millis(900));
        m.record("move_node", 1, Duration::from_millis(10));
        let op = &m.summarize().operations[0];
        assert_eq!(op.slow_count, 1);
        assert_eq!(op.alert_count, 1);
    }

    #[test]
    fn slow_average_warns_and_alert_average_is_critical() {
        let m = monitor();
        m.record("find_descendants", 1, Duration::from_millis(200));
        assert_eq!(m.summarize().status, HealthStatus::Warning);

        m.record("move_node", 2, Duration::from_millis(2000));
        let summary = m.summarize();
        assert_eq!(summary.status, HealthStatus::Critical);
        assert_eq!(summary.recommendations.len(), 2);
    }

    #[test]
    fn cache_hit_rate_drives_status() {
        let m = monitor();
        for _ in 0..7 {
            m.record_cache_hit("managers_of", 3);
        }
        for _ in 0..3 {
            m.record_cache_miss("managers_of", 3);
        }
        let summary = m.summarize();
        assert_eq!(summary.cache[0].hit_rate, Some(0.7));
        assert_eq!(summary.status, HealthStatus::Warning);

        for _ in 0..10 {
            m.record_cache_miss("managers_of", 3);
        }
        assert_eq!(m.summarize().status, HealthStatus::Critical);
    }

    #[test]
    fn cache_counters_split_by_operation_and_tenant() {
        let m = monitor();
        m.record_cache_hit("managers_of", 1);
        m.record_cache_miss("snapshot", 1);
        m.record_cache_hit("managers_of", 2);

        let summary = m.summarize();
        let keyed: Vec<(TenantId, &str, u64, u64)> = summary
            .cache
            .iter()
            .map(|c| (c.tenant_id, c.operation.as_str(), c.hits, c.misses))
            .collect();
        assert_eq!(keyed, vec![(1, "managers_of", 1, 0), (1, "snapshot", 0, 1), (2, "managers_of", 1, 0)]);
        assert!(summary.recommendations.iter().any(|r| r.contains("snapshot in tenant 1")));
    }

    #[test]
    fn timer_records_on_drop_and_reset_clears() {
        let m = monitor();
        {
            let _timer = m.start("is_ancestor", 9);
        }
        assert_eq!(m.summarize().operations[0].count, 1);
        m.reset();
        assert!(m.summarize().operations.is_empty());
    }
}
