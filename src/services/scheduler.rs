use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::database::models::ConsistencyReport;
use crate::error::HierarchyError;
use crate::services::consistency_service::ConsistencyService;
use crate::services::performance_monitor::{PerformanceMonitor, PerformanceSummary};

/// Periodic background jobs: the consistency audit and the performance
/// summary. Both stop when `shutdown` flips to true or its sender drops.
pub struct Scheduler;

impl Scheduler {
    pub fn spawn(
        config: &AppConfig,
        consistency: Arc<ConsistencyService>,
        monitor: Arc<PerformanceMonitor>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if config.consistency.scheduled_check_enabled {
            let period = Duration::from_secs(config.consistency.check_interval_secs.max(1));
            handles.push(spawn_job("consistency_check", period, shutdown.clone(), move || {
                let consistency = Arc::clone(&consistency);
                async move {
                    if let Err(e) = consistency_tick(&consistency).await {
                        warn!("Consistency job failed: {}", e);
                    }
                }
            }));
        } else {
            info!("Scheduled consistency check disabled");
        }

        let period = Duration::from_secs(config.monitor.summary_interval_secs.max(1));
        handles.push(spawn_job("performance_summary", period, shutdown, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                summary_tick(&monitor);
            }
        }));

        handles
    }
}

/// One consistency audit across every tenant
pub async fn consistency_tick(consistency: &ConsistencyService) -> Result<Vec<ConsistencyReport>, HierarchyError> {
    let reports = consistency.run_scheduled_check_all().await?;
    let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
    info!(
        "Consistency check covered {} tenants, {} inconsistent",
        reports.len(),
        inconsistent
    );
    Ok(reports)
}

/// One performance summary, logged at the verdict's severity
pub fn summary_tick(monitor: &PerformanceMonitor) -> PerformanceSummary {
    monitor.report()
}

fn spawn_job<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full period instead
        ticker.tick().await;
        info!("Scheduled job '{}' every {:?}", name, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled job '{}'", name);
                    job().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduled job '{}' stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_tree, TENANT};

    #[tokio::test]
    async fn consistency_tick_covers_each_tenant() {
        let fx = fixture_tree().await;
        let reports = consistency_tick(&fx.consistency).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].scope, Some(TENANT));
        assert!(reports[0].is_consistent());
    }

    #[tokio::test]
    async fn jobs_stop_on_shutdown() {
        let fx = fixture_tree().await;
        let (tx, rx) = watch::channel(false);
        let handles = Scheduler::spawn(&fx.config, Arc::clone(&fx.consistency), Arc::clone(&fx.monitor), rx);
        assert_eq!(handles.len(), 2);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
    }
}
