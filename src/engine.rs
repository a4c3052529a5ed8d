use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::database::models::{NewOrgUnit, OrgUnit};
use crate::database::HierarchyStore;
use crate::error::HierarchyError;
use crate::services::{
    ConsistencyService, HierarchyService, ManagerCache, MigrationService, PerformanceMonitor,
};
use crate::types::{OrgId, TenantId};

/// Every hierarchy component wired to one store and one monitor.
///
/// Structural writes that change who sits above an org go through here so
/// the manager cache follows the hierarchy.
pub struct OrgEngine {
    pub store: Arc<dyn HierarchyStore>,
    pub monitor: Arc<PerformanceMonitor>,
    pub hierarchy: Arc<HierarchyService>,
    pub managers: Arc<ManagerCache>,
    pub consistency: Arc<ConsistencyService>,
    pub migration: Arc<MigrationService>,
}

impl OrgEngine {
    pub fn new(store: Arc<dyn HierarchyStore>, config: &AppConfig) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let hierarchy = Arc::new(HierarchyService::new(Arc::clone(&store)).with_monitor(Arc::clone(&monitor)));
        let managers = Arc::new(
            ManagerCache::new(Arc::clone(&store), Arc::clone(&hierarchy)).with_monitor(Arc::clone(&monitor)),
        );
        let consistency = Arc::new(ConsistencyService::new(Arc::clone(&store), config.consistency.clone()));
        let migration = Arc::new(MigrationService::new(
            Arc::clone(&store),
            Arc::clone(&consistency),
            config.migration.clone(),
        ));

        info!("Hierarchy engine ready ({:?})", config.environment);
        Self {
            store,
            monitor,
            hierarchy,
            managers,
            consistency,
            migration,
        }
    }

    pub async fn create_org(&self, new_org: NewOrgUnit) -> Result<OrgUnit, HierarchyError> {
        self.hierarchy
            .create_org(new_org)
            .await
            .inspect_err(|e| log_failure("create_org", e))
    }

    /// Move a subtree and rebuild its manager cache rows
    pub async fn move_node(
        &self,
        org_id: OrgId,
        new_parent_id: Option<OrgId>,
        tenant_id: TenantId,
    ) -> Result<(), HierarchyError> {
        self.hierarchy
            .move_node(org_id, new_parent_id, tenant_id)
            .await
            .inspect_err(|e| log_failure("move_node", e))?;
        self.managers.rebuild(Some(org_id), tenant_id).await?;
        Ok(())
    }

    /// Remove a node (or its subtree) and evict its manager cache rows
    pub async fn remove_node(
        &self,
        org_id: OrgId,
        tenant_id: TenantId,
        cascade: bool,
    ) -> Result<Vec<OrgId>, HierarchyError> {
        let removed = self
            .hierarchy
            .remove_node(org_id, tenant_id, cascade)
            .await
            .inspect_err(|e| log_failure("remove_node", e))?;
        self.managers.evict(tenant_id, &removed).await?;
        Ok(removed)
    }
}

fn log_failure(operation: &str, err: &HierarchyError) {
    if err.is_caller_error() {
        warn!("{} rejected: {}", operation, err.to_json());
    } else {
        error!("{} failed: {}", operation, err.to_json());
    }
}
