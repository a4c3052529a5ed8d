use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::database::models::{ManagerAssignment, ManagerCacheEntry, ManagerRole, OrgUnit};
use crate::database::HierarchyStore;
use crate::error::HierarchyError;
use crate::services::hierarchy_service::HierarchyService;
use crate::services::performance_monitor::{OperationTimer, PerformanceMonitor};
use crate::types::{OrgId, TenantId, UserId};

/// Published manager rows of one org. Readers hold an `Arc` to a whole
/// snapshot, so a concurrent rebuild never shows them a partial set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub direct: Vec<UserId>,
    /// Nearest ancestor's managers first
    pub escalation: Vec<UserId>,
}

impl ManagerSnapshot {
    pub fn users(&self, role: ManagerRole) -> &[UserId] {
        match role {
            ManagerRole::Direct => &self.direct,
            ManagerRole::Escalation => &self.escalation,
        }
    }

    fn from_entries(entries: &[ManagerCacheEntry]) -> Self {
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| (e.role_type, e.rank, e.manager_user_id));
        let pick = |role: ManagerRole| -> Vec<UserId> {
            sorted
                .iter()
                .filter(|e| e.role_type == role)
                .map(|e| e.manager_user_id)
                .collect()
        };
        Self {
            direct: pick(ManagerRole::Direct),
            escalation: pick(ManagerRole::Escalation),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildStats {
    pub orgs_rebuilt: u64,
    pub entries_written: u64,
}

/// Derived cache of direct and escalation managers per org.
///
/// Assignments are the source of truth. Cache rows and in-process
/// snapshots are rebuilt from them and can be dropped at any time.
pub struct ManagerCache {
    store: Arc<dyn HierarchyStore>,
    hierarchy: Arc<HierarchyService>,
    monitor: Option<Arc<PerformanceMonitor>>,
    snapshots: DashMap<(TenantId, OrgId), Arc<ManagerSnapshot>>,
    // Serializes rebuilds so the latest committed state is published last
    rebuild_lock: Mutex<()>,
}

impl ManagerCache {
    pub fn new(store: Arc<dyn HierarchyStore>, hierarchy: Arc<HierarchyService>) -> Self {
        Self {
            store,
            hierarchy,
            monitor: None,
            snapshots: DashMap::new(),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn timer(&self, operation: &'static str, tenant_id: TenantId) -> Option<OperationTimer<'_>> {
        self.monitor.as_deref().map(|m| m.start(operation, tenant_id))
    }

    /// Managers of `org_id` in `role`, ordered by rank.
    ///
    /// Served from the published snapshot, see [`ManagerCache::snapshot`].
    pub async fn managers_of(
        &self,
        org_id: OrgId,
        tenant_id: TenantId,
        role: ManagerRole,
    ) -> Result<Vec<UserId>, HierarchyError> {
        let _timer = self.timer("managers_of", tenant_id);
        Ok(self.lookup("managers_of", org_id, tenant_id).await?.users(role).to_vec())
    }

    /// Full snapshot of one org. A miss loads persisted rows, or rebuilds
    /// the org when there are none.
    pub async fn snapshot(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Arc<ManagerSnapshot>, HierarchyError> {
        self.lookup("snapshot", org_id, tenant_id).await
    }

    /// Cache lookup with hits and misses counted against `operation`
    async fn lookup(
        &self,
        operation: &'static str,
        org_id: OrgId,
        tenant_id: TenantId,
    ) -> Result<Arc<ManagerSnapshot>, HierarchyError> {
        let cached = self.snapshots.get(&(tenant_id, org_id)).map(|s| Arc::clone(s.value()));
        if let Some(snapshot) = cached {
            if let Some(monitor) = &self.monitor {
                monitor.record_cache_hit(operation, tenant_id);
            }
            return Ok(snapshot);
        }

        if let Some(monitor) = &self.monitor {
            monitor.record_cache_miss(operation, tenant_id);
        }
        let _guard = self.rebuild_lock.lock().await;

        // Another caller may have published while we waited
        if let Some(snapshot) = self.snapshots.get(&(tenant_id, org_id)).map(|s| Arc::clone(s.value())) {
            return Ok(snapshot);
        }

        if self.hierarchy.get_org(org_id, tenant_id).await?.is_none() {
            return Ok(Arc::new(ManagerSnapshot::default()));
        }

        // Rows persisted by an earlier rebuild, e.g. before a restart
        let persisted = {
            let mut tx = self.store.read().await?;
            tx.manager_cache(tenant_id, org_id).await?
        };
        if !persisted.is_empty() {
            let snapshot = Arc::new(ManagerSnapshot::from_entries(&persisted));
            self.snapshots.insert((tenant_id, org_id), Arc::clone(&snapshot));
            return Ok(snapshot);
        }

        let (snapshot, _) = self.rebuild_org(org_id, tenant_id).await?;
        Ok(snapshot)
    }

    /// Orgs where `user_id` appears in any role, ascending
    pub async fn orgs_managed_by(&self, user_id: UserId, tenant_id: TenantId) -> Result<Vec<OrgId>, HierarchyError> {
        let _timer = self.timer("orgs_managed_by", tenant_id);
        let mut tx = self.store.read().await?;
        Ok(tx.orgs_managed_by(tenant_id, user_id).await?)
    }

    /// Rebuild `org_id` and its whole subtree, or every live org of the
    /// tenant when `org_id` is `None`. Each org is rebuilt in its own
    /// transaction.
    pub async fn rebuild(&self, org_id: Option<OrgId>, tenant_id: TenantId) -> Result<RebuildStats, HierarchyError> {
        let _timer = self.timer("rebuild_manager_cache", tenant_id);
        let _guard = self.rebuild_lock.lock().await;

        let targets: Vec<OrgId> = match org_id {
            Some(org_id) => {
                if self.hierarchy.get_org(org_id, tenant_id).await?.is_none() {
                    return Err(HierarchyError::NodeNotFound { tenant_id, org_id });
                }
                let mut targets = vec![org_id];
                targets.extend(
                    self.hierarchy
                        .find_descendants(org_id, tenant_id)
                        .await?
                        .iter()
                        .map(|o| o.id),
                );
                targets
            }
            None => {
                let mut tx = self.store.read().await?;
                tx.orgs(Some(tenant_id))
                    .await?
                    .into_iter()
                    .filter(OrgUnit::is_live)
                    .map(|o| o.id)
                    .collect()
            }
        };

        let mut stats = RebuildStats::default();
        for target in targets {
            let (_, written) = self.rebuild_org(target, tenant_id).await?;
            stats.orgs_rebuilt += 1;
            stats.entries_written += written;
        }

        info!(
            "Rebuilt manager cache for {} orgs in tenant {} ({} rows)",
            stats.orgs_rebuilt, tenant_id, stats.entries_written
        );
        Ok(stats)
    }

    /// Drop in-process snapshots; the next read reloads them
    pub fn invalidate(&self, tenant_id: TenantId, org_ids: &[OrgId]) {
        for org_id in org_ids {
            self.snapshots.remove(&(tenant_id, *org_id));
        }
        debug!("Invalidated {} manager snapshots in tenant {}", org_ids.len(), tenant_id);
    }

    /// Delete cache rows and snapshots of orgs that left the hierarchy
    pub async fn evict(&self, tenant_id: TenantId, org_ids: &[OrgId]) -> Result<(), HierarchyError> {
        let _guard = self.rebuild_lock.lock().await;
        let mut tx = self.store.begin().await?;
        for org_id in org_ids {
            tx.replace_manager_cache(tenant_id, *org_id, &[]).await?;
        }
        tx.commit().await?;
        self.invalidate(tenant_id, org_ids);
        Ok(())
    }

    /// Record that `user_id` directly manages `org_id`. Takes effect in the
    /// cache on the next rebuild.
    pub async fn assign_manager(&self, org_id: OrgId, user_id: UserId, tenant_id: TenantId) -> Result<(), HierarchyError> {
        let mut tx = self.store.begin().await?;
        if tx.org(tenant_id, org_id).await?.filter(OrgUnit::is_live).is_none() {
            return Err(HierarchyError::NodeNotFound { tenant_id, org_id });
        }
        tx.assign_manager(&ManagerAssignment { tenant_id, org_id, user_id }).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Returns false when no such assignment existed
    pub async fn unassign_manager(&self, org_id: OrgId, user_id: UserId, tenant_id: TenantId) -> Result<bool, HierarchyError> {
        let mut tx = self.store.begin().await?;
        let removed = tx.unassign_manager(&ManagerAssignment { tenant_id, org_id, user_id }).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Replace the direct managers of `org_id` atomically
    pub async fn set_managers(&self, org_id: OrgId, user_ids: &[UserId], tenant_id: TenantId) -> Result<(), HierarchyError> {
        let mut tx = self.store.begin().await?;
        if tx.org(tenant_id, org_id).await?.filter(OrgUnit::is_live).is_none() {
            return Err(HierarchyError::NodeNotFound { tenant_id, org_id });
        }

        let wanted: BTreeSet<UserId> = user_ids.iter().copied().collect();
        let current = tx.manager_assignments(tenant_id, &[org_id]).await?;
        for assignment in current.iter().filter(|a| !wanted.contains(&a.user_id)) {
            tx.unassign_manager(assignment).await?;
        }
        let existing: HashSet<UserId> = current.iter().map(|a| a.user_id).collect();
        for user_id in wanted.iter().filter(|u| !existing.contains(u)) {
            tx.assign_manager(&ManagerAssignment { tenant_id, org_id, user_id: *user_id }).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recompute one org's rows, persist them and publish the snapshot.
    /// Callers hold `rebuild_lock`.
    async fn rebuild_org(&self, org_id: OrgId, tenant_id: TenantId) -> Result<(Arc<ManagerSnapshot>, u64), HierarchyError> {
        let ancestors = self.hierarchy.find_ancestors(org_id, tenant_id).await?;

        let mut chain = Vec::with_capacity(ancestors.len() + 1);
        chain.push(org_id);
        chain.extend(ancestors.iter().map(|o| o.id));

        let mut tx = self.store.begin().await?;
        let assignments = tx.manager_assignments(tenant_id, &chain).await?;
        let entries = Self::compute_entries(tenant_id, org_id, &chain, &assignments);
        tx.replace_manager_cache(tenant_id, org_id, &entries).await?;
        tx.commit().await?;

        let snapshot = Arc::new(ManagerSnapshot::from_entries(&entries));
        self.snapshots.insert((tenant_id, org_id), Arc::clone(&snapshot));
        debug!(
            "Manager cache for org {} in tenant {}: {} direct, {} escalation",
            org_id,
            tenant_id,
            snapshot.direct.len(),
            snapshot.escalation.len()
        );
        Ok((snapshot, entries.len() as u64))
    }

    /// `chain` is the org followed by its ancestors, nearest first.
    ///
    /// Direct managers get rank 0. Escalation ranks run 1.. along the
    /// chain, ties broken by user id, and each user appears once at their
    /// nearest position.
    fn compute_entries(
        tenant_id: TenantId,
        org_id: OrgId,
        chain: &[OrgId],
        assignments: &[ManagerAssignment],
    ) -> Vec<ManagerCacheEntry> {
        let managers_at = |org: OrgId| -> BTreeSet<UserId> {
            assignments
                .iter()
                .filter(|a| a.org_id == org)
                .map(|a| a.user_id)
                .collect()
        };

        let entry = |user_id, role_type, rank| ManagerCacheEntry {
            tenant_id,
            org_id,
            manager_user_id: user_id,
            role_type,
            rank,
        };

        let direct = managers_at(org_id);
        let mut entries: Vec<ManagerCacheEntry> = direct
            .iter()
            .map(|&user_id| entry(user_id, ManagerRole::Direct, 0))
            .collect();

        let mut seen: HashSet<UserId> = direct.into_iter().collect();
        let mut rank = 0;
        for &ancestor_id in chain.iter().skip(1) {
            for user_id in managers_at(ancestor_id) {
                if seen.insert(user_id) {
                    rank += 1;
                    entries.push(entry(user_id, ManagerRole::Escalation, rank));
                }
            }
        }
        entries
    }
}
