use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::database::manager::{DatabaseError, DatabaseManager};
use crate::database::models::{
    ClosureEdge, ManagerAssignment, ManagerCacheEntry, MigrationRun, OrgUnit,
};
use crate::database::store::{HierarchyStore, StoreTx};
use crate::types::{parse_legacy_ancestors, OrgId, Scope, TenantId, UserId};

#[derive(Debug, Clone, Default)]
struct State {
    orgs: BTreeMap<(TenantId, OrgId), OrgUnit>,
    edges: BTreeMap<(TenantId, OrgId, OrgId), i32>,
    assignments: BTreeSet<ManagerAssignment>,
    manager_cache: BTreeMap<(TenantId, OrgId), Vec<ManagerCacheEntry>>,
    // Append-only data sits behind its own Arc so a closure write does not copy it
    backups: Arc<BTreeMap<String, Arc<Vec<OrgUnit>>>>,
    migration_runs: Arc<Vec<MigrationRun>>,
}

impl State {
    fn tenant_edges(&self, tenant_id: TenantId) -> impl Iterator<Item = ClosureEdge> + '_ {
        self.edges
            .range((tenant_id, OrgId::MIN, OrgId::MIN)..=(tenant_id, OrgId::MAX, OrgId::MAX))
            .map(|(&(t, a, d), &depth)| ClosureEdge::new(t, a, d, depth))
    }

    fn tenant_orgs(&self, tenant_id: TenantId) -> impl Iterator<Item = &OrgUnit> + '_ {
        self.orgs
            .range((tenant_id, OrgId::MIN)..=(tenant_id, OrgId::MAX))
            .map(|(_, org)| org)
    }

    fn live_org(&self, tenant_id: TenantId, org_id: OrgId) -> Option<&OrgUnit> {
        self.orgs.get(&(tenant_id, org_id)).filter(|o| o.is_live())
    }
}

fn in_scope(scope: Scope, tenant_id: TenantId) -> bool {
    scope.map_or(true, |t| t == tenant_id)
}

/// In-process store with copy-on-write snapshots.
///
/// Writers are serialized by an async mutex and publish their working copy
/// on commit. Readers hold the snapshot that was current when they began.
#[derive(Clone, Default)]
pub struct MemoryStore {
    published: Arc<RwLock<Arc<State>>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<State> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rows captured in a backup table, if it exists
    pub fn backup_rows(&self, table: &str) -> Option<Vec<OrgUnit>> {
        self.snapshot().backups.get(table).map(|rows| rows.to_vec())
    }
}

#[async_trait]
impl HierarchyStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let guard = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            state: self.snapshot(),
            writer: Some(guard),
            published: self.published.clone(),
        }))
    }

    async fn read(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        Ok(Box::new(MemoryTx {
            state: self.snapshot(),
            writer: None,
            published: self.published.clone(),
        }))
    }
}

struct MemoryTx {
    state: Arc<State>,
    writer: Option<OwnedMutexGuard<()>>,
    published: Arc<RwLock<Arc<State>>>,
}

impl MemoryTx {
    fn state_mut(&mut self) -> Result<&mut State, DatabaseError> {
        if self.writer.is_none() {
            return Err(DatabaseError::ReadOnly);
        }
        Ok(Arc::make_mut(&mut self.state))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn org(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Option<OrgUnit>, DatabaseError> {
        Ok(self.state.orgs.get(&(tenant_id, org_id)).cloned())
    }

    async fn orgs(&mut self, scope: Scope) -> Result<Vec<OrgUnit>, DatabaseError> {
        Ok(self
            .state
            .orgs
            .values()
            .filter(|o| in_scope(scope, o.tenant_id))
            .cloned()
            .collect())
    }

    async fn children_by_parent(
        &mut self,
        tenant_id: TenantId,
        parent_id: OrgId,
    ) -> Result<Vec<OrgUnit>, DatabaseError> {
        Ok(self
            .state
            .tenant_orgs(tenant_id)
            .filter(|o| o.is_live() && o.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn tenant_ids(&mut self) -> Result<Vec<TenantId>, DatabaseError> {
        let ids: BTreeSet<TenantId> = self.state.orgs.keys().map(|&(t, _)| t).collect();
        Ok(ids.into_iter().collect())
    }

    async fn insert_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError> {
        let state = self.state_mut()?;
        let key = (org.tenant_id, org.id);
        if state.orgs.contains_key(&key) {
            return Err(DatabaseError::AlreadyExists(format!(
                "org {} in tenant {}",
                org.id, org.tenant_id
            )));
        }
        state.orgs.insert(key, org.clone());
        Ok(())
    }

    async fn update_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError> {
        let state = self.state_mut()?;
        match state.orgs.get_mut(&(org.tenant_id, org.id)) {
            Some(existing) => {
                *existing = org.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!(
                "org {} in tenant {}",
                org.id, org.tenant_id
            ))),
        }
    }

    async fn ancestors(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError> {
        let state = &self.state;
        let mut found: Vec<(OrgUnit, i32)> = state
            .tenant_edges(tenant_id)
            .filter(|e| e.descendant_id == org_id && e.depth > 0)
            .filter_map(|e| state.live_org(tenant_id, e.ancestor_id).map(|o| (o.clone(), e.depth)))
            .collect();
        found.sort_by_key(|(o, depth)| (*depth, o.id));
        Ok(found)
    }

    async fn descendants(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError> {
        let state = &self.state;
        let mut found: Vec<(OrgUnit, i32)> = state
            .tenant_edges(tenant_id)
            .filter(|e| e.ancestor_id == org_id && e.depth > 0)
            .filter_map(|e| state.live_org(tenant_id, e.descendant_id).map(|o| (o.clone(), e.depth)))
            .collect();
        found.sort_by_key(|(o, depth)| (*depth, o.id));
        Ok(found)
    }

    async fn edge(
        &mut self,
        tenant_id: TenantId,
        ancestor_id: OrgId,
        descendant_id: OrgId,
    ) -> Result<Option<ClosureEdge>, DatabaseError> {
        Ok(self
            .state
            .edges
            .get(&(tenant_id, ancestor_id, descendant_id))
            .map(|&depth| ClosureEdge::new(tenant_id, ancestor_id, descendant_id, depth)))
    }

    async fn ancestor_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError> {
        Ok(self
            .state
            .tenant_edges(tenant_id)
            .filter(|e| e.descendant_id == org_id)
            .collect())
    }

    async fn descendant_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError> {
        Ok(self
            .state
            .edges
            .range((tenant_id, org_id, OrgId::MIN)..=(tenant_id, org_id, OrgId::MAX))
            .map(|(&(t, a, d), &depth)| ClosureEdge::new(t, a, d, depth))
            .collect())
    }

    async fn edges(&mut self, scope: Scope) -> Result<Vec<ClosureEdge>, DatabaseError> {
        Ok(self
            .state
            .edges
            .iter()
            .filter(|(&(t, _, _), _)| in_scope(scope, t))
            .map(|(&(t, a, d), &depth)| ClosureEdge::new(t, a, d, depth))
            .collect())
    }

    async fn insert_edges(&mut self, edges: &[ClosureEdge]) -> Result<u64, DatabaseError> {
        let state = self.state_mut()?;
        let mut batch = BTreeSet::new();
        for e in edges {
            let key = (e.tenant_id, e.ancestor_id, e.descendant_id);
            if state.edges.contains_key(&key) || !batch.insert(key) {
                return Err(DatabaseError::AlreadyExists(format!(
                    "closure edge ({}, {}) in tenant {}",
                    e.ancestor_id, e.descendant_id, e.tenant_id
                )));
            }
        }
        for e in edges {
            state.edges.insert((e.tenant_id, e.ancestor_id, e.descendant_id), e.depth);
        }
        Ok(edges.len() as u64)
    }

    async fn delete_edges(&mut self, tenant_id: TenantId, pairs: &[(OrgId, OrgId)]) -> Result<u64, DatabaseError> {
        let state = self.state_mut()?;
        let removed = pairs
            .iter()
            .filter(|&&(a, d)| state.edges.remove(&(tenant_id, a, d)).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn delete_edges_touching(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<u64, DatabaseError> {
        let state = self.state_mut()?;
        let before = state.edges.len();
        state
            .edges
            .retain(|&(t, a, d), _| !(t == tenant_id && (a == org_id || d == org_id)));
        Ok((before - state.edges.len()) as u64)
    }

    async fn clear_edges(&mut self, scope: Scope) -> Result<u64, DatabaseError> {
        let state = self.state_mut()?;
        let before = state.edges.len();
        state.edges.retain(|&(t, _, _), _| !in_scope(scope, t));
        Ok((before - state.edges.len()) as u64)
    }

    async fn update_edge_depth(&mut self, edge: &ClosureEdge, depth: i32) -> Result<(), DatabaseError> {
        let state = self.state_mut()?;
        match state.edges.get_mut(&(edge.tenant_id, edge.ancestor_id, edge.descendant_id)) {
            Some(stored) => {
                *stored = depth;
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!(
                "closure edge ({}, {}) in tenant {}",
                edge.ancestor_id, edge.descendant_id, edge.tenant_id
            ))),
        }
    }

    async fn legacy_descendant_ids(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<OrgId>, DatabaseError> {
        Ok(self
            .state
            .tenant_orgs(tenant_id)
            .filter(|o| o.is_live() && o.id != org_id)
            .filter(|o| {
                o.ancestors
                    .as_deref()
                    .map(|a| parse_legacy_ancestors(a).contains(&org_id))
                    .unwrap_or(false)
            })
            .map(|o| o.id)
            .collect())
    }

    async fn assign_manager(&mut self, assignment: &ManagerAssignment) -> Result<(), DatabaseError> {
        self.state_mut()?.assignments.insert(*assignment);
        Ok(())
    }

    async fn unassign_manager(&mut self, assignment: &ManagerAssignment) -> Result<bool, DatabaseError> {
        Ok(self.state_mut()?.assignments.remove(assignment))
    }

    async fn manager_assignments(
        &mut self,
        tenant_id: TenantId,
        org_ids: &[OrgId],
    ) -> Result<Vec<ManagerAssignment>, DatabaseError> {
        let wanted: BTreeSet<OrgId> = org_ids.iter().copied().collect();
        Ok(self
            .state
            .assignments
            .iter()
            .filter(|a| a.tenant_id == tenant_id && wanted.contains(&a.org_id))
            .copied()
            .collect())
    }

    async fn replace_manager_cache(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
        entries: &[ManagerCacheEntry],
    ) -> Result<(), DatabaseError> {
        let state = self.state_mut()?;
        if entries.is_empty() {
            state.manager_cache.remove(&(tenant_id, org_id));
        } else {
            state.manager_cache.insert((tenant_id, org_id), entries.to_vec());
        }
        Ok(())
    }

    async fn manager_cache(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ManagerCacheEntry>, DatabaseError> {
        Ok(self
            .state
            .manager_cache
            .get(&(tenant_id, org_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn orgs_managed_by(&mut self, tenant_id: TenantId, user_id: UserId) -> Result<Vec<OrgId>, DatabaseError> {
        let orgs: BTreeSet<OrgId> = self
            .state
            .manager_cache
            .range((tenant_id, OrgId::MIN)..=(tenant_id, OrgId::MAX))
            .filter(|(_, entries)| entries.iter().any(|e| e.manager_user_id == user_id))
            .map(|(&(_, org_id), _)| org_id)
            .collect();
        Ok(orgs.into_iter().collect())
    }

    async fn backup_orgs(&mut self, table: &str, scope: Scope) -> Result<u64, DatabaseError> {
        if !DatabaseManager::is_valid_table_name(table) {
            return Err(DatabaseError::InvalidTableName(table.to_string()));
        }
        let state = self.state_mut()?;
        if state.backups.contains_key(table) {
            return Err(DatabaseError::AlreadyExists(format!("table {}", table)));
        }
        let rows: Vec<OrgUnit> = state
            .orgs
            .values()
            .filter(|o| in_scope(scope, o.tenant_id))
            .cloned()
            .collect();
        let count = rows.len() as u64;
        Arc::make_mut(&mut state.backups).insert(table.to_string(), Arc::new(rows));
        Ok(count)
    }

    async fn append_migration_run(&mut self, run: &MigrationRun) -> Result<(), DatabaseError> {
        let state = self.state_mut()?;
        Arc::make_mut(&mut state.migration_runs).push(run.clone());
        Ok(())
    }

    async fn migration_runs(&mut self, scope: Scope) -> Result<Vec<MigrationRun>, DatabaseError> {
        Ok(self
            .state
            .migration_runs
            .iter()
            .filter(|r| scope.is_none() || r.tenant_id == scope)
            .cloned()
            .collect())
    }

    async fn lock_hierarchy(&mut self, _scope: Scope) -> Result<(), DatabaseError> {
        // The writer mutex already serializes every write transaction
        self.state_mut().map(|_| ())
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let MemoryTx { state, writer, published } = *self;
        if writer.is_some() {
            *published.write().unwrap_or_else(PoisonError::into_inner) = state;
        }
        // Guard drops here, after publishing
        drop(writer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrgStatus;

    fn org(tenant_id: TenantId, id: OrgId, parent_id: Option<OrgId>) -> OrgUnit {
        OrgUnit {
            id,
            tenant_id,
            parent_id,
            name: format!("org-{}", id),
            status: OrgStatus::Active,
            deleted: false,
            level: Some(0),
            ancestors: Some("0".to_string()),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_org(&org(1, 10, None)).await.unwrap();
            // dropped without commit
        }
        let mut read = store.read().await.unwrap();
        assert!(read.org(1, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot() {
        let store = MemoryStore::new();
        let mut before = store.read().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_org(&org(1, 10, None)).await.unwrap();
        tx.commit().await.unwrap();

        assert!(before.org(1, 10).await.unwrap().is_none());
        let mut after = store.read().await.unwrap();
        assert!(after.org(1, 10).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_transactions_reject_writes() {
        let store = MemoryStore::new();
        let mut read = store.read().await.unwrap();
        let err = read.insert_org(&org(1, 10, None)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::ReadOnly));
    }

    #[tokio::test]
    async fn duplicate_edges_reject_whole_batch() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_edges(&[ClosureEdge::self_reference(1, 10)]).await.unwrap();
        let err = tx
            .insert_edges(&[ClosureEdge::self_reference(1, 11), ClosureEdge::self_reference(1, 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyExists(_)));
        assert!(tx.edge(1, 11, 11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_scoping_isolates_rows() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_org(&org(1, 10, None)).await.unwrap();
        tx.insert_org(&org(2, 10, None)).await.unwrap();
        tx.insert_edges(&[ClosureEdge::self_reference(1, 10), ClosureEdge::self_reference(2, 10)])
            .await
            .unwrap();
        assert_eq!(tx.clear_edges(Some(1)).await.unwrap(), 1);
        assert!(tx.edge(2, 10, 10).await.unwrap().is_some());
        assert_eq!(tx.tenant_ids().await.unwrap(), vec![1, 2]);
        assert_eq!(tx.orgs(Some(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backups_refuse_existing_or_invalid_names() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_org(&org(1, 10, None)).await.unwrap();
        assert_eq!(tx.backup_orgs("backup_a", None).await.unwrap(), 1);
        assert!(matches!(
            tx.backup_orgs("backup_a", None).await.unwrap_err(),
            DatabaseError::AlreadyExists(_)
        ));
        assert!(matches!(
            tx.backup_orgs("Backup-B", None).await.unwrap_err(),
            DatabaseError::InvalidTableName(_)
        ));
        tx.commit().await.unwrap();
        assert_eq!(store.backup_rows("backup_a").map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn closure_writes_share_backups_and_run_log() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_org(&org(1, 10, None)).await.unwrap();
        tx.backup_orgs("backup_a", None).await.unwrap();
        tx.commit().await.unwrap();
        let before = store.snapshot();

        let mut tx = store.begin().await.unwrap();
        tx.lock_hierarchy(Some(1)).await.unwrap();
        tx.insert_edges(&[ClosureEdge::self_reference(1, 10)]).await.unwrap();
        tx.commit().await.unwrap();
        let after = store.snapshot();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&before.backups, &after.backups));
        assert!(Arc::ptr_eq(&before.migration_runs, &after.migration_runs));
        assert_eq!(store.backup_rows("backup_a").map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn read_transactions_cannot_take_the_write_lock() {
        let store = MemoryStore::new();
        let mut read = store.read().await.unwrap();
        assert!(matches!(read.lock_hierarchy(None).await.unwrap_err(), DatabaseError::ReadOnly));
    }
}
