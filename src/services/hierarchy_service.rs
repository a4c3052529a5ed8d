use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::models::{ClosureEdge, NewOrgUnit, OrgUnit};
use crate::database::{HierarchyStore, StoreTx};
use crate::error::HierarchyError;
use crate::services::performance_monitor::{OperationTimer, PerformanceMonitor};
use crate::types::{legacy_child_ancestors, OrgId, TenantId, LEGACY_ROOT_ANCESTORS};

/// Where a node lands when linked under a parent
struct Placement {
    edges: Vec<ClosureEdge>,
    level: i32,
    ancestors: String,
}

/// Closure-table hierarchy engine.
///
/// Reads are answered from the closure table alone. Every structural write
/// runs in one store transaction and keeps the self-reference, transitivity
/// and depth rules intact on commit.
pub struct HierarchyService {
    store: Arc<dyn HierarchyStore>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl HierarchyService {
    pub fn new(store: Arc<dyn HierarchyStore>) -> Self {
        Self { store, monitor: None }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn timer(&self, operation: &'static str, tenant_id: TenantId) -> Option<OperationTimer<'_>> {
        self.monitor.as_deref().map(|m| m.start(operation, tenant_id))
    }

    // ----- reads -----

    /// Org row if it exists and is not soft-deleted
    pub async fn get_org(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Option<OrgUnit>, HierarchyError> {
        let mut tx = self.store.read().await?;
        Ok(tx.org(tenant_id, org_id).await?.filter(OrgUnit::is_live))
    }

    /// Strict ancestors, nearest first. Unknown ids yield an empty list.
    pub async fn find_ancestors(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Vec<OrgUnit>, HierarchyError> {
        let _timer = self.timer("find_ancestors", tenant_id);
        let mut tx = self.store.read().await?;
        let rows = tx.ancestors(tenant_id, org_id).await?;
        Ok(rows.into_iter().map(|(org, _)| org).collect())
    }

    /// Strict descendants, nearest first. Unknown ids yield an empty list.
    pub async fn find_descendants(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Vec<OrgUnit>, HierarchyError> {
        let _timer = self.timer("find_descendants", tenant_id);
        let mut tx = self.store.read().await?;
        let rows = tx.descendants(tenant_id, org_id).await?;
        Ok(rows.into_iter().map(|(org, _)| org).collect())
    }

    pub async fn find_direct_children(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Vec<OrgUnit>, HierarchyError> {
        let _timer = self.timer("find_direct_children", tenant_id);
        let mut tx = self.store.read().await?;
        let rows = tx.descendants(tenant_id, org_id).await?;
        Ok(rows
            .into_iter()
            .filter(|(_, depth)| *depth == 1)
            .map(|(org, _)| org)
            .collect())
    }

    /// `None` for roots and unknown ids
    pub async fn find_direct_parent(&self, org_id: OrgId, tenant_id: TenantId) -> Result<Option<OrgUnit>, HierarchyError> {
        let _timer = self.timer("find_direct_parent", tenant_id);
        let mut tx = self.store.read().await?;
        let rows = tx.ancestors(tenant_id, org_id).await?;
        Ok(rows.into_iter().find(|(_, depth)| *depth == 1).map(|(org, _)| org))
    }

    /// Strict: a node is not its own ancestor
    pub async fn is_ancestor(
        &self,
        candidate_ancestor: OrgId,
        org_id: OrgId,
        tenant_id: TenantId,
    ) -> Result<bool, HierarchyError> {
        let _timer = self.timer("is_ancestor", tenant_id);
        if candidate_ancestor == org_id {
            return Ok(false);
        }
        let mut tx = self.store.read().await?;
        let edge = tx.edge(tenant_id, candidate_ancestor, org_id).await?;
        Ok(edge.is_some_and(|e| e.depth > 0))
    }

    /// Distance from the node's root, 0 for roots
    pub async fn depth_of(&self, org_id: OrgId, tenant_id: TenantId) -> Result<i32, HierarchyError> {
        let _timer = self.timer("depth_of", tenant_id);
        let mut tx = self.store.read().await?;
        let edges = tx.ancestor_edges(tenant_id, org_id).await?;
        if !edges.iter().any(ClosureEdge::is_self_reference) {
            return Err(HierarchyError::NodeNotFound { tenant_id, org_id });
        }
        Ok(edges.iter().map(|e| e.depth).max().unwrap_or(0))
    }

    // ----- writes -----

    /// Insert an org row and link it into the hierarchy in one transaction
    pub async fn create_org(&self, new_org: NewOrgUnit) -> Result<OrgUnit, HierarchyError> {
        let tenant_id = new_org.tenant_id;
        let _timer = self.timer("create_org", tenant_id);
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(Some(tenant_id)).await?;

        if tx.org(tenant_id, new_org.id).await?.is_some() {
            return Err(HierarchyError::DuplicateNode { tenant_id, org_id: new_org.id });
        }

        let placement = Self::place_under(&mut *tx, tenant_id, new_org.id, new_org.parent_id).await?;
        let org = OrgUnit {
            id: new_org.id,
            tenant_id,
            parent_id: new_org.parent_id,
            name: new_org.name,
            status: new_org.status,
            deleted: false,
            level: Some(placement.level),
            ancestors: Some(placement.ancestors),
        };

        tx.insert_org(&org).await?;
        tx.insert_edges(&placement.edges).await?;
        tx.commit().await?;

        info!(
            "Created org {} under {:?} in tenant {} at level {}",
            org.id, org.parent_id, tenant_id, placement.level
        );
        Ok(org)
    }

    /// Link an existing org row that has no closure rows yet.
    ///
    /// Writes the self-reference plus one row per ancestor of the parent.
    pub async fn add_node(
        &self,
        org_id: OrgId,
        parent_id: Option<OrgId>,
        tenant_id: TenantId,
    ) -> Result<(), HierarchyError> {
        let _timer = self.timer("add_node", tenant_id);
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(Some(tenant_id)).await?;

        let mut org = Self::live_org(&mut *tx, tenant_id, org_id).await?;
        if tx.edge(tenant_id, org_id, org_id).await?.is_some() {
            return Err(HierarchyError::DuplicateNode { tenant_id, org_id });
        }

        let placement = Self::place_under(&mut *tx, tenant_id, org_id, parent_id).await?;
        tx.insert_edges(&placement.edges).await?;

        org.parent_id = parent_id;
        org.level = Some(placement.level);
        org.ancestors = Some(placement.ancestors);
        tx.update_org(&org).await?;
        tx.commit().await?;

        info!(
            "Added org {} under {:?} in tenant {} ({} closure rows)",
            org_id,
            parent_id,
            tenant_id,
            placement.edges.len()
        );
        Ok(())
    }

    /// Unlink and soft-delete a node.
    ///
    /// Without `cascade` a node with live children is rejected. With it the
    /// whole subtree goes, deepest first. Returns the removed ids in removal
    /// order.
    pub async fn remove_node(
        &self,
        org_id: OrgId,
        tenant_id: TenantId,
        cascade: bool,
    ) -> Result<Vec<OrgId>, HierarchyError> {
        let _timer = self.timer("remove_node", tenant_id);
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(Some(tenant_id)).await?;

        let org = Self::live_org(&mut *tx, tenant_id, org_id).await?;
        let children = tx.children_by_parent(tenant_id, org_id).await?;
        if !children.is_empty() && !cascade {
            return Err(HierarchyError::HasChildren {
                tenant_id,
                org_id,
                children: children.iter().map(|c| c.id).collect(),
            });
        }

        let mut doomed = if cascade {
            Self::subtree_members(&mut *tx, tenant_id, org_id).await?
        } else {
            Vec::new()
        };
        // Deepest first, the node itself last
        doomed.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut removed = Vec::with_capacity(doomed.len() + 1);
        for (id, _) in doomed {
            if let Some(mut member) = tx.org(tenant_id, id).await?.filter(OrgUnit::is_live) {
                tx.delete_edges_touching(tenant_id, id).await?;
                member.deleted = true;
                tx.update_org(&member).await?;
                removed.push(id);
            }
        }

        let edges_removed = tx.delete_edges_touching(tenant_id, org_id).await?;
        let mut org = org;
        org.deleted = true;
        tx.update_org(&org).await?;
        removed.push(org_id);

        tx.commit().await?;

        info!(
            "Removed org {} from tenant {} ({} nodes, cascade: {})",
            org_id,
            tenant_id,
            removed.len(),
            cascade
        );
        debug!("Org {} dropped {} own closure rows", org_id, edges_removed);
        Ok(removed)
    }

    /// Re-parent a node together with its subtree.
    ///
    /// Rows linking the subtree to its old ancestors are replaced by the
    /// product of the new parent's ancestors and the subtree. Internal
    /// subtree rows stay untouched.
    pub async fn move_node(
        &self,
        org_id: OrgId,
        new_parent_id: Option<OrgId>,
        tenant_id: TenantId,
    ) -> Result<(), HierarchyError> {
        let _timer = self.timer("move_node", tenant_id);
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(Some(tenant_id)).await?;

        let mut org = Self::live_org(&mut *tx, tenant_id, org_id).await?;

        let mut parent = None;
        if let Some(parent_id) = new_parent_id {
            if parent_id == org_id {
                return Err(HierarchyError::CyclicMove { tenant_id, org_id, new_parent_id: parent_id });
            }
            let invalid = HierarchyError::InvalidParent { tenant_id, org_id, parent_id };
            let Some(row) = tx.org(tenant_id, parent_id).await?.filter(OrgUnit::is_live) else {
                return Err(invalid);
            };
            let edges = tx.ancestor_edges(tenant_id, parent_id).await?;
            if !edges.iter().any(ClosureEdge::is_self_reference) {
                // Parent row exists but was never linked
                return Err(invalid);
            }
            if edges.iter().any(|e| e.ancestor_id == org_id) {
                return Err(HierarchyError::CyclicMove { tenant_id, org_id, new_parent_id: parent_id });
            }
            parent = Some((row, edges));
        }

        if org.parent_id == new_parent_id {
            debug!("Org {} already under {:?} in tenant {}", org_id, new_parent_id, tenant_id);
            return Ok(());
        }

        // (a) Subtree of the moving node, self included
        let subtree: Vec<(OrgId, i32)> = tx
            .descendant_edges(tenant_id, org_id)
            .await?
            .into_iter()
            .map(|e| (e.descendant_id, e.depth))
            .collect();

        // (b) Drop rows linking the subtree to the old ancestors
        let old_ancestors: Vec<OrgId> = tx
            .ancestor_edges(tenant_id, org_id)
            .await?
            .into_iter()
            .filter(|e| e.depth > 0)
            .map(|e| e.ancestor_id)
            .collect();
        let stale: Vec<(OrgId, OrgId)> = old_ancestors
            .iter()
            .flat_map(|&a| subtree.iter().map(move |&(d, _)| (a, d)))
            .collect();
        let removed = tx.delete_edges(tenant_id, &stale).await?;

        // (c) Link the subtree under the new parent's ancestors, parent included
        let parent_edges: &[ClosureEdge] = parent.as_ref().map(|(_, edges)| edges.as_slice()).unwrap_or_default();
        let linked: Vec<ClosureEdge> = parent_edges
            .iter()
            .flat_map(|pe| {
                subtree
                    .iter()
                    .map(move |&(d, depth)| ClosureEdge::new(tenant_id, pe.ancestor_id, d, pe.depth + 1 + depth))
            })
            .collect();
        let added = tx.insert_edges(&linked).await?;

        // (d) Refresh cached levels and legacy ancestor strings
        let (base_level, base_ancestors) = match &parent {
            Some((row, edges)) => {
                let parent_level = edges.iter().map(|e| e.depth).max().unwrap_or(0);
                let parent_ancestors = row.ancestors.as_deref().unwrap_or(LEGACY_ROOT_ANCESTORS);
                (parent_level + 1, legacy_child_ancestors(parent_ancestors, row.id))
            }
            None => (0, LEGACY_ROOT_ANCESTORS.to_string()),
        };

        org.parent_id = new_parent_id;
        let touched = Self::relabel_subtree(&mut *tx, tenant_id, org, &subtree, base_level, base_ancestors).await?;

        tx.commit().await?;

        info!(
            "Moved org {} under {:?} in tenant {} ({} subtree nodes, -{} +{} closure rows)",
            org_id, new_parent_id, tenant_id, touched, removed, added
        );
        Ok(())
    }

    // ----- helpers -----

    async fn live_org(tx: &mut dyn StoreTx, tenant_id: TenantId, org_id: OrgId) -> Result<OrgUnit, HierarchyError> {
        tx.org(tenant_id, org_id)
            .await?
            .filter(OrgUnit::is_live)
            .ok_or(HierarchyError::NodeNotFound { tenant_id, org_id })
    }

    /// Closure rows, level and legacy string for `org_id` under `parent_id`
    async fn place_under(
        tx: &mut dyn StoreTx,
        tenant_id: TenantId,
        org_id: OrgId,
        parent_id: Option<OrgId>,
    ) -> Result<Placement, HierarchyError> {
        let Some(parent_id) = parent_id else {
            return Ok(Placement {
                edges: vec![ClosureEdge::self_reference(tenant_id, org_id)],
                level: 0,
                ancestors: LEGACY_ROOT_ANCESTORS.to_string(),
            });
        };

        let invalid = HierarchyError::InvalidParent { tenant_id, org_id, parent_id };
        if parent_id == org_id {
            return Err(invalid);
        }
        let Some(parent) = tx.org(tenant_id, parent_id).await?.filter(OrgUnit::is_live) else {
            return Err(invalid);
        };

        let parent_edges = tx.ancestor_edges(tenant_id, parent_id).await?;
        if !parent_edges.iter().any(ClosureEdge::is_self_reference) {
            // Parent row exists but was never linked
            return Err(invalid);
        }

        let mut edges = Vec::with_capacity(parent_edges.len() + 1);
        edges.push(ClosureEdge::self_reference(tenant_id, org_id));
        edges.extend(
            parent_edges
                .iter()
                .map(|pe| ClosureEdge::new(tenant_id, pe.ancestor_id, org_id, pe.depth + 1)),
        );

        let parent_level = parent_edges.iter().map(|e| e.depth).max().unwrap_or(0);
        let parent_ancestors = parent.ancestors.as_deref().unwrap_or(LEGACY_ROOT_ANCESTORS);

        Ok(Placement {
            edges,
            level: parent_level + 1,
            ancestors: legacy_child_ancestors(parent_ancestors, parent_id),
        })
    }

    /// Strict subtree members with their distance from `org_id`, found
    /// through both the closure table and parent pointers
    async fn subtree_members(
        tx: &mut dyn StoreTx,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgId, i32)>, HierarchyError> {
        let mut members: BTreeMap<OrgId, i32> = tx
            .descendants(tenant_id, org_id)
            .await?
            .into_iter()
            .map(|(org, depth)| (org.id, depth))
            .collect();

        let mut visited = HashSet::from([org_id]);
        let mut frontier = vec![(org_id, 0)];
        while let Some((parent_id, depth)) = frontier.pop() {
            for child in tx.children_by_parent(tenant_id, parent_id).await? {
                if visited.insert(child.id) {
                    let entry = members.entry(child.id).or_insert(depth + 1);
                    *entry = (*entry).max(depth + 1);
                    frontier.push((child.id, depth + 1));
                }
            }
        }

        Ok(members.into_iter().collect())
    }

    /// Rewrite level and legacy ancestors for a moved subtree, parents
    /// before children. Returns the number of rows written.
    async fn relabel_subtree(
        tx: &mut dyn StoreTx,
        tenant_id: TenantId,
        root: OrgUnit,
        subtree: &[(OrgId, i32)],
        base_level: i32,
        base_ancestors: String,
    ) -> Result<usize, HierarchyError> {
        let root_id = root.id;
        let mut rows: HashMap<OrgId, (OrgUnit, i32)> = HashMap::with_capacity(subtree.len());
        rows.insert(root_id, (root, 0));
        for &(id, depth) in subtree.iter().filter(|(id, _)| *id != root_id) {
            if let Some(org) = tx.org(tenant_id, id).await? {
                rows.insert(id, (org, depth));
            }
        }

        let mut children: HashMap<OrgId, Vec<OrgId>> = HashMap::new();
        for (id, (org, _)) in &rows {
            if *id == root_id {
                continue;
            }
            if let Some(parent_id) = org.parent_id {
                children.entry(parent_id).or_default().push(*id);
            }
        }

        let mut written = 0;
        let mut stack = vec![(root_id, base_ancestors)];
        let mut labelled = HashSet::new();
        while let Some((id, ancestors)) = stack.pop() {
            if !labelled.insert(id) {
                continue;
            }
            let Some((mut org, depth)) = rows.remove(&id) else {
                continue;
            };
            for child in children.get(&id).into_iter().flatten() {
                stack.push((*child, legacy_child_ancestors(&ancestors, id)));
            }
            org.level = Some(base_level + depth);
            org.ancestors = Some(ancestors);
            tx.update_org(&org).await?;
            written += 1;
        }

        // Members linked by closure rows but not by parent pointers
        for (_, (mut org, depth)) in rows {
            org.level = Some(base_level + depth);
            tx.update_org(&org).await?;
            written += 1;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ViolationKind;
    use crate::testing::{fixture_tree, A, B, C, R, TENANT};

    fn ids(orgs: &[OrgUnit]) -> Vec<OrgId> {
        orgs.iter().map(|o| o.id).collect()
    }

    #[tokio::test]
    async fn ancestors_are_nearest_first() {
        let fx = fixture_tree().await;
        let ancestors = fx.hierarchy.find_ancestors(C, TENANT).await.unwrap();
        assert_eq!(ids(&ancestors), vec![B, R]);
        assert_eq!(fx.hierarchy.depth_of(C, TENANT).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_ids_read_as_empty() {
        let fx = fixture_tree().await;
        assert!(fx.hierarchy.find_ancestors(999, TENANT).await.unwrap().is_empty());
        assert!(fx.hierarchy.find_direct_parent(999, TENANT).await.unwrap().is_none());
        assert!(matches!(
            fx.hierarchy.depth_of(999, TENANT).await,
            Err(HierarchyError::NodeNotFound { org_id: 999, .. })
        ));
    }

    #[tokio::test]
    async fn is_ancestor_is_strict() {
        let fx = fixture_tree().await;
        assert!(fx.hierarchy.is_ancestor(R, C, TENANT).await.unwrap());
        assert!(!fx.hierarchy.is_ancestor(C, R, TENANT).await.unwrap());
        assert!(!fx.hierarchy.is_ancestor(A, A, TENANT).await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_missing_parents() {
        let fx = fixture_tree().await;
        let dup = fx.hierarchy.create_org(NewOrgUnit::new(TENANT, A, Some(R), "again")).await;
        assert!(matches!(dup, Err(HierarchyError::DuplicateNode { .. })));

        let orphan = fx.hierarchy.create_org(NewOrgUnit::new(TENANT, 500, Some(404), "lost")).await;
        assert!(matches!(orphan, Err(HierarchyError::InvalidParent { parent_id: 404, .. })));
        assert!(fx.hierarchy.get_org(500, TENANT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_refreshes_levels_and_legacy_strings() {
        let fx = fixture_tree().await;
        fx.hierarchy.move_node(B, Some(A), TENANT).await.unwrap();

        let c = fx.hierarchy.get_org(C, TENANT).await.unwrap().unwrap();
        assert_eq!(c.level, Some(3));
        assert_eq!(c.ancestors.as_deref(), Some(format!("0,{},{},{}", R, A, B).as_str()));
        assert_eq!(ids(&fx.hierarchy.find_ancestors(C, TENANT).await.unwrap()), vec![B, A, R]);
    }

    #[tokio::test]
    async fn move_under_own_descendant_is_cyclic() {
        let fx = fixture_tree().await;
        let result = fx.hierarchy.move_node(B, Some(C), TENANT).await;
        assert!(matches!(result, Err(HierarchyError::CyclicMove { new_parent_id, .. }) if new_parent_id == C));
    }

    #[tokio::test]
    async fn move_under_unlinked_parent_is_rejected() {
        let fx = fixture_tree().await;
        let mut tx = fx.store.begin().await.unwrap();
        let mut stray = tx.org(TENANT, A).await.unwrap().unwrap();
        stray.id = 900;
        stray.parent_id = None;
        tx.insert_org(&stray).await.unwrap();
        tx.commit().await.unwrap();

        let result = fx.hierarchy.move_node(B, Some(900), TENANT).await;
        assert!(matches!(result, Err(HierarchyError::InvalidParent { parent_id: 900, .. })));

        let b = fx.hierarchy.get_org(B, TENANT).await.unwrap().unwrap();
        assert_eq!((b.parent_id, b.level), (Some(R), Some(1)));
        assert_eq!(ids(&fx.hierarchy.find_ancestors(C, TENANT).await.unwrap()), vec![B, R]);
        let report = fx.consistency.check(Some(TENANT)).await.unwrap();
        assert_eq!(report.count(ViolationKind::MissingSelfReference), 1);
    }
}
