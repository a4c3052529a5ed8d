use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::ConsistencyConfig;
use crate::database::models::{
    CategorySummary, ClosureEdge, ConsistencyReport, ConsistencyViolation, OrgUnit, RepairReport, ViolationKind,
};
use crate::database::HierarchyStore;
use crate::error::HierarchyError;
use crate::services::closure::{expected_closure, EdgeKey};
use crate::types::{OrgId, Scope, TenantId};

/// Audits and repairs the closure table against parent pointers.
///
/// Checking never writes. Repair fixes one category per transaction, so a
/// failure leaves the earlier steps committed.
pub struct ConsistencyService {
    store: Arc<dyn HierarchyStore>,
    config: ConsistencyConfig,
}

impl ConsistencyService {
    pub fn new(store: Arc<dyn HierarchyStore>, config: ConsistencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Count violations per category with a capped sample of offending rows
    pub async fn check(&self, scope: Scope) -> Result<ConsistencyReport, HierarchyError> {
        let started = Instant::now();
        let mut tx = self.store.read().await?;
        let orgs = tx.orgs(scope).await?;
        let edges = tx.edges(scope).await?;
        drop(tx);

        let mut report = analyze(scope, &orgs, &edges, self.config.sample_limit);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Periodic audit. Logs the outcome and never repairs.
    pub async fn run_scheduled_check(&self, scope: Scope) -> Result<ConsistencyReport, HierarchyError> {
        let report = match self.check(scope).await {
            Ok(report) => report,
            Err(e) => {
                error!("Scheduled consistency check for {:?} failed: {}", scope, e);
                return Err(e);
            }
        };

        if report.is_consistent() {
            info!(
                "Hierarchy consistent for {:?}: {} nodes, {} edges, max depth {} ({}ms)",
                scope, report.total_nodes, report.total_edges, report.max_depth, report.elapsed_ms
            );
        } else {
            for category in report.failing_categories() {
                warn!(
                    "Hierarchy inconsistency in {:?}: {} {} violations",
                    scope, category.count, category.kind
                );
            }
        }
        Ok(report)
    }

    /// Audit every tenant separately
    pub async fn run_scheduled_check_all(&self) -> Result<Vec<ConsistencyReport>, HierarchyError> {
        let tenants = {
            let mut tx = self.store.read().await?;
            tx.tenant_ids().await?
        };

        let mut reports = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            reports.push(self.run_scheduled_check(Some(tenant_id)).await?);
        }
        Ok(reports)
    }

    /// Bring the closure table back in line with parent pointers.
    ///
    /// Running it twice in a row reports zero changes the second time.
    pub async fn repair(&self, scope: Scope) -> Result<RepairReport, HierarchyError> {
        let started = Instant::now();
        let mut report = RepairReport {
            scope,
            ..RepairReport::default()
        };

        // (a) Missing self-references
        report.self_references_inserted = self.insert_missing_self_references(scope).await?;

        // (b) Ancestor rows and cached levels
        let (added, removed, levels) = self.rebuild_ancestor_edges(scope).await?;
        report.ancestor_edges_added = added;
        report.ancestor_edges_removed = removed;
        report.levels_updated = levels;

        // (c) Rows pointing at removed nodes
        report.orphaned_edges_removed = self.remove_orphaned_edges(scope).await?;

        // (d) Depths that disagree with levels
        report.depths_corrected = self.correct_depths(scope).await?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.is_noop() {
            info!("Repair for {:?} found nothing to change", scope);
        } else {
            warn!(
                "Repaired hierarchy for {:?}: +{} self refs, +{}/-{} ancestor rows, {} levels, -{} orphans, {} depths",
                scope,
                report.self_references_inserted,
                report.ancestor_edges_added,
                report.ancestor_edges_removed,
                report.levels_updated,
                report.orphaned_edges_removed,
                report.depths_corrected
            );
        }
        Ok(report)
    }

    async fn insert_missing_self_references(&self, scope: Scope) -> Result<u64, HierarchyError> {
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(scope).await?;
        let orgs = tx.orgs(scope).await?;
        let edges = tx.edges(scope).await?;

        let present: HashMap<EdgeKey, i32> = edge_map(&edges);
        let missing: Vec<ClosureEdge> = orgs
            .iter()
            .filter(|o| o.is_live() && !present.contains_key(&(o.tenant_id, o.id, o.id)))
            .map(|o| ClosureEdge::self_reference(o.tenant_id, o.id))
            .collect();

        let inserted = tx.insert_edges(&missing).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Replace ancestor rows with those implied by parent pointers when the
    /// two sets differ, and refresh levels. Returns (added, removed, levels).
    async fn rebuild_ancestor_edges(&self, scope: Scope) -> Result<(u64, u64, u64), HierarchyError> {
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(scope).await?;
        let orgs = tx.orgs(scope).await?;
        let edges = tx.edges(scope).await?;
        let expected = expected_closure(&orgs);

        for (tenant_id, org_id) in &expected.cyclic {
            warn!(
                "Org {} in tenant {} sits on a parent-pointer cycle; its ancestor rows cannot be derived",
                org_id, tenant_id
            );
        }

        let actual: BTreeMap<EdgeKey, i32> = edges
            .iter()
            .filter(|e| e.ancestor_id != e.descendant_id)
            .map(|e| ((e.tenant_id, e.ancestor_id, e.descendant_id), e.depth))
            .collect();

        let mut added = 0;
        let mut removed = 0;
        if actual != expected.edges {
            added = expected
                .edges
                .iter()
                .filter(|&(k, d)| actual.get(k) != Some(d))
                .count() as u64;
            removed = actual
                .iter()
                .filter(|&(k, d)| expected.edges.get(k) != Some(d))
                .count() as u64;

            let mut pairs: BTreeMap<TenantId, Vec<(OrgId, OrgId)>> = BTreeMap::new();
            for &(tenant_id, ancestor_id, descendant_id) in actual.keys() {
                pairs.entry(tenant_id).or_default().push((ancestor_id, descendant_id));
            }
            for (tenant_id, pairs) in &pairs {
                tx.delete_edges(*tenant_id, pairs).await?;
            }
            tx.insert_edges(&expected.to_edges()).await?;
        }

        let mut levels = 0;
        for org in orgs.iter().filter(|o| o.is_live()) {
            let level = expected.level(org.tenant_id, org.id);
            if level.is_some() && org.level != level {
                let mut updated = org.clone();
                updated.level = level;
                tx.update_org(&updated).await?;
                levels += 1;
            }
        }

        tx.commit().await?;
        Ok((added, removed, levels))
    }

    async fn remove_orphaned_edges(&self, scope: Scope) -> Result<u64, HierarchyError> {
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(scope).await?;
        let orgs = tx.orgs(scope).await?;
        let edges = tx.edges(scope).await?;
        let live = live_set(&orgs);

        let mut orphans: BTreeMap<TenantId, Vec<(OrgId, OrgId)>> = BTreeMap::new();
        for e in edges.iter().filter(|e| !is_between_live(&live, e)) {
            orphans.entry(e.tenant_id).or_default().push(e.pair());
        }

        let mut removed = 0;
        for (tenant_id, pairs) in &orphans {
            removed += tx.delete_edges(*tenant_id, pairs).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn correct_depths(&self, scope: Scope) -> Result<u64, HierarchyError> {
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(scope).await?;
        let orgs = tx.orgs(scope).await?;
        let edges = tx.edges(scope).await?;
        let levels = level_map(&orgs);

        let mut corrected = 0;
        for e in &edges {
            let Some(expected) = expected_depth(&levels, e) else {
                continue;
            };
            if e.depth == expected {
                continue;
            }
            if expected < 0 {
                warn!(
                    "Row ({}, {}) in tenant {} would need negative depth {}; left for review",
                    e.ancestor_id, e.descendant_id, e.tenant_id, expected
                );
                continue;
            }
            tx.update_edge_depth(e, expected).await?;
            corrected += 1;
        }
        tx.commit().await?;
        Ok(corrected)
    }
}

fn edge_map(edges: &[ClosureEdge]) -> HashMap<EdgeKey, i32> {
    edges
        .iter()
        .map(|e| ((e.tenant_id, e.ancestor_id, e.descendant_id), e.depth))
        .collect()
}

fn live_set(orgs: &[OrgUnit]) -> HashMap<(TenantId, OrgId), &OrgUnit> {
    orgs.iter()
        .filter(|o| o.is_live())
        .map(|o| ((o.tenant_id, o.id), o))
        .collect()
}

fn is_between_live(live: &HashMap<(TenantId, OrgId), &OrgUnit>, e: &ClosureEdge) -> bool {
    live.contains_key(&(e.tenant_id, e.ancestor_id)) && live.contains_key(&(e.tenant_id, e.descendant_id))
}

/// Stored levels of live nodes
fn level_map(orgs: &[OrgUnit]) -> HashMap<(TenantId, OrgId), i32> {
    orgs.iter()
        .filter(|o| o.is_live())
        .filter_map(|o| o.level.map(|level| ((o.tenant_id, o.id), level)))
        .collect()
}

/// `level(descendant) - level(ancestor)` when both ends are live and levelled
fn expected_depth(levels: &HashMap<(TenantId, OrgId), i32>, e: &ClosureEdge) -> Option<i32> {
    let ancestor = levels.get(&(e.tenant_id, e.ancestor_id))?;
    let descendant = levels.get(&(e.tenant_id, e.descendant_id))?;
    Some(descendant - ancestor)
}

/// Pure audit over a scope's rows
pub fn analyze(scope: Scope, orgs: &[OrgUnit], edges: &[ClosureEdge], sample_limit: usize) -> ConsistencyReport {
    let live = live_set(orgs);
    let levels = level_map(orgs);
    let present = edge_map(edges);
    let expected = expected_closure(orgs);

    let mut categories: BTreeMap<ViolationKind, CategorySummary> = ViolationKind::ALL
        .iter()
        .map(|&kind| {
            (
                kind,
                CategorySummary {
                    kind,
                    count: 0,
                    samples: Vec::new(),
                },
            )
        })
        .collect();

    let mut report_violation = |violation: ConsistencyViolation| {
        if let Some(summary) = categories.get_mut(&violation.kind) {
            summary.count += 1;
            if summary.samples.len() < sample_limit {
                summary.samples.push(violation);
            }
        }
    };

    let mut live_orgs: Vec<&OrgUnit> = live.values().copied().collect();
    live_orgs.sort_by_key(|o| (o.tenant_id, o.id));
    for org in &live_orgs {
        if !present.contains_key(&(org.tenant_id, org.id, org.id)) {
            report_violation(ConsistencyViolation {
                kind: ViolationKind::MissingSelfReference,
                tenant_id: org.tenant_id,
                ancestor_id: org.id,
                descendant_id: org.id,
                depth: None,
                expected_depth: Some(0),
            });
        }
    }

    for (&(tenant_id, ancestor_id, descendant_id), &depth) in &expected.edges {
        if !present.contains_key(&(tenant_id, ancestor_id, descendant_id)) {
            report_violation(ConsistencyViolation {
                kind: ViolationKind::MissingAncestorEdge,
                tenant_id,
                ancestor_id,
                descendant_id,
                depth: None,
                expected_depth: Some(depth),
            });
        }
    }

    let mut sorted_edges = edges.to_vec();
    sorted_edges.sort();
    for e in &sorted_edges {
        let violation = |kind, expected_depth| ConsistencyViolation {
            kind,
            tenant_id: e.tenant_id,
            ancestor_id: e.ancestor_id,
            descendant_id: e.descendant_id,
            depth: Some(e.depth),
            expected_depth,
        };

        if !is_between_live(&live, e) {
            report_violation(violation(ViolationKind::OrphanedEdge, None));
            continue;
        }

        if let Some(expected_depth) = expected_depth(&levels, e) {
            if e.depth != expected_depth {
                report_violation(violation(ViolationKind::DepthMismatch, Some(expected_depth)));
            }
        }

        let key = (e.tenant_id, e.ancestor_id, e.descendant_id);
        if e.ancestor_id != e.descendant_id && !expected.edges.contains_key(&key) {
            report_violation(violation(ViolationKind::StaleEdge, None));
        }
    }

    ConsistencyReport {
        scope,
        checked_at: Utc::now(),
        elapsed_ms: 0,
        categories: categories.into_values().collect(),
        total_nodes: live.len() as u64,
        total_edges: edges.len() as u64,
        root_count: live_orgs
            .iter()
            .filter(|o| o.parent_id.map_or(true, |p| !live.contains_key(&(o.tenant_id, p))))
            .count() as u64,
        max_depth: edges.iter().map(|e| e.depth).max().unwrap_or(0),
    }
}
