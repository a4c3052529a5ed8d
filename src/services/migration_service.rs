use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::database::models::{
    CleanStats, ClosureEdge, MigrationPhase, MigrationRun, OrgUnit, PerformanceComparison,
};
use crate::database::HierarchyStore;
use crate::error::HierarchyError;
use crate::services::closure;
use crate::services::consistency_service::ConsistencyService;
use crate::types::{legacy_child_ancestors, OrgId, Scope, TenantId, LEGACY_ROOT_ANCESTORS};

/// Rows per insert statement while building the closure table
const EDGE_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// `None` migrates every tenant
    pub tenant_id: Scope,
    /// Shadow table name; generated from the configured prefix when absent
    pub backup_table: Option<String>,
    /// Whether the rollback script empties the closure table
    pub truncate_closure_on_rollback: Option<bool>,
}

impl MigrationOptions {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_backup_table(mut self, table: impl Into<String>) -> Self {
        self.backup_table = Some(table.into());
        self
    }
}

/// Cleaned rows ready for the closure build
struct CleanPlan {
    /// Live nodes after cleaning, parents before children
    nodes: Vec<OrgUnit>,
    /// Rows whose parent, level or legacy string changed
    updates: Vec<OrgUnit>,
    stats: CleanStats,
}

/// One-shot conversion of parent-pointer data into the closure table.
///
/// Backup and validation failures abort with an error. Anything later is
/// recorded on the returned run, which is marked failed.
pub struct MigrationService {
    store: Arc<dyn HierarchyStore>,
    consistency: Arc<ConsistencyService>,
    config: MigrationConfig,
}

impl MigrationService {
    pub fn new(store: Arc<dyn HierarchyStore>, consistency: Arc<ConsistencyService>, config: MigrationConfig) -> Self {
        Self {
            store,
            consistency,
            config,
        }
    }

    /// Default shadow table name, `<prefix>_<yyyymmdd_hhmmss>`
    pub fn default_backup_table(&self) -> String {
        format!("{}_{}", self.config.backup_table_prefix, Utc::now().format("%Y%m%d_%H%M%S"))
    }

    pub async fn migrate(&self, options: MigrationOptions) -> Result<MigrationRun, HierarchyError> {
        let scope = options.tenant_id;
        let table = options
            .backup_table
            .clone()
            .unwrap_or_else(|| self.default_backup_table());
        let truncate = options
            .truncate_closure_on_rollback
            .unwrap_or(self.config.truncate_closure_on_rollback);

        let mut run = MigrationRun::start(scope, &table);
        info!("Migration {} starting for {:?} (backup table {})", run.id, scope, table);

        // Backup
        let started = Instant::now();
        match self.backup(&table, scope).await {
            Ok(rows) => {
                run.backup_rows = rows;
                run.record_phase(MigrationPhase::Backup, true, elapsed_ms(started), Some(format!("{} rows", rows)));
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail_phase(&mut run, MigrationPhase::Backup, started, &reason).await;
                return Err(HierarchyError::BackupFailed { table, reason });
            }
        }

        // ValidateAndClean
        let started = Instant::now();
        let plan = match self.validate_and_clean(scope).await {
            Ok(plan) => {
                run.clean = plan.stats.clone();
                run.record_phase(
                    MigrationPhase::ValidateAndClean,
                    true,
                    elapsed_ms(started),
                    Some(format!("{} nodes, {} fixes", plan.nodes.len(), plan.stats.total())),
                );
                plan
            }
            Err(reason) => {
                self.fail_phase(&mut run, MigrationPhase::ValidateAndClean, started, &reason).await;
                return Err(HierarchyError::MigrationPhaseFailed {
                    phase: MigrationPhase::ValidateAndClean,
                    reason,
                });
            }
        };

        // BuildClosure
        let started = Instant::now();
        let built = match self.build_closure(scope, &plan).await {
            Ok((edges_created, digest)) => {
                run.nodes_processed = plan.nodes.len() as u64;
                run.edges_created = edges_created;
                run.closure_digest = Some(digest);
                run.record_phase(
                    MigrationPhase::BuildClosure,
                    true,
                    elapsed_ms(started),
                    Some(format!("{} edges", edges_created)),
                );
                true
            }
            Err(e) => {
                self.fail_phase(&mut run, MigrationPhase::BuildClosure, started, &e.to_string()).await;
                false
            }
        };

        if built {
            // VerifyConsistency
            let started = Instant::now();
            match self.consistency.check(scope).await {
                Ok(report) => {
                    let detail = format!("{} violations", report.total_violations());
                    if !report.is_consistent() {
                        warn!("Migration {} left {} consistency violations", run.id, report.total_violations());
                    }
                    run.consistency = Some(report);
                    run.record_phase(MigrationPhase::VerifyConsistency, true, elapsed_ms(started), Some(detail));
                }
                Err(e) => {
                    self.fail_phase(&mut run, MigrationPhase::VerifyConsistency, started, &e.to_string()).await;
                }
            }

            // PerformanceCompare is diagnostic only
            let started = Instant::now();
            match self.compare_performance(scope).await {
                Ok(comparison) => {
                    let detail = match &comparison {
                        Some(c) => format!(
                            "legacy {}us, closure {}us, match: {}",
                            c.legacy_micros, c.closure_micros, c.results_match
                        ),
                        None => "no nodes to sample".to_string(),
                    };
                    run.performance = comparison;
                    run.record_phase(MigrationPhase::PerformanceCompare, true, elapsed_ms(started), Some(detail));
                }
                Err(e) => {
                    warn!("Migration {} skipped performance comparison: {}", run.id, e);
                    run.record_phase(MigrationPhase::PerformanceCompare, false, elapsed_ms(started), Some(e.to_string()));
                }
            }
        }

        // GenerateRollback
        let started = Instant::now();
        run.rollback_script = Some(rollback_script(&run, truncate));
        run.record_phase(MigrationPhase::GenerateRollback, true, elapsed_ms(started), None);

        run.finish();
        self.log_run(&run).await;

        if run.succeeded() {
            info!(
                "Migration {} finished: {} nodes, {} edges in {}ms",
                run.id, run.nodes_processed, run.edges_created, run.duration_ms
            );
        } else {
            error!("Migration {} failed at {:?}: {:?}", run.id, run.failed_phase, run.error);
        }
        Ok(run)
    }

    /// Migration runs recorded for `scope`, oldest first
    pub async fn history(&self, scope: Scope) -> Result<Vec<MigrationRun>, HierarchyError> {
        let mut tx = self.store.read().await?;
        Ok(tx.migration_runs(scope).await?)
    }

    /// Record a failed phase. Phases before the closure build also close
    /// and log the run, since the caller gets an error instead of the run.
    async fn fail_phase(&self, run: &mut MigrationRun, phase: MigrationPhase, started: Instant, reason: &str) {
        run.record_phase(phase, false, elapsed_ms(started), Some(reason.to_string()));
        run.fail(phase, reason);
        if phase.aborts_run() {
            error!("Migration {} aborted in {}: {}", run.id, phase, reason);
            run.finish();
            self.log_run(run).await;
        } else {
            warn!("Migration {} failed in {}: {}", run.id, phase, reason);
        }
    }

    async fn log_run(&self, run: &MigrationRun) {
        let result = async {
            let mut tx = self.store.begin().await?;
            tx.append_migration_run(run).await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to record migration run {}: {}", run.id, e);
        }
    }

    async fn backup(&self, table: &str, scope: Scope) -> Result<u64, HierarchyError> {
        let mut tx = self.store.begin().await?;
        let rows = tx.backup_orgs(table, scope).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Clear sentinel and dangling parents, recompute levels and legacy
    /// strings. Fails on parent-pointer cycles.
    async fn validate_and_clean(&self, scope: Scope) -> Result<CleanPlan, String> {
        let orgs = async {
            let mut tx = self.store.read().await?;
            tx.orgs(scope).await
        }
        .await
        .map_err(|e| e.to_string())?;

        clean(orgs)
    }

    /// Replace the scope's closure rows in one transaction, parents before
    /// children. Returns the edge count and digest.
    async fn build_closure(&self, scope: Scope, plan: &CleanPlan) -> Result<(u64, String), HierarchyError> {
        let mut tx = self.store.begin().await?;
        tx.lock_hierarchy(scope).await?;

        for org in &plan.updates {
            tx.update_org(org).await?;
        }
        let cleared = tx.clear_edges(scope).await?;
        debug!("Cleared {} existing closure rows for {:?}", cleared, scope);

        let mut built: HashMap<(TenantId, OrgId), Vec<(OrgId, i32)>> = HashMap::with_capacity(plan.nodes.len());
        let mut edges: Vec<ClosureEdge> = Vec::new();

        for node in &plan.nodes {
            let mut chain = vec![(node.id, 0)];
            if let Some(parent_id) = node.parent_id {
                let parent_chain = built.get(&(node.tenant_id, parent_id)).ok_or_else(|| HierarchyError::MigrationPhaseFailed {
                    phase: MigrationPhase::BuildClosure,
                    reason: format!("parent {} of org {} was not built first", parent_id, node.id),
                })?;
                chain.extend(parent_chain.iter().map(|&(a, d)| (a, d + 1)));
            }
            edges.extend(chain.iter().map(|&(a, d)| ClosureEdge::new(node.tenant_id, a, node.id, d)));
            built.insert((node.tenant_id, node.id), chain);
        }

        edges.sort();
        let mut inserted = 0;
        for batch in edges.chunks(EDGE_BATCH_SIZE) {
            inserted += tx.insert_edges(batch).await?;
        }
        let digest = closure::digest(&edges);

        tx.commit().await?;
        Ok((inserted, digest))
    }

    /// Time a legacy LIKE lookup against the closure join on the first root
    async fn compare_performance(&self, scope: Scope) -> Result<Option<PerformanceComparison>, HierarchyError> {
        let mut tx = self.store.read().await?;
        let orgs = tx.orgs(scope).await?;
        let Some(root) = orgs.iter().find(|o| o.is_live() && o.is_root()) else {
            return Ok(None);
        };

        let started = Instant::now();
        let legacy: BTreeSet<OrgId> = tx
            .legacy_descendant_ids(root.tenant_id, root.id)
            .await?
            .into_iter()
            .collect();
        let legacy_micros = started.elapsed().as_micros() as u64;

        let started = Instant::now();
        let closure: BTreeSet<OrgId> = tx
            .descendants(root.tenant_id, root.id)
            .await?
            .into_iter()
            .map(|(o, _)| o.id)
            .collect();
        let closure_micros = started.elapsed().as_micros() as u64;

        Ok(Some(PerformanceComparison {
            tenant_id: root.tenant_id,
            org_id: root.id,
            legacy_micros,
            closure_micros,
            legacy_count: legacy.len() as u64,
            closure_count: closure.len() as u64,
            results_match: legacy == closure,
        }))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Pure cleaning pass over every org row in scope
fn clean(orgs: Vec<OrgUnit>) -> Result<CleanPlan, String> {
    let live_ids: HashSet<(TenantId, OrgId)> = orgs
        .iter()
        .filter(|o| o.is_live())
        .map(|o| (o.tenant_id, o.id))
        .collect();

    let mut stats = CleanStats::default();
    let mut nodes: HashMap<(TenantId, OrgId), OrgUnit> = HashMap::with_capacity(live_ids.len());
    let mut changed: HashSet<(TenantId, OrgId)> = HashSet::new();

    for mut org in orgs.into_iter().filter(OrgUnit::is_live) {
        let key = (org.tenant_id, org.id);
        match org.parent_id {
            Some(0) => {
                org.parent_id = None;
                stats.sentinel_parents_cleared += 1;
                changed.insert(key);
            }
            Some(parent_id) if !live_ids.contains(&(org.tenant_id, parent_id)) => {
                org.parent_id = None;
                stats.dangling_parents_promoted += 1;
                changed.insert(key);
            }
            _ => {}
        }
        nodes.insert(key, org);
    }

    // Order parents before children, detecting cycles on the way
    let mut children: HashMap<(TenantId, OrgId), Vec<OrgId>> = HashMap::new();
    let mut roots: Vec<(TenantId, OrgId)> = Vec::new();
    for (key, org) in &nodes {
        match org.parent_id {
            Some(parent_id) => children.entry((key.0, parent_id)).or_default().push(key.1),
            None => roots.push(*key),
        }
    }
    roots.sort();
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut ordered: Vec<OrgUnit> = Vec::with_capacity(nodes.len());
    let mut frontier: Vec<((TenantId, OrgId), i32, String)> = roots
        .into_iter()
        .map(|key| (key, 0, LEGACY_ROOT_ANCESTORS.to_string()))
        .collect();
    let mut depth = 0;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (key, level, ancestors) in frontier {
            let Some(mut org) = nodes.remove(&key) else {
                continue;
            };

            if org.level != Some(level) {
                if level == 0 {
                    stats.roots_normalized += 1;
                } else {
                    stats.levels_recomputed += 1;
                }
                org.level = Some(level);
                changed.insert(key);
            }
            if org.ancestors.as_deref() != Some(ancestors.as_str()) {
                if level == 0 {
                    if !changed.contains(&key) {
                        stats.roots_normalized += 1;
                    }
                } else {
                    stats.ancestors_rewritten += 1;
                }
                org.ancestors = Some(ancestors.clone());
                changed.insert(key);
            }

            for child in children.get(&key).into_iter().flatten() {
                next.push(((key.0, *child), level + 1, legacy_child_ancestors(&ancestors, key.1)));
            }
            ordered.push(org);
        }
        frontier = next;
        depth += 1;
    }

    if !nodes.is_empty() {
        let mut stuck: Vec<_> = nodes.keys().copied().collect();
        stuck.sort();
        let (tenant_id, org_id) = stuck[0];
        return Err(format!(
            "parent pointers form a cycle through org {} in tenant {} ({} orgs unreachable from any root)",
            org_id,
            tenant_id,
            stuck.len()
        ));
    }
    debug!("Validated {} nodes across {} levels", ordered.len(), depth);

    let updates = ordered.iter().filter(|o| changed.contains(&(o.tenant_id, o.id))).cloned().collect();
    Ok(CleanPlan { nodes: ordered, updates, stats })
}

/// SQL restoring `org_units` from the run's shadow table
pub fn rollback_script(run: &MigrationRun, truncate_closure: bool) -> String {
    let backup = format!("\"{}\"", run.backup_table.replace('"', "\"\""));
    let (filter, scope_label) = match run.tenant_id {
        Some(tenant_id) => (format!(" WHERE tenant_id = {}", tenant_id), format!("tenant {}", tenant_id)),
        None => (String::new(), "all tenants".to_string()),
    };

    let mut script = vec![
        format!("-- Rollback for hierarchy migration {}", run.id),
        format!("-- Scope: {}; generated {}", scope_label, Utc::now().to_rfc3339()),
        format!("-- Restores org_units from {} ({} rows)", backup, run.backup_rows),
        "BEGIN;".to_string(),
        format!("DELETE FROM org_units{};", filter),
        format!("INSERT INTO org_units SELECT * FROM {};", backup),
    ];
    if truncate_closure {
        if run.tenant_id.is_some() {
            script.push(format!("DELETE FROM org_closure{};", filter));
        } else {
            script.push("TRUNCATE org_closure;".to_string());
        }
    }
    script.push("COMMIT;".to_string());
    script.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrgStatus;

    fn org(id: OrgId, parent_id: Option<OrgId>) -> OrgUnit {
        OrgUnit {
            id,
            tenant_id: 1,
            parent_id,
            name: format!("org-{}", id),
            status: OrgStatus::Active,
            deleted: false,
            level: None,
            ancestors: None,
        }
    }

    #[test]
    fn clean_orders_parents_first_and_counts_fixes() {
        let plan = clean(vec![org(3, Some(2)), org(2, Some(1)), org(1, Some(0)), org(4, Some(99))]).unwrap();

        let order: Vec<OrgId> = plan.nodes.iter().map(|o| o.id).collect();
        assert_eq!(order, vec![1, 4, 2, 3]);
        assert_eq!(plan.stats.sentinel_parents_cleared, 1);
        assert_eq!(plan.stats.dangling_parents_promoted, 1);
        assert_eq!(plan.stats.roots_normalized, 2);
        assert_eq!(plan.stats.levels_recomputed, 2);
        assert_eq!(plan.nodes[3].ancestors.as_deref(), Some("0,1,2"));
        assert_eq!(plan.updates.len(), 4);
    }

    #[test]
    fn clean_rejects_cycles() {
        let err = clean(vec![org(1, None), org(2, Some(3)), org(3, Some(2))]).err().unwrap();
        assert!(err.contains("cycle through org 2"), "{}", err);
    }

    #[test]
    fn clean_leaves_normalized_rows_alone() {
        let mut root = org(1, None);
        root.level = Some(0);
        root.ancestors = Some("0".to_string());
        let mut child = org(2, Some(1));
        child.level = Some(1);
        child.ancestors = Some("0,1".to_string());

        let plan = clean(vec![root, child]).unwrap();
        assert!(plan.updates.is_empty());
        assert_eq!(plan.stats.total(), 0);
    }

    #[test]
    fn rollback_script_is_scoped() {
        let mut run = MigrationRun::start(Some(5), "org_units_backup_x");
        run.backup_rows = 12;
        let script = rollback_script(&run, true);
        assert!(script.contains("DELETE FROM org_units WHERE tenant_id = 5;"));
        assert!(script.contains("INSERT INTO org_units SELECT * FROM \"org_units_backup_x\";"));
        assert!(script.contains("DELETE FROM org_closure WHERE tenant_id = 5;"));

        let all = MigrationRun::start(None, "b");
        let script = rollback_script(&all, false);
        assert!(script.contains("DELETE FROM org_units;"));
        assert!(!script.contains("org_closure"));
    }
}
