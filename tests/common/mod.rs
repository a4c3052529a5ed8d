#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use org_hierarchy::config::AppConfig;
use org_hierarchy::database::models::{ClosureEdge, NewOrgUnit, OrgUnit};
use org_hierarchy::database::{HierarchyStore, MemoryStore};
use org_hierarchy::types::{OrgId, TenantId};
use org_hierarchy::OrgEngine;

pub const T: TenantId = 10;
pub const OTHER: TenantId = 20;

pub const R: OrgId = 1;
pub const A: OrgId = 2;
pub const B: OrgId = 3;
pub const C: OrgId = 4;

pub struct TestEngine {
    pub memory: MemoryStore,
    pub engine: OrgEngine,
}

impl TestEngine {
    pub fn store(&self) -> &Arc<dyn HierarchyStore> {
        &self.engine.store
    }
}

/// In-memory engine with development settings
pub fn engine() -> TestEngine {
    engine_with(AppConfig::development())
}

pub fn engine_with(config: AppConfig) -> TestEngine {
    let memory = MemoryStore::new();
    let engine = OrgEngine::new(Arc::new(memory.clone()), &config);
    TestEngine { memory, engine }
}

/// R with children A and B, and C under A
pub async fn scenario_tree() -> Result<TestEngine> {
    let te = engine();
    create_all(&te, T, &[(R, None), (A, Some(R)), (B, Some(R)), (C, Some(A))]).await?;
    Ok(te)
}

pub async fn create_all(te: &TestEngine, tenant_id: TenantId, nodes: &[(OrgId, Option<OrgId>)]) -> Result<()> {
    for &(id, parent_id) in nodes {
        te.engine
            .create_org(NewOrgUnit::new(tenant_id, id, parent_id, format!("org-{}", id)))
            .await?;
    }
    Ok(())
}

pub fn ids(orgs: &[OrgUnit]) -> Vec<OrgId> {
    orgs.iter().map(|o| o.id).collect()
}

pub fn sorted_ids(orgs: &[OrgUnit]) -> Vec<OrgId> {
    let mut ids = ids(orgs);
    ids.sort_unstable();
    ids
}

/// Every closure row of a tenant, sorted
pub async fn edges(te: &TestEngine, tenant_id: TenantId) -> Result<Vec<ClosureEdge>> {
    let mut tx = te.store().read().await?;
    Ok(tx.edges(Some(tenant_id)).await?)
}

/// Insert raw org rows, bypassing the closure table
pub async fn seed_legacy_rows(te: &TestEngine, rows: &[OrgUnit]) -> Result<()> {
    let mut tx = te.store().begin().await?;
    for row in rows {
        tx.insert_org(row).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub fn legacy_row(tenant_id: TenantId, id: OrgId, parent_id: Option<OrgId>) -> OrgUnit {
    OrgUnit {
        id,
        tenant_id,
        parent_id,
        name: format!("legacy-{}", id),
        status: Default::default(),
        deleted: false,
        level: None,
        ancestors: None,
    }
}
