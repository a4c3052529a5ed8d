use async_trait::async_trait;

use crate::database::manager::DatabaseError;
use crate::database::models::{
    ClosureEdge, ManagerAssignment, ManagerCacheEntry, MigrationRun, OrgUnit,
};
use crate::types::{OrgId, Scope, TenantId, UserId};

/// Transactional storage behind every hierarchy component.
///
/// `begin` opens a read-write unit of work, `read` a read-only one. A
/// `StoreTx` dropped without `commit` is rolled back.
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, DatabaseError>;

    async fn read(&self) -> Result<Box<dyn StoreTx>, DatabaseError>;
}

/// One unit of work against the hierarchy tables.
///
/// Tenant-scoped methods never see rows of another tenant. `Scope`
/// parameters are for batch jobs, `None` covers every tenant.
#[async_trait]
pub trait StoreTx: Send {
    // ----- org units -----

    /// Org row by id, soft-deleted rows included
    async fn org(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Option<OrgUnit>, DatabaseError>;

    /// All org rows in scope, soft-deleted included, ordered by (tenant, id)
    async fn orgs(&mut self, scope: Scope) -> Result<Vec<OrgUnit>, DatabaseError>;

    /// Live rows whose parent pointer names `parent_id`
    async fn children_by_parent(
        &mut self,
        tenant_id: TenantId,
        parent_id: OrgId,
    ) -> Result<Vec<OrgUnit>, DatabaseError>;

    async fn tenant_ids(&mut self) -> Result<Vec<TenantId>, DatabaseError>;

    async fn insert_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError>;

    /// Overwrite parent, name, status, deleted flag, level and ancestors
    async fn update_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError>;

    // ----- closure table -----

    /// Live strict ancestors of `org_id` with their distance, nearest first
    async fn ancestors(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError>;

    /// Live strict descendants of `org_id` with their distance, nearest first
    async fn descendants(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError>;

    async fn edge(
        &mut self,
        tenant_id: TenantId,
        ancestor_id: OrgId,
        descendant_id: OrgId,
    ) -> Result<Option<ClosureEdge>, DatabaseError>;

    /// Rows with `descendant_id = org_id`, self-reference included
    async fn ancestor_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError>;

    /// Rows with `ancestor_id = org_id`, self-reference included
    async fn descendant_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError>;

    /// Every row in scope, ordered by (tenant, ancestor, descendant)
    async fn edges(&mut self, scope: Scope) -> Result<Vec<ClosureEdge>, DatabaseError>;

    /// Fails with `AlreadyExists` if any (tenant, ancestor, descendant) is taken
    async fn insert_edges(&mut self, edges: &[ClosureEdge]) -> Result<u64, DatabaseError>;

    async fn delete_edges(&mut self, tenant_id: TenantId, pairs: &[(OrgId, OrgId)]) -> Result<u64, DatabaseError>;

    /// Delete rows where `org_id` is ancestor or descendant
    async fn delete_edges_touching(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<u64, DatabaseError>;

    /// Delete every row in scope
    async fn clear_edges(&mut self, scope: Scope) -> Result<u64, DatabaseError>;

    async fn update_edge_depth(&mut self, edge: &ClosureEdge, depth: i32) -> Result<(), DatabaseError>;

    /// Descendant ids found through the legacy ancestor string, live only
    async fn legacy_descendant_ids(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<OrgId>, DatabaseError>;

    // ----- manager assignments and cache -----

    async fn assign_manager(&mut self, assignment: &ManagerAssignment) -> Result<(), DatabaseError>;

    async fn unassign_manager(&mut self, assignment: &ManagerAssignment) -> Result<bool, DatabaseError>;

    async fn manager_assignments(
        &mut self,
        tenant_id: TenantId,
        org_ids: &[OrgId],
    ) -> Result<Vec<ManagerAssignment>, DatabaseError>;

    /// Replace every cache row of one org
    async fn replace_manager_cache(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
        entries: &[ManagerCacheEntry],
    ) -> Result<(), DatabaseError>;

    async fn manager_cache(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ManagerCacheEntry>, DatabaseError>;

    /// Orgs whose cache rows name `user_id`, ascending
    async fn orgs_managed_by(&mut self, tenant_id: TenantId, user_id: UserId) -> Result<Vec<OrgId>, DatabaseError>;

    // ----- migration support -----

    /// Copy org rows in scope into a new shadow table named `table`
    async fn backup_orgs(&mut self, table: &str, scope: Scope) -> Result<u64, DatabaseError>;

    async fn append_migration_run(&mut self, run: &MigrationRun) -> Result<(), DatabaseError>;

    async fn migration_runs(&mut self, scope: Scope) -> Result<Vec<MigrationRun>, DatabaseError>;

    /// Serialize structural writes until commit or rollback.
    ///
    /// `Some(tenant)` excludes other writers of that tenant, `None` excludes
    /// every writer. Call before the first read the write depends on.
    async fn lock_hierarchy(&mut self, scope: Scope) -> Result<(), DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;
}
