use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::database::manager::{DatabaseError, DatabaseManager};
use crate::database::models::{
    ClosureEdge, ManagerAssignment, ManagerCacheEntry, MigrationRun, OrgUnit,
};
use crate::database::schema;
use crate::database::store::{HierarchyStore, StoreTx};
use crate::types::{OrgId, Scope, TenantId, UserId};

const ORG_COLUMNS: &str = "id, tenant_id, parent_id, name, status, deleted, level, ancestors";

/// Advisory lock namespaces, hashed with the tenant id into a lock key
const TENANT_LOCK: &str = "org_hierarchy.tenant";
const GLOBAL_LOCK: &str = "org_hierarchy.all";

/// Postgres error code for unique_violation
const UNIQUE_VIOLATION: &str = "23505";
/// Postgres error code for duplicate_table
const DUPLICATE_TABLE: &str = "42P07";

#[derive(FromRow)]
struct OrgDepthRow {
    #[sqlx(flatten)]
    org: OrgUnit,
    depth: i32,
}

/// Map constraint failures onto `AlreadyExists`, pass everything else through
fn map_conflict(err: sqlx::Error, what: impl FnOnce() -> String) -> DatabaseError {
    let code = err
        .as_database_error()
        .and_then(|e| e.code())
        .map(|c| c.into_owned());
    match code.as_deref() {
        Some(UNIQUE_VIOLATION) | Some(DUPLICATE_TABLE) => DatabaseError::AlreadyExists(what()),
        _ => DatabaseError::Sqlx(err),
    }
}

/// Closure-table store on Postgres
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        schema::ensure_schema(&self.pool).await
    }
}

#[async_trait]
impl HierarchyStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn read(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn org(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Option<OrgUnit>, DatabaseError> {
        let sql = format!("SELECT {} FROM org_units WHERE tenant_id = $1 AND id = $2", ORG_COLUMNS);
        let org = sqlx::query_as::<_, OrgUnit>(&sql)
            .bind(tenant_id)
            .bind(org_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(org)
    }

    async fn orgs(&mut self, scope: Scope) -> Result<Vec<OrgUnit>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM org_units WHERE ($1::BIGINT IS NULL OR tenant_id = $1) ORDER BY tenant_id, id",
            ORG_COLUMNS
        );
        let orgs = sqlx::query_as::<_, OrgUnit>(&sql)
            .bind(scope)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(orgs)
    }

    async fn children_by_parent(
        &mut self,
        tenant_id: TenantId,
        parent_id: OrgId,
    ) -> Result<Vec<OrgUnit>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM org_units WHERE tenant_id = $1 AND parent_id = $2 AND NOT deleted ORDER BY id",
            ORG_COLUMNS
        );
        let orgs = sqlx::query_as::<_, OrgUnit>(&sql)
            .bind(tenant_id)
            .bind(parent_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(orgs)
    }

    async fn tenant_ids(&mut self) -> Result<Vec<TenantId>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT DISTINCT tenant_id FROM org_units ORDER BY tenant_id")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(ids)
    }

    async fn insert_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO org_units (id, tenant_id, parent_id, name, status, deleted, level, ancestors)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(org.id)
        .bind(org.tenant_id)
        .bind(org.parent_id)
        .bind(&org.name)
        .bind(org.status)
        .bind(org.deleted)
        .bind(org.level)
        .bind(&org.ancestors)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_conflict(e, || format!("org {} in tenant {}", org.id, org.tenant_id)))?;
        Ok(())
    }

    async fn update_org(&mut self, org: &OrgUnit) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE org_units
             SET parent_id = $3, name = $4, status = $5, deleted = $6, level = $7, ancestors = $8
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(org.tenant_id)
        .bind(org.id)
        .bind(org.parent_id)
        .bind(&org.name)
        .bind(org.status)
        .bind(org.deleted)
        .bind(org.level)
        .bind(&org.ancestors)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("org {} in tenant {}", org.id, org.tenant_id)));
        }
        Ok(())
    }

    async fn ancestors(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError> {
        let rows = sqlx::query_as::<_, OrgDepthRow>(
            "SELECT o.id, o.tenant_id, o.parent_id, o.name, o.status, o.deleted, o.level, o.ancestors, c.depth
             FROM org_closure c
             JOIN org_units o ON o.tenant_id = c.tenant_id AND o.id = c.ancestor_id
             WHERE c.tenant_id = $1 AND c.descendant_id = $2 AND c.depth > 0 AND NOT o.deleted
             ORDER BY c.depth, o.id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|r| (r.org, r.depth)).collect())
    }

    async fn descendants(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
    ) -> Result<Vec<(OrgUnit, i32)>, DatabaseError> {
        let rows = sqlx::query_as::<_, OrgDepthRow>(
            "SELECT o.id, o.tenant_id, o.parent_id, o.name, o.status, o.deleted, o.level, o.ancestors, c.depth
             FROM org_closure c
             JOIN org_units o ON o.tenant_id = c.tenant_id AND o.id = c.descendant_id
             WHERE c.tenant_id = $1 AND c.ancestor_id = $2 AND c.depth > 0 AND NOT o.deleted
             ORDER BY c.depth, o.id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|r| (r.org, r.depth)).collect())
    }

    async fn edge(
        &mut self,
        tenant_id: TenantId,
        ancestor_id: OrgId,
        descendant_id: OrgId,
    ) -> Result<Option<ClosureEdge>, DatabaseError> {
        let edge = sqlx::query_as::<_, ClosureEdge>(
            "SELECT tenant_id, ancestor_id, descendant_id, depth FROM org_closure
             WHERE tenant_id = $1 AND ancestor_id = $2 AND descendant_id = $3",
        )
        .bind(tenant_id)
        .bind(ancestor_id)
        .bind(descendant_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(edge)
    }

    async fn ancestor_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError> {
        let edges = sqlx::query_as::<_, ClosureEdge>(
            "SELECT tenant_id, ancestor_id, descendant_id, depth FROM org_closure
             WHERE tenant_id = $1 AND descendant_id = $2 ORDER BY ancestor_id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(edges)
    }

    async fn descendant_edges(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ClosureEdge>, DatabaseError> {
        let edges = sqlx::query_as::<_, ClosureEdge>(
            "SELECT tenant_id, ancestor_id, descendant_id, depth FROM org_closure
             WHERE tenant_id = $1 AND ancestor_id = $2 ORDER BY descendant_id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(edges)
    }

    async fn edges(&mut self, scope: Scope) -> Result<Vec<ClosureEdge>, DatabaseError> {
        let edges = sqlx::query_as::<_, ClosureEdge>(
            "SELECT tenant_id, ancestor_id, descendant_id, depth FROM org_closure
             WHERE ($1::BIGINT IS NULL OR tenant_id = $1)
             ORDER BY tenant_id, ancestor_id, descendant_id",
        )
        .bind(scope)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(edges)
    }

    async fn insert_edges(&mut self, edges: &[ClosureEdge]) -> Result<u64, DatabaseError> {
        if edges.is_empty() {
            return Ok(0);
        }
        let tenants: Vec<i64> = edges.iter().map(|e| e.tenant_id).collect();
        let ancestors: Vec<i64> = edges.iter().map(|e| e.ancestor_id).collect();
        let descendants: Vec<i64> = edges.iter().map(|e| e.descendant_id).collect();
        let depths: Vec<i32> = edges.iter().map(|e| e.depth).collect();

        let result = sqlx::query(
            "INSERT INTO org_closure (tenant_id, ancestor_id, descendant_id, depth)
             SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::BIGINT[], $4::INTEGER[])",
        )
        .bind(tenants)
        .bind(ancestors)
        .bind(descendants)
        .bind(depths)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_conflict(e, || format!("closure edges ({} rows)", edges.len())))?;
        Ok(result.rows_affected())
    }

    async fn delete_edges(&mut self, tenant_id: TenantId, pairs: &[(OrgId, OrgId)]) -> Result<u64, DatabaseError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let ancestors: Vec<i64> = pairs.iter().map(|p| p.0).collect();
        let descendants: Vec<i64> = pairs.iter().map(|p| p.1).collect();

        let result = sqlx::query(
            "DELETE FROM org_closure c
             USING UNNEST($2::BIGINT[], $3::BIGINT[]) AS p(ancestor_id, descendant_id)
             WHERE c.tenant_id = $1 AND c.ancestor_id = p.ancestor_id AND c.descendant_id = p.descendant_id",
        )
        .bind(tenant_id)
        .bind(ancestors)
        .bind(descendants)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_edges_touching(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM org_closure WHERE tenant_id = $1 AND (ancestor_id = $2 OR descendant_id = $2)",
        )
        .bind(tenant_id)
        .bind(org_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_edges(&mut self, scope: Scope) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM org_closure WHERE ($1::BIGINT IS NULL OR tenant_id = $1)")
            .bind(scope)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_edge_depth(&mut self, edge: &ClosureEdge, depth: i32) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE org_closure SET depth = $4
             WHERE tenant_id = $1 AND ancestor_id = $2 AND descendant_id = $3",
        )
        .bind(edge.tenant_id)
        .bind(edge.ancestor_id)
        .bind(edge.descendant_id)
        .bind(depth)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "closure edge ({}, {}) in tenant {}",
                edge.ancestor_id, edge.descendant_id, edge.tenant_id
            )));
        }
        Ok(())
    }

    async fn legacy_descendant_ids(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<OrgId>, DatabaseError> {
        let pattern = format!("%,{},%", org_id);
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM org_units
             WHERE tenant_id = $1 AND id <> $2 AND NOT deleted
               AND (',' || COALESCE(ancestors, '') || ',') LIKE $3
             ORDER BY id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .bind(pattern)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn assign_manager(&mut self, assignment: &ManagerAssignment) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO org_manager_assignments (tenant_id, org_id, user_id)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(assignment.tenant_id)
        .bind(assignment.org_id)
        .bind(assignment.user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn unassign_manager(&mut self, assignment: &ManagerAssignment) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM org_manager_assignments WHERE tenant_id = $1 AND org_id = $2 AND user_id = $3",
        )
        .bind(assignment.tenant_id)
        .bind(assignment.org_id)
        .bind(assignment.user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn manager_assignments(
        &mut self,
        tenant_id: TenantId,
        org_ids: &[OrgId],
    ) -> Result<Vec<ManagerAssignment>, DatabaseError> {
        if org_ids.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, ManagerAssignment>(
            "SELECT tenant_id, org_id, user_id FROM org_manager_assignments
             WHERE tenant_id = $1 AND org_id = ANY($2)
             ORDER BY org_id, user_id",
        )
        .bind(tenant_id)
        .bind(org_ids.to_vec())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn replace_manager_cache(
        &mut self,
        tenant_id: TenantId,
        org_id: OrgId,
        entries: &[ManagerCacheEntry],
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM org_manager_cache WHERE tenant_id = $1 AND org_id = $2")
            .bind(tenant_id)
            .bind(org_id)
            .execute(&mut *self.tx)
            .await?;

        if entries.is_empty() {
            return Ok(());
        }
        let users: Vec<i64> = entries.iter().map(|e| e.manager_user_id).collect();
        let roles: Vec<i16> = entries.iter().map(|e| e.role_type as i16).collect();
        let ranks: Vec<i32> = entries.iter().map(|e| e.rank).collect();

        sqlx::query(
            "INSERT INTO org_manager_cache (tenant_id, org_id, manager_user_id, role_type, rank)
             SELECT $1, $2, u, r, k FROM UNNEST($3::BIGINT[], $4::SMALLINT[], $5::INTEGER[]) AS t(u, r, k)",
        )
        .bind(tenant_id)
        .bind(org_id)
        .bind(users)
        .bind(roles)
        .bind(ranks)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn manager_cache(&mut self, tenant_id: TenantId, org_id: OrgId) -> Result<Vec<ManagerCacheEntry>, DatabaseError> {
        let rows = sqlx::query_as::<_, ManagerCacheEntry>(
            "SELECT tenant_id, org_id, manager_user_id, role_type, rank FROM org_manager_cache
             WHERE tenant_id = $1 AND org_id = $2
             ORDER BY role_type, rank, manager_user_id",
        )
        .bind(tenant_id)
        .bind(org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn orgs_managed_by(&mut self, tenant_id: TenantId, user_id: UserId) -> Result<Vec<OrgId>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT org_id FROM org_manager_cache
             WHERE tenant_id = $1 AND manager_user_id = $2
             ORDER BY org_id",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn backup_orgs(&mut self, table: &str, scope: Scope) -> Result<u64, DatabaseError> {
        if !DatabaseManager::is_valid_table_name(table) {
            return Err(DatabaseError::InvalidTableName(table.to_string()));
        }
        let quoted = DatabaseManager::quote_identifier(table);
        // Utility statements take no bind parameters; the tenant id is numeric
        let filter = match scope {
            Some(tenant_id) => format!("tenant_id = {}", tenant_id),
            None => "TRUE".to_string(),
        };

        sqlx::query(&format!("CREATE TABLE {} AS SELECT * FROM org_units WHERE {}", quoted, filter))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_conflict(e, || format!("table {}", table)))?;

        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quoted))
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn append_migration_run(&mut self, run: &MigrationRun) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO org_migration_runs (id, tenant_id, status, started_at, record)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(Json(run))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn migration_runs(&mut self, scope: Scope) -> Result<Vec<MigrationRun>, DatabaseError> {
        let rows = sqlx::query_scalar::<_, Json<MigrationRun>>(
            "SELECT record FROM org_migration_runs
             WHERE ($1::BIGINT IS NULL OR tenant_id = $1)
             ORDER BY started_at",
        )
        .bind(scope)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|Json(run)| run).collect())
    }

    async fn lock_hierarchy(&mut self, scope: Scope) -> Result<(), DatabaseError> {
        // Tenant writers share the global key, whole-table jobs take it
        // exclusively. The global key always comes first.
        let global = if scope.is_some() {
            "SELECT pg_advisory_xact_lock_shared(hashtextextended($1, 0))"
        } else {
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))"
        };
        sqlx::query(global).bind(GLOBAL_LOCK).execute(&mut *self.tx).await?;

        if let Some(tenant_id) = scope {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, $2))")
                .bind(TENANT_LOCK)
                .bind(tenant_id)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}
