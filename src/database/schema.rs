use sqlx::PgPool;
use tracing::info;

use crate::database::manager::DatabaseError;

/// DDL for the hierarchy tables, applied in order
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS org_units (
        tenant_id   BIGINT   NOT NULL,
        id          BIGINT   NOT NULL,
        parent_id   BIGINT   NULL,
        name        TEXT     NOT NULL,
        status      SMALLINT NOT NULL DEFAULT 0,
        deleted     BOOLEAN  NOT NULL DEFAULT FALSE,
        level       INTEGER  NULL,
        ancestors   TEXT     NULL,
        PRIMARY KEY (tenant_id, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS org_units_parent_idx ON org_units (tenant_id, parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS org_closure (
        tenant_id     BIGINT  NOT NULL,
        ancestor_id   BIGINT  NOT NULL,
        descendant_id BIGINT  NOT NULL,
        depth         INTEGER NOT NULL CHECK (depth >= 0),
        PRIMARY KEY (tenant_id, ancestor_id, descendant_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS org_closure_descendant_idx ON org_closure (tenant_id, descendant_id, depth)",
    r#"
    CREATE TABLE IF NOT EXISTS org_manager_assignments (
        tenant_id BIGINT NOT NULL,
        org_id    BIGINT NOT NULL,
        user_id   BIGINT NOT NULL,
        PRIMARY KEY (tenant_id, org_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS org_manager_cache (
        tenant_id       BIGINT   NOT NULL,
        org_id          BIGINT   NOT NULL,
        manager_user_id BIGINT   NOT NULL,
        role_type       SMALLINT NOT NULL,
        rank            INTEGER  NOT NULL,
        PRIMARY KEY (tenant_id, org_id, manager_user_id, role_type)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS org_manager_cache_user_idx ON org_manager_cache (tenant_id, manager_user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS org_migration_runs (
        id         UUID        PRIMARY KEY,
        tenant_id  BIGINT      NULL,
        status     TEXT        NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        record     JSONB       NOT NULL
    )
    "#,
];

/// Create any missing hierarchy tables and indexes
pub async fn ensure_schema(pool: &PgPool) -> Result<(), DatabaseError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Hierarchy schema ensured ({} statements)", SCHEMA.len());
    Ok(())
}
