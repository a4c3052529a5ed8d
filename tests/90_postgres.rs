use std::sync::Arc;

use anyhow::Result;
use org_hierarchy::config::AppConfig;
use org_hierarchy::database::models::{ManagerRole, NewOrgUnit};
use org_hierarchy::database::{DatabaseManager, PgStore};
use org_hierarchy::types::TenantId;
use org_hierarchy::{HierarchyError, OrgEngine};
use sqlx::PgPool;

/// Skips unless DATABASE_URL points at a scratch database
async fn pg_engine() -> Result<Option<(OrgEngine, PgPool)>> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::from_env();
    if config.database.url.is_none() {
        eprintln!("DATABASE_URL not set, skipping Postgres test");
        return Ok(None);
    }

    let pool = DatabaseManager::connect(&config.database).await?;
    let store = PgStore::new(pool.clone());
    store.ensure_schema().await?;
    Ok(Some((OrgEngine::new(Arc::new(store), &config), pool)))
}

/// Tenant id unlikely to collide with other runs
fn scratch_tenant() -> TenantId {
    (uuid::Uuid::new_v4().as_u128() % 1_000_000_000) as TenantId + 1_000_000
}

async fn cleanup(pool: &PgPool, tenant_id: TenantId) -> Result<()> {
    for table in ["org_closure", "org_manager_cache", "org_manager_assignments", "org_units", "org_migration_runs"] {
        sqlx::query(&format!("DELETE FROM {} WHERE tenant_id = $1", table))
            .bind(tenant_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn scenario_runs_against_postgres() -> Result<()> {
    let Some((engine, pool)) = pg_engine().await? else {
        return Ok(());
    };
    let t = scratch_tenant();

    let result = async {
        for (id, parent) in [(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2))] {
            engine.create_org(NewOrgUnit::new(t, id, parent, format!("pg-{}", id))).await?;
        }

        let ancestors: Vec<_> = engine.hierarchy.find_ancestors(4, t).await?.iter().map(|o| o.id).collect();
        assert_eq!(ancestors, vec![2, 1]);
        assert_eq!(engine.hierarchy.depth_of(4, t).await?, 2);

        let err = engine.remove_node(2, t, false).await.unwrap_err();
        assert!(matches!(err, HierarchyError::HasChildren { .. }));

        engine.managers.assign_manager(1, 42, t).await?;
        engine.managers.rebuild(None, t).await?;
        assert_eq!(engine.managers.managers_of(4, t, ManagerRole::Escalation).await?, vec![42]);

        engine.move_node(2, None, t).await?;
        assert!(!engine.hierarchy.is_ancestor(1, 4, t).await?);
        assert!(engine.managers.managers_of(4, t, ManagerRole::Escalation).await?.is_empty());

        assert!(engine.consistency.check(Some(t)).await?.is_consistent());
        assert!(engine.consistency.repair(Some(t)).await?.is_noop());

        assert_eq!(engine.remove_node(2, t, true).await?, vec![4, 2]);
        anyhow::Ok(())
    }
    .await;

    cleanup(&pool, t).await?;
    result
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crossing_moves_never_form_a_cycle() -> Result<()> {
    let Some((engine, pool)) = pg_engine().await? else {
        return Ok(());
    };
    let engine = Arc::new(engine);
    let t = scratch_tenant();

    let result = async {
        for round in 0..20 {
            let base = round * 10;
            let (root, left, right) = (base + 1, base + 2, base + 3);
            for (id, parent) in [(root, None), (left, Some(root)), (right, Some(root))] {
                engine.create_org(NewOrgUnit::new(t, id, parent, format!("pg-{}", id))).await?;
            }

            let first = tokio::spawn({
                let engine = Arc::clone(&engine);
                async move { engine.move_node(left, Some(right), t).await }
            });
            let second = tokio::spawn({
                let engine = Arc::clone(&engine);
                async move { engine.move_node(right, Some(left), t).await }
            });
            let outcomes = [first.await?, second.await?];

            let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
            assert_eq!(succeeded, 1, "round {}: {:?}", round, outcomes);
            assert!(outcomes
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, HierarchyError::CyclicMove { .. })));

            let left_over_right = engine.hierarchy.is_ancestor(left, right, t).await?;
            let right_over_left = engine.hierarchy.is_ancestor(right, left, t).await?;
            assert!(left_over_right != right_over_left, "round {}", round);
        }

        assert!(engine.consistency.check(Some(t)).await?.is_consistent());
        anyhow::Ok(())
    }
    .await;

    cleanup(&pool, t).await?;
    result
}
