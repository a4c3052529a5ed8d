mod common;

use anyhow::Result;
use common::{edges, engine, ids, legacy_row, seed_legacy_rows, TestEngine, OTHER, T};
use org_hierarchy::database::models::{MigrationPhase, MigrationStatus};
use org_hierarchy::services::MigrationOptions;
use org_hierarchy::HierarchyError;

/// 1 (sentinel parent) -> 2 -> 3, 1 -> 4, 5 (dangling parent) -> 6, 7 soft-deleted
async fn legacy_tenant() -> Result<TestEngine> {
    let te = engine();
    let mut deleted = legacy_row(T, 7, Some(1));
    deleted.deleted = true;
    seed_legacy_rows(
        &te,
        &[
            legacy_row(T, 1, Some(0)),
            legacy_row(T, 2, Some(1)),
            legacy_row(T, 3, Some(2)),
            legacy_row(T, 4, Some(1)),
            legacy_row(T, 5, Some(77)),
            legacy_row(T, 6, Some(5)),
            deleted,
            legacy_row(OTHER, 1, None),
        ],
    )
    .await?;
    Ok(te)
}

#[tokio::test]
async fn migration_builds_a_consistent_closure() -> Result<()> {
    let te = legacy_tenant().await?;

    let run = te
        .engine
        .migration
        .migrate(MigrationOptions::for_tenant(T).with_backup_table("org_units_backup_first"))
        .await?;

    assert!(run.succeeded(), "run failed: {:?}", run.error);
    assert_eq!(run.status, MigrationStatus::Succeeded);
    assert_eq!(run.backup_rows, 7);
    assert_eq!(run.nodes_processed, 6);
    assert_eq!(run.edges_created, 11);
    assert_eq!(run.clean.sentinel_parents_cleared, 1);
    assert_eq!(run.clean.dangling_parents_promoted, 1);
    assert_eq!(run.phases.len(), 6);
    assert_eq!(run.phases.last().map(|p| p.phase), Some(MigrationPhase::GenerateRollback));
    assert!(run.phases.windows(2).all(|w| w[0].phase.next() == Some(w[1].phase)));
    assert!(run.phases.iter().all(|p| p.success));
    assert!(run.consistency.as_ref().is_some_and(|r| r.is_consistent()));

    let comparison = run.performance.as_ref().expect("comparison ran");
    assert_eq!(comparison.org_id, 1);
    assert_eq!(comparison.closure_count, 3);
    assert!(comparison.results_match);

    let h = &te.engine.hierarchy;
    assert_eq!(ids(&h.find_ancestors(3, T).await?), vec![2, 1]);
    assert_eq!(ids(&h.find_ancestors(6, T).await?), vec![5]);
    assert_eq!(h.get_org(1, T).await?.and_then(|o| o.parent_id), None);

    // Backup holds the untouched legacy rows of this tenant only
    let backup = te.memory.backup_rows("org_units_backup_first").expect("backup table");
    assert_eq!(backup.len(), 7);
    assert!(backup.iter().any(|o| o.id == 1 && o.parent_id == Some(0)));

    assert!(edges(&te, OTHER).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rerunning_produces_the_same_digest() -> Result<()> {
    let te = legacy_tenant().await?;
    let m = &te.engine.migration;

    let first = m.migrate(MigrationOptions::for_tenant(T).with_backup_table("bk_one")).await?;
    let after_first = edges(&te, T).await?;
    let second = m.migrate(MigrationOptions::for_tenant(T).with_backup_table("bk_two")).await?;

    assert!(first.closure_digest.is_some());
    assert_eq!(first.closure_digest, second.closure_digest);
    assert_eq!(edges(&te, T).await?, after_first);
    assert_eq!(second.clean.total(), 0);

    let history = m.history(Some(T)).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    Ok(())
}

#[tokio::test]
async fn taken_backup_table_aborts_before_touching_data() -> Result<()> {
    let te = legacy_tenant().await?;
    let m = &te.engine.migration;

    m.migrate(MigrationOptions::for_tenant(T).with_backup_table("bk_taken")).await?;
    let before = edges(&te, T).await?;

    let err = m
        .migrate(MigrationOptions::for_tenant(T).with_backup_table("bk_taken"))
        .await
        .unwrap_err();
    assert!(matches!(err, HierarchyError::BackupFailed { ref table, .. } if table == "bk_taken"));
    assert_eq!(edges(&te, T).await?, before);

    let err = m
        .migrate(MigrationOptions::for_tenant(T).with_backup_table("Bad Name; DROP"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BACKUP_FAILED");

    let history = m.history(Some(T)).await?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].failed_phase, Some(MigrationPhase::Backup));
    assert_eq!(history[1].status, MigrationStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn parent_cycles_fail_validation() -> Result<()> {
    let te = engine();
    seed_legacy_rows(
        &te,
        &[legacy_row(T, 1, None), legacy_row(T, 2, Some(3)), legacy_row(T, 3, Some(2))],
    )
    .await?;

    let err = te
        .engine
        .migration
        .migrate(MigrationOptions::for_tenant(T).with_backup_table("bk_cycle"))
        .await
        .unwrap_err();
    match err {
        HierarchyError::MigrationPhaseFailed { phase, ref reason } => {
            assert_eq!(phase, MigrationPhase::ValidateAndClean);
            assert!(reason.contains("cycle"), "{}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(edges(&te, T).await?.is_empty());

    let history = te.engine.migration.history(Some(T)).await?;
    assert_eq!(history[0].failed_phase, Some(MigrationPhase::ValidateAndClean));
    Ok(())
}

#[tokio::test]
async fn rollback_script_targets_the_backup() -> Result<()> {
    let te = legacy_tenant().await?;

    let run = te.engine.migration.migrate(MigrationOptions::for_tenant(T)).await?;
    assert!(run.backup_table.starts_with("org_units_backup_"));

    let script = run.rollback_script.as_deref().expect("script generated");
    assert!(script.contains(&format!("FROM \"{}\"", run.backup_table)));
    assert!(script.contains(&format!("DELETE FROM org_units WHERE tenant_id = {};", T)));
    assert!(script.contains("DELETE FROM org_closure WHERE tenant_id = 10;"));

    let mut options = MigrationOptions::for_tenant(T).with_backup_table("bk_keep_closure");
    options.truncate_closure_on_rollback = Some(false);
    let run = te.engine.migration.migrate(options).await?;
    assert!(!run.rollback_script.unwrap_or_default().contains("org_closure"));
    Ok(())
}
