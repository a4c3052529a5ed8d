mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use common::{scenario_tree, A, B, C, R, T};
use org_hierarchy::database::models::ManagerRole;

#[tokio::test]
async fn escalation_chain_runs_nearest_to_farthest() -> Result<()> {
    let te = scenario_tree().await?;
    let m = &te.engine.managers;

    m.assign_manager(R, 100, T).await?;
    m.assign_manager(A, 200, T).await?;
    m.assign_manager(A, 201, T).await?;
    m.assign_manager(C, 300, T).await?;
    m.rebuild(None, T).await?;

    assert_eq!(m.managers_of(C, T, ManagerRole::Direct).await?, vec![300]);
    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![200, 201, 100]);
    assert_eq!(m.managers_of(B, T, ManagerRole::Escalation).await?, vec![100]);
    assert!(m.managers_of(R, T, ManagerRole::Escalation).await?.is_empty());

    assert_eq!(m.orgs_managed_by(200, T).await?, vec![A, C]);
    assert_eq!(m.orgs_managed_by(100, T).await?, vec![R, A, B, C]);
    Ok(())
}

#[tokio::test]
async fn rebuild_picks_up_the_new_manager() -> Result<()> {
    let te = scenario_tree().await?;
    let m = &te.engine.managers;

    m.set_managers(A, &[1], T).await?;
    assert_eq!(m.managers_of(A, T, ManagerRole::Direct).await?, vec![1]);

    m.set_managers(A, &[2], T).await?;
    // Still the published snapshot until rebuilt
    assert_eq!(m.managers_of(A, T, ManagerRole::Direct).await?, vec![1]);

    let stats = m.rebuild(Some(A), T).await?;
    assert_eq!(stats.orgs_rebuilt, 2);
    assert_eq!(m.managers_of(A, T, ManagerRole::Direct).await?, vec![2]);
    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![2]);
    Ok(())
}

#[tokio::test]
async fn unassigned_managers_drop_out_after_rebuild() -> Result<()> {
    let te = scenario_tree().await?;
    let m = &te.engine.managers;

    m.assign_manager(R, 5, T).await?;
    m.assign_manager(R, 6, T).await?;
    m.rebuild(None, T).await?;
    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![5, 6]);

    assert!(m.unassign_manager(R, 5, T).await?);
    assert!(!m.unassign_manager(R, 5, T).await?);
    m.rebuild(Some(R), T).await?;

    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![6]);
    assert!(m.orgs_managed_by(5, T).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn moves_and_removals_keep_the_cache_in_step() -> Result<()> {
    let te = scenario_tree().await?;
    let m = &te.engine.managers;

    m.assign_manager(A, 7, T).await?;
    m.assign_manager(B, 8, T).await?;
    m.rebuild(None, T).await?;
    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![7]);

    te.engine.move_node(C, Some(B), T).await?;
    assert_eq!(m.managers_of(C, T, ManagerRole::Escalation).await?, vec![8]);
    assert_eq!(m.orgs_managed_by(7, T).await?, vec![A]);

    te.engine.remove_node(C, T, false).await?;
    assert_eq!(m.orgs_managed_by(8, T).await?, vec![B]);
    assert!(m.managers_of(C, T, ManagerRole::Escalation).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_partial_rebuild() -> Result<()> {
    let te = scenario_tree().await?;
    let managers = Arc::clone(&te.engine.managers);

    let old = vec![11, 12];
    let new = vec![21, 22, 23];
    managers.set_managers(A, &old, T).await?;
    managers.rebuild(Some(A), T).await?;

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let managers = Arc::clone(&managers);
        let done = Arc::clone(&done);
        let (old, new) = (old.clone(), new.clone());
        readers.push(tokio::spawn(async move {
            let mut reads = 0u64;
            loop {
                let direct = managers.managers_of(A, T, ManagerRole::Direct).await?;
                assert!(direct == old || direct == new, "mixed manager set: {:?}", direct);
                let escalation = managers.managers_of(C, T, ManagerRole::Escalation).await?;
                assert!(
                    escalation == old || escalation == new,
                    "mixed escalation chain: {:?}",
                    escalation
                );
                reads += 1;
                if done.load(Ordering::Relaxed) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            anyhow::Ok(reads)
        }));
    }

    for round in 0..20 {
        let next = if round % 2 == 0 { &new } else { &old };
        managers.set_managers(A, next, T).await?;
        managers.rebuild(Some(A), T).await?;
        tokio::task::yield_now().await;
    }
    done.store(true, Ordering::Relaxed);

    for reads in futures::future::join_all(readers).await {
        assert!(reads?? > 0);
    }

    // 20 rounds end on the old set
    assert_eq!(managers.managers_of(A, T, ManagerRole::Direct).await?, old);
    Ok(())
}
