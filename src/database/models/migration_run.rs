use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::models::ConsistencyReport;
use crate::types::{OrgId, Scope, TenantId};

/// Linear migration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Backup,
    ValidateAndClean,
    BuildClosure,
    VerifyConsistency,
    PerformanceCompare,
    GenerateRollback,
    Done,
}

impl MigrationPhase {
    pub fn next(self) -> Option<MigrationPhase> {
        use MigrationPhase::*;
        match self {
            Backup => Some(ValidateAndClean),
            ValidateAndClean => Some(BuildClosure),
            BuildClosure => Some(VerifyConsistency),
            VerifyConsistency => Some(PerformanceCompare),
            PerformanceCompare => Some(GenerateRollback),
            GenerateRollback => Some(Done),
            Done => None,
        }
    }

    /// Failures in these phases abort the run with data untouched
    pub fn aborts_run(self) -> bool {
        matches!(self, MigrationPhase::Backup | MigrationPhase::ValidateAndClean)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Backup => "backup",
            MigrationPhase::ValidateAndClean => "validate_and_clean",
            MigrationPhase::BuildClosure => "build_closure",
            MigrationPhase::VerifyConsistency => "verify_consistency",
            MigrationPhase::PerformanceCompare => "performance_compare",
            MigrationPhase::GenerateRollback => "generate_rollback",
            MigrationPhase::Done => "done",
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Running,
    Succeeded,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Running => "running",
            MigrationStatus::Succeeded => "succeeded",
            MigrationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: MigrationPhase,
    pub success: bool,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

/// Legacy anomalies normalized before the closure build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStats {
    /// Parent pointer `0` replaced by none
    pub sentinel_parents_cleared: u64,
    /// Parent missing or soft-deleted, node promoted to root
    pub dangling_parents_promoted: u64,
    /// Root whose level or ancestor string disagreed with having no parent
    pub roots_normalized: u64,
    pub levels_recomputed: u64,
    pub ancestors_rewritten: u64,
}

impl CleanStats {
    pub fn total(&self) -> u64 {
        self.sentinel_parents_cleared
            + self.dangling_parents_promoted
            + self.roots_normalized
            + self.levels_recomputed
            + self.ancestors_rewritten
    }
}

/// Legacy LIKE-based lookup versus closure join for one subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceComparison {
    pub tenant_id: TenantId,
    pub org_id: OrgId,
    pub legacy_micros: u64,
    pub closure_micros: u64,
    pub legacy_count: u64,
    pub closure_count: u64,
    pub results_match: bool,
}

/// Audit record of one migration attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: Uuid,
    pub tenant_id: Scope,
    pub backup_table: String,
    pub status: MigrationStatus,
    pub failed_phase: Option<MigrationPhase>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub backup_rows: u64,
    pub nodes_processed: u64,
    pub edges_created: u64,
    pub clean: CleanStats,
    pub phases: Vec<PhaseOutcome>,
    pub consistency: Option<ConsistencyReport>,
    pub performance: Option<PerformanceComparison>,
    /// SHA-256 over the sorted edge set that was built
    pub closure_digest: Option<String>,
    pub rollback_script: Option<String>,
}

impl MigrationRun {
    pub fn start(tenant_id: Scope, backup_table: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            backup_table: backup_table.into(),
            status: MigrationStatus::Running,
            failed_phase: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            backup_rows: 0,
            nodes_processed: 0,
            edges_created: 0,
            clean: CleanStats::default(),
            phases: Vec::new(),
            consistency: None,
            performance: None,
            closure_digest: None,
            rollback_script: None,
        }
    }

    pub fn record_phase(&mut self, phase: MigrationPhase, success: bool, elapsed_ms: u64, detail: Option<String>) {
        self.phases.push(PhaseOutcome { phase, success, elapsed_ms, detail });
    }

    /// Mark the run failed at `phase`; the first failure wins
    pub fn fail(&mut self, phase: MigrationPhase, error: impl Into<String>) {
        if self.failed_phase.is_none() {
            self.failed_phase = Some(phase);
            self.error = Some(error.into());
        }
        self.status = MigrationStatus::Failed;
    }

    pub fn finish(&mut self) {
        let finished = Utc::now();
        self.duration_ms = (finished - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(finished);
        if self.status == MigrationStatus::Running {
            self.status = MigrationStatus::Succeeded;
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == MigrationStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_linearly_to_done() {
        let mut phase = MigrationPhase::Backup;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(phase, MigrationPhase::Done);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn only_pre_build_phases_abort() {
        assert!(MigrationPhase::Backup.aborts_run());
        assert!(MigrationPhase::ValidateAndClean.aborts_run());
        assert!(!MigrationPhase::BuildClosure.aborts_run());
        assert!(!MigrationPhase::GenerateRollback.aborts_run());
    }

    #[test]
    fn first_failure_is_kept() {
        let mut run = MigrationRun::start(Some(1), "org_units_backup_x");
        run.fail(MigrationPhase::VerifyConsistency, "first");
        run.fail(MigrationPhase::GenerateRollback, "second");
        run.finish();
        assert_eq!(run.failed_phase, Some(MigrationPhase::VerifyConsistency));
        assert_eq!(run.error.as_deref(), Some("first"));
        assert_eq!(run.status, MigrationStatus::Failed);
        assert!(run.finished_at.is_some());
    }
}
