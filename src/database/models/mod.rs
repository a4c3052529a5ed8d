pub mod closure_edge;
pub mod consistency;
pub mod manager;
pub mod migration_run;
pub mod org_unit;

pub use closure_edge::ClosureEdge;
pub use consistency::{CategorySummary, ConsistencyReport, ConsistencyViolation, RepairReport, ViolationKind};
pub use manager::{ManagerAssignment, ManagerCacheEntry, ManagerRole};
pub use migration_run::{
    CleanStats, MigrationPhase, MigrationRun, MigrationStatus, PerformanceComparison, PhaseOutcome,
};
pub use org_unit::{NewOrgUnit, OrgUnit};
