use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrgId, Scope, TenantId};

/// Invariant categories audited by the consistency checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Live node without its depth-0 row
    MissingSelfReference,
    /// Parent pointers imply an ancestor the closure table lacks
    MissingAncestorEdge,
    /// Row referencing a soft-deleted or missing node
    OrphanedEdge,
    /// Row depth disagrees with `level(descendant) - level(ancestor)`
    DepthMismatch,
    /// Row between live nodes that parent pointers do not justify
    StaleEdge,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 5] = [
        ViolationKind::MissingSelfReference,
        ViolationKind::MissingAncestorEdge,
        ViolationKind::OrphanedEdge,
        ViolationKind::DepthMismatch,
        ViolationKind::StaleEdge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::MissingSelfReference => "missing_self_reference",
            ViolationKind::MissingAncestorEdge => "missing_ancestor_edge",
            ViolationKind::OrphanedEdge => "orphaned_edge",
            ViolationKind::DepthMismatch => "depth_mismatch",
            ViolationKind::StaleEdge => "stale_edge",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One offending row, reported rather than thrown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyViolation {
    pub kind: ViolationKind,
    pub tenant_id: TenantId,
    pub ancestor_id: OrgId,
    pub descendant_id: OrgId,
    /// Depth stored in the closure table, if a row exists
    pub depth: Option<i32>,
    /// Depth the invariants call for, if one can be derived
    pub expected_depth: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub kind: ViolationKind,
    pub count: u64,
    /// Capped sample of offending rows
    pub samples: Vec<ConsistencyViolation>,
}

/// Point-in-time diagnostic over one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub scope: Scope,
    pub checked_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub categories: Vec<CategorySummary>,
    pub total_nodes: u64,
    pub total_edges: u64,
    pub root_count: u64,
    pub max_depth: i32,
}

impl ConsistencyReport {
    pub fn count(&self, kind: ViolationKind) -> u64 {
        self.category(kind).map(|c| c.count).unwrap_or(0)
    }

    pub fn category(&self, kind: ViolationKind) -> Option<&CategorySummary> {
        self.categories.iter().find(|c| c.kind == kind)
    }

    pub fn total_violations(&self) -> u64 {
        self.categories.iter().map(|c| c.count).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.total_violations() == 0
    }

    /// Categories with at least one violation
    pub fn failing_categories(&self) -> impl Iterator<Item = &CategorySummary> {
        self.categories.iter().filter(|c| c.count > 0)
    }
}

/// Net changes applied by a repair run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub scope: Scope,
    pub self_references_inserted: u64,
    pub ancestor_edges_added: u64,
    pub ancestor_edges_removed: u64,
    pub levels_updated: u64,
    pub orphaned_edges_removed: u64,
    pub depths_corrected: u64,
    pub elapsed_ms: u64,
}

impl RepairReport {
    pub fn total_changes(&self) -> u64 {
        self.self_references_inserted
            + self.ancestor_edges_added
            + self.ancestor_edges_removed
            + self.levels_updated
            + self.orphaned_edges_removed
            + self.depths_corrected
    }

    pub fn is_noop(&self) -> bool {
        self.total_changes() == 0
    }
}
