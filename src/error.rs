// Hierarchy Error Types
use serde_json::{json, Value};
use thiserror::Error;

use crate::database::manager::DatabaseError;
use crate::database::models::MigrationPhase;
use crate::types::{OrgId, TenantId};

/// Structured failure of a hierarchy operation.
///
/// Invariant violations found on committed data are not errors; they are
/// reported through `ConsistencyReport`.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("Parent {parent_id} of org {org_id} does not exist in tenant {tenant_id}")]
    InvalidParent {
        tenant_id: TenantId,
        org_id: OrgId,
        parent_id: OrgId,
    },

    #[error("Moving org {org_id} under {new_parent_id} would create a cycle in tenant {tenant_id}")]
    CyclicMove {
        tenant_id: TenantId,
        org_id: OrgId,
        new_parent_id: OrgId,
    },

    #[error("Org {org_id} in tenant {tenant_id} still has {} direct children", children.len())]
    HasChildren {
        tenant_id: TenantId,
        org_id: OrgId,
        children: Vec<OrgId>,
    },

    #[error("Org {org_id} not found in tenant {tenant_id}")]
    NodeNotFound { tenant_id: TenantId, org_id: OrgId },

    #[error("Org {org_id} already exists in tenant {tenant_id}")]
    DuplicateNode { tenant_id: TenantId, org_id: OrgId },

    #[error("Backup to table '{table}' failed: {reason}")]
    BackupFailed { table: String, reason: String },

    #[error("Migration phase '{phase}' failed: {reason}")]
    MigrationPhaseFailed { phase: MigrationPhase, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl HierarchyError {
    /// Stable error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            HierarchyError::InvalidParent { .. } => "INVALID_PARENT",
            HierarchyError::CyclicMove { .. } => "CYCLIC_MOVE",
            HierarchyError::HasChildren { .. } => "HAS_CHILDREN",
            HierarchyError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            HierarchyError::DuplicateNode { .. } => "DUPLICATE_NODE",
            HierarchyError::BackupFailed { .. } => "BACKUP_FAILED",
            HierarchyError::MigrationPhaseFailed { .. } => "MIGRATION_PHASE_FAILED",
            HierarchyError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Org ids the failure concerns
    pub fn affected_ids(&self) -> Vec<OrgId> {
        match self {
            HierarchyError::InvalidParent { org_id, parent_id, .. } => vec![*org_id, *parent_id],
            HierarchyError::CyclicMove { org_id, new_parent_id, .. } => vec![*org_id, *new_parent_id],
            HierarchyError::HasChildren { org_id, children, .. } => {
                let mut ids = vec![*org_id];
                ids.extend(children.iter().copied());
                ids
            }
            HierarchyError::NodeNotFound { org_id, .. } => vec![*org_id],
            HierarchyError::DuplicateNode { org_id, .. } => vec![*org_id],
            _ => vec![],
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            HierarchyError::InvalidParent { tenant_id, .. }
            | HierarchyError::CyclicMove { tenant_id, .. }
            | HierarchyError::HasChildren { tenant_id, .. }
            | HierarchyError::NodeNotFound { tenant_id, .. }
            | HierarchyError::DuplicateNode { tenant_id, .. } => Some(*tenant_id),
            _ => None,
        }
    }

    /// Caller may retry after fixing input or running a cascade; storage
    /// failures need operator attention
    pub fn is_caller_error(&self) -> bool {
        !matches!(
            self,
            HierarchyError::Database(_)
                | HierarchyError::BackupFailed { .. }
                | HierarchyError::MigrationPhaseFailed { .. }
        )
    }

    /// Convert to a structured JSON body
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "error": true,
            "code": self.error_code(),
            "message": self.to_string(),
            "affected_ids": self.affected_ids(),
        });

        if let Some(tenant_id) = self.tenant_id() {
            body["tenant_id"] = json!(tenant_id);
        }
        if let HierarchyError::MigrationPhaseFailed { phase, .. } = self {
            body["phase"] = json!(phase.as_str());
        }

        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_children_lists_every_child() {
        let err = HierarchyError::HasChildren {
            tenant_id: 7,
            org_id: 1,
            children: vec![2, 3],
        };
        assert_eq!(err.error_code(), "HAS_CHILDREN");
        assert_eq!(err.affected_ids(), vec![1, 2, 3]);
        assert_eq!(err.to_string(), "Org 1 in tenant 7 still has 2 direct children");
        assert!(err.is_caller_error());
    }

    #[test]
    fn json_body_carries_phase_for_migration_failures() {
        let err = HierarchyError::MigrationPhaseFailed {
            phase: MigrationPhase::ValidateAndClean,
            reason: "cycle".to_string(),
        };
        let body = err.to_json();
        assert_eq!(body["code"], "MIGRATION_PHASE_FAILED");
        assert_eq!(body["phase"], "validate_and_clean");
        assert!(body.get("tenant_id").is_none());
        assert!(!err.is_caller_error());
    }

    #[test]
    fn database_errors_are_wrapped() {
        let err: HierarchyError = DatabaseError::ReadOnly.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.affected_ids().is_empty());
    }
}
