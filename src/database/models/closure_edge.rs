use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{OrgId, TenantId};

/// One (ancestor, descendant, depth) row of the closure table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, FromRow)]
pub struct ClosureEdge {
    pub tenant_id: TenantId,
    pub ancestor_id: OrgId,
    pub descendant_id: OrgId,
    pub depth: i32,
}

impl ClosureEdge {
    pub fn new(tenant_id: TenantId, ancestor_id: OrgId, descendant_id: OrgId, depth: i32) -> Self {
        Self { tenant_id, ancestor_id, descendant_id, depth }
    }

    /// Self-reference row every live node owns
    pub fn self_reference(tenant_id: TenantId, org_id: OrgId) -> Self {
        Self::new(tenant_id, org_id, org_id, 0)
    }

    pub fn is_self_reference(&self) -> bool {
        self.ancestor_id == self.descendant_id && self.depth == 0
    }

    /// Primary key within a tenant
    pub fn pair(&self) -> (OrgId, OrgId) {
        (self.ancestor_id, self.descendant_id)
    }
}
