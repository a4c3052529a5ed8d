use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{OrgId, TenantId, UserId};

/// How a manager relates to the org a cache row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum ManagerRole {
    /// Assigned to the org itself
    Direct = 1,
    /// Assigned to one of the org's ancestors
    Escalation = 2,
}

/// Role-assignment input: `user_id` manages `org_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, FromRow)]
pub struct ManagerAssignment {
    pub tenant_id: TenantId,
    pub org_id: OrgId,
    pub user_id: UserId,
}

/// Denormalized, rebuildable row of the manager cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct ManagerCacheEntry {
    pub tenant_id: TenantId,
    pub org_id: OrgId,
    pub manager_user_id: UserId,
    pub role_type: ManagerRole,
    /// 0 for direct managers, 1.. along the escalation chain
    pub rank: i32,
}
