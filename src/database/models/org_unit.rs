use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{OrgId, OrgStatus, TenantId};

/// A department or team inside one tenant's hierarchy.
///
/// `parent_id`, `level` and `ancestors` are metadata: hierarchy answers come
/// from the closure table, these columns are only written to keep the
/// legacy representation usable for migration and rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OrgUnit {
    pub id: OrgId,
    pub tenant_id: TenantId,
    pub parent_id: Option<OrgId>,
    pub name: String,
    pub status: OrgStatus,
    pub deleted: bool,
    pub level: Option<i32>,
    pub ancestors: Option<String>,
}

impl OrgUnit {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Not soft-deleted
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Input for creating an organizational unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrgUnit {
    pub id: OrgId,
    pub tenant_id: TenantId,
    pub parent_id: Option<OrgId>,
    pub name: String,
    #[serde(default)]
    pub status: OrgStatus,
}

impl NewOrgUnit {
    pub fn new(tenant_id: TenantId, id: OrgId, parent_id: Option<OrgId>, name: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            parent_id,
            name: name.into(),
            status: OrgStatus::Active,
        }
    }
}
