/// Shared types used across the codebase

use serde::{Deserialize, Serialize};

/// Tenant isolation boundary. Every query and mutation is scoped to one.
pub type TenantId = i64;

/// Organizational unit id, unique within a tenant
pub type OrgId = i64;

/// User id as known to the host application
pub type UserId = i64;

/// Scope of a batch job: one tenant, or every tenant when `None`
pub type Scope = Option<TenantId>;

/// Lifecycle status of an organizational unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum OrgStatus {
    Active = 0,
    Disabled = 1,
}

impl Default for OrgStatus {
    fn default() -> Self {
        OrgStatus::Active
    }
}

/// Legacy ancestor string carried by root nodes
pub const LEGACY_ROOT_ANCESTORS: &str = "0";

/// Build the legacy ancestor string for a child of `parent_id` whose own
/// legacy string is `parent_ancestors`
pub fn legacy_child_ancestors(parent_ancestors: &str, parent_id: OrgId) -> String {
    if parent_ancestors.is_empty() {
        format!("{},{}", LEGACY_ROOT_ANCESTORS, parent_id)
    } else {
        format!("{},{}", parent_ancestors, parent_id)
    }
}

/// Parse a legacy ancestor string into ids, dropping the root sentinel
pub fn parse_legacy_ancestors(ancestors: &str) -> Vec<OrgId> {
    ancestors
        .split(',')
        .filter_map(|s| s.trim().parse::<OrgId>().ok())
        .filter(|&id| id != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_legacy_ancestor_chain() {
        assert_eq!(legacy_child_ancestors("0", 100), "0,100");
        assert_eq!(legacy_child_ancestors("0,100", 101), "0,100,101");
        assert_eq!(legacy_child_ancestors("", 7), "0,7");
    }

    #[test]
    fn parses_legacy_ancestors_without_sentinel() {
        assert_eq!(parse_legacy_ancestors("0,100,101"), vec![100, 101]);
        assert!(parse_legacy_ancestors("0").is_empty());
        assert!(parse_legacy_ancestors("").is_empty());
        assert_eq!(parse_legacy_ancestors("0, 5 ,x,6"), vec![5, 6]);
    }
}
