//! Closure math shared by the consistency checker, repair and migration.
//!
//! Everything here is pure: it derives what the closure table should
//! contain from org rows, without touching storage.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::database::models::{ClosureEdge, OrgUnit};
use crate::types::{OrgId, TenantId};

pub type EdgeKey = (TenantId, OrgId, OrgId);

/// Closure implied by parent pointers of live org rows
#[derive(Debug, Default)]
pub struct ExpectedClosure {
    /// Strict ancestor rows (depth > 0)
    pub edges: BTreeMap<EdgeKey, i32>,
    /// Distance from the node's root
    pub levels: HashMap<(TenantId, OrgId), i32>,
    /// Nodes whose parent chain loops back on itself
    pub cyclic: Vec<(TenantId, OrgId)>,
}

impl ExpectedClosure {
    pub fn level(&self, tenant_id: TenantId, org_id: OrgId) -> Option<i32> {
        self.levels.get(&(tenant_id, org_id)).copied()
    }

    pub fn to_edges(&self) -> Vec<ClosureEdge> {
        self.edges
            .iter()
            .map(|(&(t, a, d), &depth)| ClosureEdge::new(t, a, d, depth))
            .collect()
    }
}

/// Walk each live node's parent chain. A parent that is missing or
/// soft-deleted ends the chain, so its child counts as a root.
pub fn expected_closure(orgs: &[OrgUnit]) -> ExpectedClosure {
    let live: HashMap<(TenantId, OrgId), &OrgUnit> = orgs
        .iter()
        .filter(|o| o.is_live())
        .map(|o| ((o.tenant_id, o.id), o))
        .collect();

    let mut expected = ExpectedClosure::default();

    for org in orgs.iter().filter(|o| o.is_live()) {
        let tenant_id = org.tenant_id;
        let mut visited = HashSet::from([org.id]);
        let mut cursor = org.parent_id;
        let mut depth = 1;

        while let Some(parent_id) = cursor {
            let Some(parent) = live.get(&(tenant_id, parent_id)) else {
                break;
            };
            if !visited.insert(parent_id) {
                expected.cyclic.push((tenant_id, org.id));
                break;
            }
            expected.edges.insert((tenant_id, parent_id, org.id), depth);
            depth += 1;
            cursor = parent.parent_id;
        }

        expected.levels.insert((tenant_id, org.id), depth - 1);
    }

    expected
}

/// Hex SHA-256 over the sorted edge set; equal sets give equal digests
pub fn digest(edges: &[ClosureEdge]) -> String {
    let mut sorted = edges.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    for e in &sorted {
        hasher.update(format!("{}:{}:{}:{}\n", e.tenant_id, e.ancestor_id, e.descendant_id, e.depth).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
