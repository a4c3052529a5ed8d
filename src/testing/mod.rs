//! Fixtures for unit tests: an in-memory engine holding a small tree.
//!
//! ```text
//! R
//! ├── A
//! └── B
//!     └── C
//! ```
use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::models::NewOrgUnit;
use crate::database::{HierarchyStore, MemoryStore};
use crate::engine::OrgEngine;
use crate::services::{ConsistencyService, HierarchyService, ManagerCache, PerformanceMonitor};
use crate::types::{OrgId, TenantId};

pub const TENANT: TenantId = 1;
pub const R: OrgId = 100;
pub const A: OrgId = 101;
pub const B: OrgId = 102;
pub const C: OrgId = 103;

pub struct Fixture {
    pub config: AppConfig,
    pub store: Arc<dyn HierarchyStore>,
    pub monitor: Arc<PerformanceMonitor>,
    pub hierarchy: Arc<HierarchyService>,
    pub managers: Arc<ManagerCache>,
    pub consistency: Arc<ConsistencyService>,
}

/// Empty in-memory engine with development settings
pub fn empty_fixture() -> Fixture {
    let config = AppConfig::development();
    let store: Arc<dyn HierarchyStore> = Arc::new(MemoryStore::new());
    let engine = OrgEngine::new(Arc::clone(&store), &config);

    Fixture {
        store,
        monitor: Arc::clone(&engine.monitor),
        hierarchy: Arc::clone(&engine.hierarchy),
        managers: Arc::clone(&engine.managers),
        consistency: Arc::clone(&engine.consistency),
        config,
    }
}

/// Engine holding the R/A/B/C tree in `TENANT`
pub async fn fixture_tree() -> Fixture {
    let fx = empty_fixture();
    for (id, parent, name) in [(R, None, "Root"), (A, Some(R), "A"), (B, Some(R), "B"), (C, Some(B), "C")] {
        fx.hierarchy
            .create_org(NewOrgUnit::new(TENANT, id, parent, name))
            .await
            .expect("fixture org");
    }
    fx
}
