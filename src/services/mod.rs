pub mod closure;
pub mod consistency_service;
pub mod hierarchy_service;
pub mod manager_cache;
pub mod migration_service;
pub mod performance_monitor;
pub mod scheduler;

pub use consistency_service::ConsistencyService;
pub use hierarchy_service::HierarchyService;
pub use manager_cache::{ManagerCache, ManagerSnapshot, RebuildStats};
pub use migration_service::{MigrationOptions, MigrationService};
pub use performance_monitor::{HealthStatus, PerformanceMonitor, PerformanceSummary};
pub use scheduler::Scheduler;
