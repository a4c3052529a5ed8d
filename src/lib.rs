pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod services;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use engine::OrgEngine;
pub use error::HierarchyError;
