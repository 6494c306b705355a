//! Coordinator infrastructure: record stores, collaborators, stages, workers
//! and transports.

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod event_bus;
pub mod record_store;
pub mod stages;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{Collaborators, Coordinator, Stages};
