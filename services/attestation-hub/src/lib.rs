//! Attestation Hub
//!
//! Pulls host trust attestations from an attestation authority, keeps a
//! registry of hosts, tenants and tenant-to-host mappings, and pushes signed
//! per-host trust reports to each tenant's orchestrators.

pub mod api;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod fsutil;
pub mod model;
pub mod plugins;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod source;
pub mod sweeper;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use config::HubConfig;
pub use dispatcher::{DispatchReport, DispatcherSettings, PluginDispatcher};
pub use registry::Registry;
pub use scheduler::{CycleReport, SyncScheduler};
