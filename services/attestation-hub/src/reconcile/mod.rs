//! Registry reconcilers
//!
//! Everything that writes hosts, tenants or mappings goes through here.

pub mod hosts;
pub mod mappings;
pub mod tenants;

pub use hosts::{HostRegistryReconciler, ReconcileSummary, UpsertAction, UpsertOutcome};
pub use mappings::{MappingMode, MappingRef, MappingResult, TenantMappingReconciler};
pub use tenants::{NewTenant, TenantAdmin};
