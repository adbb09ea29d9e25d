//! Tenant Mapping Reconciler
//!
//! Reconciles the set of hosts a tenant may see. `Create` only adds;
//! `Update` replaces the set. Mappings are keyed on hardware id, reactivated
//! rather than duplicated, and never physically removed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{normalize_hardware_id, DeleteReason, Mapping, RecordState};
use crate::registry::{Registry, RegistryView};

/// Additive or replace semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    Create,
    Update,
}

/// Mapping identity as reported back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingRef {
    pub mapping_id: Uuid,
    pub tenant_id: Uuid,
    pub hardware_id: String,
}

impl From<&Mapping> for MappingRef {
    fn from(m: &Mapping) -> Self {
        Self {
            mapping_id: m.id,
            tenant_id: m.tenant_id,
            hardware_id: m.hardware_id.clone(),
        }
    }
}

/// Outcome of one `create_or_update`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingResult {
    pub created: Vec<MappingRef>,
    /// Already active, or reactivated from a soft-deleted mapping
    pub retained: Vec<MappingRef>,
    /// Soft-deleted under replace semantics
    pub deactivated: Vec<MappingRef>,
    pub invalid_host_ids: Vec<String>,
}

pub struct TenantMappingReconciler {
    registry: Arc<Registry>,
    actor: String,
}

impl TenantMappingReconciler {
    pub fn new(registry: Arc<Registry>, actor: impl Into<String>) -> Self {
        Self {
            registry,
            actor: actor.into(),
        }
    }

    /// Reconcile a tenant's host set in one transaction
    pub fn create_or_update(
        &self,
        tenant_id: Uuid,
        host_ids: &[String],
        mode: MappingMode,
    ) -> Result<MappingResult, RegistryError> {
        let now = Utc::now();
        let requested: BTreeSet<String> = host_ids
            .iter()
            .map(|id| normalize_hardware_id(id))
            .filter(|id| !id.is_empty())
            .collect();

        let result = self.registry.transaction(|txn| {
            match txn.tenant(tenant_id) {
                Some(tenant) if tenant.is_active() => {}
                _ => return Err(RegistryError::TenantNotFound(tenant_id.to_string())),
            }

            let mut pending = requested.clone();
            let mut result = MappingResult::default();

            // active rows first so a stray soft-deleted duplicate is never revived
            let mut existing = txn.mappings_for_tenant(tenant_id);
            existing.sort_by_key(|m| !m.is_active());

            for mut mapping in existing {
                if pending.remove(&mapping.hardware_id) {
                    if !mapping.is_active() {
                        mapping.state = RecordState::Active;
                        mapping.audit.touch(&self.actor, now);
                        result.retained.push(MappingRef::from(&mapping));
                        txn.put_mapping(mapping)?;
                    } else {
                        result.retained.push(MappingRef::from(&mapping));
                    }
                } else if mode == MappingMode::Update
                    && mapping.is_active()
                    && !requested.contains(&mapping.hardware_id)
                {
                    mapping.state = RecordState::deleted(DeleteReason::Unmapped, now);
                    mapping.audit.touch(&self.actor, now);
                    result.deactivated.push(MappingRef::from(&mapping));
                    txn.put_mapping(mapping)?;
                }
            }

            for hardware_id in pending {
                if txn.hosts_with_hardware_id(&hardware_id).is_empty() {
                    result.invalid_host_ids.push(hardware_id);
                    continue;
                }
                let mapping = Mapping::new(tenant_id, &hardware_id, &self.actor, now);
                result.created.push(MappingRef::from(&mapping));
                txn.put_mapping(mapping)?;
            }

            Ok(result)
        })?;

        info!(
            tenant = %tenant_id,
            mode = ?mode,
            created = result.created.len(),
            retained = result.retained.len(),
            deactivated = result.deactivated.len(),
            invalid = result.invalid_host_ids.len(),
            "Tenant mappings reconciled"
        );

        Ok(result)
    }

    /// Soft-delete a single mapping
    pub fn delete_mapping(&self, mapping_id: Uuid) -> Result<MappingRef, RegistryError> {
        let now = Utc::now();
        self.registry.transaction(|txn| {
            let mut mapping = txn
                .mapping(mapping_id)
                .ok_or_else(|| RegistryError::MappingNotFound(mapping_id.to_string()))?;
            let reference = MappingRef::from(&mapping);
            if mapping.is_active() {
                mapping.state = RecordState::deleted(DeleteReason::Administrative, now);
                mapping.audit.touch(&self.actor, now);
                txn.put_mapping(mapping)?;
            }
            Ok(reference)
        })
    }

    pub fn active_mappings(&self, tenant_id: Uuid) -> Vec<MappingRef> {
        self.registry.read(|t| {
            t.active_mappings_for_tenant(tenant_id)
                .iter()
                .map(MappingRef::from)
                .collect()
        })
    }
}
