//! Tenant lifecycle

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{DeleteReason, PluginConfig, RecordState, Tenant};
use crate::registry::{Registry, RegistryView};

/// Request to register a tenant
#[derive(Debug, Clone, Deserialize)]
pub struct NewTenant {
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl NewTenant {
    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Invalid("tenant name is required".into()));
        }
        if self.plugins.is_empty() {
            return Err(RegistryError::Invalid("at least one plugin is required".into()));
        }
        if self.plugins.iter().any(|p| p.name.trim().is_empty()) {
            return Err(RegistryError::Invalid("plugin name is required".into()));
        }
        Ok(())
    }
}

pub struct TenantAdmin {
    registry: Arc<Registry>,
    actor: String,
}

impl TenantAdmin {
    pub fn new(registry: Arc<Registry>, actor: impl Into<String>) -> Self {
        Self {
            registry,
            actor: actor.into(),
        }
    }

    pub fn create_tenant(&self, request: NewTenant) -> Result<Tenant, RegistryError> {
        request.validate()?;
        let tenant = Tenant::new(request.name.trim(), request.plugins, &self.actor);
        let id = tenant.id;

        let tenant = self.registry.transaction(|txn| {
            txn.put_tenant(tenant)?;
            txn.tenant(id)
                .ok_or_else(|| RegistryError::TenantNotFound(id.to_string()))
        })?;

        info!(tenant = %tenant.id, name = %tenant.name, plugins = tenant.plugins.len(), "Tenant created");
        Ok(tenant)
    }

    /// Soft-delete a tenant together with all of its active mappings
    pub fn delete_tenant(&self, tenant_id: Uuid) -> Result<Tenant, RegistryError> {
        let now = Utc::now();
        let (tenant, cascaded) = self.registry.transaction(|txn| {
            let mut tenant = txn
                .tenant(tenant_id)
                .filter(Tenant::is_active)
                .ok_or_else(|| RegistryError::TenantNotFound(tenant_id.to_string()))?;

            let mut cascaded = 0;
            for mut mapping in txn.active_mappings_for_tenant(tenant_id) {
                mapping.state = RecordState::deleted(DeleteReason::Administrative, now);
                mapping.audit.touch(&self.actor, now);
                txn.put_mapping(mapping)?;
                cascaded += 1;
            }

            tenant.state = RecordState::deleted(DeleteReason::Administrative, now);
            tenant.audit.touch(&self.actor, now);
            txn.put_tenant(tenant)?;
            let tenant = txn
                .tenant(tenant_id)
                .ok_or_else(|| RegistryError::TenantNotFound(tenant_id.to_string()))?;
            Ok((tenant, cascaded))
        })?;

        info!(tenant = %tenant_id, mappings = cascaded, "Tenant deleted");
        Ok(tenant)
    }

    pub fn active_tenants(&self) -> Vec<Tenant> {
        self.registry.read(|t| t.active_tenants())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{MappingMode, TenantMappingReconciler};
    use crate::testing;

    fn new_tenant(name: &str) -> NewTenant {
        NewTenant {
            name: name.to_string(),
            plugins: vec![PluginConfig::new("local-file")],
        }
    }

    #[test]
    fn test_create_tenant_validates() {
        let admin = TenantAdmin::new(Arc::new(Registry::in_memory()), "admin");

        assert!(matches!(
            admin.create_tenant(new_tenant("  ")),
            Err(RegistryError::Invalid(_))
        ));
        assert!(matches!(
            admin.create_tenant(NewTenant { name: "acme".into(), plugins: vec![] }),
            Err(RegistryError::Invalid(_))
        ));

        let tenant = admin.create_tenant(new_tenant(" acme ")).unwrap();
        assert_eq!(tenant.name, "acme");
        assert_eq!(tenant.version, 1);
        assert_eq!(tenant.audit.created_by, "admin");
    }

    #[test]
    fn test_delete_tenant_cascades_to_mappings() {
        let registry = Arc::new(Registry::in_memory());
        registry
            .transaction(|txn| txn.put_host(testing::host("h-1", "A")))
            .unwrap();
        let admin = TenantAdmin::new(registry.clone(), "admin");
        let mappings = TenantMappingReconciler::new(registry.clone(), "admin");

        let tenant = admin.create_tenant(new_tenant("acme")).unwrap();
        mappings
            .create_or_update(tenant.id, &["A".to_string()], MappingMode::Create)
            .unwrap();

        let deleted = admin.delete_tenant(tenant.id).unwrap();

        assert!(!deleted.is_active());
        assert!(mappings.active_mappings(tenant.id).is_empty());
        assert!(admin.active_tenants().is_empty());
        assert!(matches!(
            admin.delete_tenant(tenant.id),
            Err(RegistryError::TenantNotFound(_))
        ));
    }
}
