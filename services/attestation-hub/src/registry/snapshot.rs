//! JSON snapshot persistence for the registry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::Tables;
use crate::error::RegistryError;
use crate::fsutil::write_atomic;
use crate::model::{Host, Mapping, Tenant};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    tenants: Vec<Tenant>,
    #[serde(default)]
    mappings: Vec<Mapping>,
}

/// File holding the full registry contents, rewritten on every commit
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot; `None` when no snapshot has been written yet
    pub fn load(&self) -> Result<Option<Tables>, RegistryError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path).map_err(|e| {
            RegistryError::Persistence(format!("reading {}: {e}", self.path.display()))
        })?;
        let doc: SnapshotDocument = serde_json::from_slice(&bytes).map_err(|e| {
            RegistryError::Persistence(format!("parsing {}: {e}", self.path.display()))
        })?;

        info!(
            path = %self.path.display(),
            hosts = doc.hosts.len(),
            tenants = doc.tenants.len(),
            mappings = doc.mappings.len(),
            "Loaded registry snapshot"
        );

        let mut tables = Tables::default();
        for host in doc.hosts {
            tables.hosts.insert(host.id.clone(), host);
        }
        for tenant in doc.tenants {
            tables.tenants.insert(tenant.id, tenant);
        }
        for mapping in doc.mappings {
            tables.mappings.insert(mapping.id, mapping);
        }
        Ok(Some(tables))
    }

    pub fn store(&self, tables: &Tables) -> Result<(), RegistryError> {
        let doc = SnapshotDocument {
            hosts: tables.hosts.values().cloned().collect(),
            tenants: tables.tenants.values().cloned().collect(),
            mappings: tables.mappings.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        write_atomic(&self.path, &bytes).map_err(|e| {
            RegistryError::Persistence(format!("writing {}: {e}", self.path.display()))
        })
    }
}
