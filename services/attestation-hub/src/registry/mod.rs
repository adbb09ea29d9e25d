//! Host / Tenant / Mapping Registry
//!
//! In-process store with all-or-nothing transactions. A transaction stages
//! its writes, holds the registry exclusively while it runs, and at commit
//! checks record versions and the uniqueness invariants:
//! - at most one active host per hardware id
//! - at most one active mapping per (tenant, hardware id)
//!
//! When a snapshot file is configured it is rewritten before the commit is
//! acknowledged; a failed write rolls the in-memory state back. Bulk writers
//! stage a whole pass in one transaction and isolate per-record failures
//! with [`Transaction::savepoint`].

pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{normalize_hardware_id, Host, Mapping, Tenant};

pub use snapshot::SnapshotFile;

/// Registry rows, keyed by id
#[derive(Debug, Default, Clone)]
pub struct Tables {
    hosts: BTreeMap<String, Host>,
    tenants: BTreeMap<Uuid, Tenant>,
    mappings: BTreeMap<Uuid, Mapping>,
}

/// Read access shared by committed tables and open transactions
pub trait RegistryView {
    fn host(&self, id: &str) -> Option<Host>;
    fn hosts(&self) -> Vec<Host>;
    fn tenant(&self, id: Uuid) -> Option<Tenant>;
    fn tenants(&self) -> Vec<Tenant>;
    fn mapping(&self, id: Uuid) -> Option<Mapping>;
    fn mappings(&self) -> Vec<Mapping>;

    fn active_hosts(&self) -> Vec<Host> {
        self.hosts().into_iter().filter(Host::is_active).collect()
    }

    /// Every host record, active or not, with this hardware id
    fn hosts_with_hardware_id(&self, hardware_id: &str) -> Vec<Host> {
        let hardware_id = normalize_hardware_id(hardware_id);
        self.hosts()
            .into_iter()
            .filter(|h| h.hardware_id == hardware_id)
            .collect()
    }

    fn active_host_by_hardware_id(&self, hardware_id: &str) -> Option<Host> {
        self.hosts_with_hardware_id(hardware_id)
            .into_iter()
            .find(Host::is_active)
    }

    fn active_tenants(&self) -> Vec<Tenant> {
        self.tenants().into_iter().filter(Tenant::is_active).collect()
    }

    /// All mappings of a tenant, including soft-deleted ones
    fn mappings_for_tenant(&self, tenant_id: Uuid) -> Vec<Mapping> {
        self.mappings()
            .into_iter()
            .filter(|m| m.tenant_id == tenant_id)
            .collect()
    }

    fn active_mappings_for_tenant(&self, tenant_id: Uuid) -> Vec<Mapping> {
        self.mappings_for_tenant(tenant_id)
            .into_iter()
            .filter(Mapping::is_active)
            .collect()
    }
}

impl RegistryView for Tables {
    fn host(&self, id: &str) -> Option<Host> {
        self.hosts.get(id).cloned()
    }

    fn hosts(&self) -> Vec<Host> {
        self.hosts.values().cloned().collect()
    }

    fn tenant(&self, id: Uuid) -> Option<Tenant> {
        self.tenants.get(&id).cloned()
    }

    fn tenants(&self) -> Vec<Tenant> {
        self.tenants.values().cloned().collect()
    }

    fn mapping(&self, id: Uuid) -> Option<Mapping> {
        self.mappings.get(&id).cloned()
    }

    fn mappings(&self) -> Vec<Mapping> {
        self.mappings.values().cloned().collect()
    }
}

/// Staged writes over a consistent view of the committed tables
pub struct Transaction<'a> {
    base: &'a Tables,
    staged: Tables,
}

fn merge<K: Ord + Clone, V: Clone>(base: &BTreeMap<K, V>, staged: &BTreeMap<K, V>) -> Vec<V> {
    let mut merged = base.clone();
    merged.extend(staged.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.into_values().collect()
}

fn stale(entity: &'static str, id: String, current: u64, given: u64) -> RegistryError {
    RegistryError::Conflict {
        entity,
        id,
        reason: format!("stale version {given}, current is {current}"),
    }
}

impl<'a> Transaction<'a> {
    /// Stage a host write; `host.version` must match the stored version
    pub fn put_host(&mut self, mut host: Host) -> Result<(), RegistryError> {
        host.hardware_id = normalize_hardware_id(&host.hardware_id);
        let current = self.host(&host.id).map_or(0, |h| h.version);
        if host.version != current {
            return Err(stale("host", host.id.clone(), current, host.version));
        }
        host.version = current + 1;
        self.staged.hosts.insert(host.id.clone(), host);
        Ok(())
    }

    pub fn put_tenant(&mut self, mut tenant: Tenant) -> Result<(), RegistryError> {
        let current = self.tenant(tenant.id).map_or(0, |t| t.version);
        if tenant.version != current {
            return Err(stale("tenant", tenant.id.to_string(), current, tenant.version));
        }
        tenant.version = current + 1;
        self.staged.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    pub fn put_mapping(&mut self, mut mapping: Mapping) -> Result<(), RegistryError> {
        mapping.hardware_id = normalize_hardware_id(&mapping.hardware_id);
        let current = self.mapping(mapping.id).map_or(0, |m| m.version);
        if mapping.version != current {
            return Err(stale("mapping", mapping.id.to_string(), current, mapping.version));
        }
        mapping.version = current + 1;
        self.staged.mappings.insert(mapping.id, mapping);
        Ok(())
    }

    /// Run `f` as a nested unit. When `f` fails, or its writes break an
    /// invariant, only its own writes are dropped and the transaction stays
    /// usable.
    pub fn savepoint<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let saved = self.staged.clone();
        let result = f(self).and_then(|value| self.validate().map(|_| value));
        if result.is_err() {
            self.staged = saved;
        }
        result
    }

    fn is_empty(&self) -> bool {
        self.staged.hosts.is_empty() && self.staged.tenants.is_empty() && self.staged.mappings.is_empty()
    }

    /// Check the uniqueness invariants for every key the transaction touched
    fn validate(&self) -> Result<(), RegistryError> {
        let touched_hardware: BTreeSet<&str> = self
            .staged
            .hosts
            .values()
            .map(|h| h.hardware_id.as_str())
            .collect();
        for hardware_id in touched_hardware {
            let active = self
                .hosts_with_hardware_id(hardware_id)
                .into_iter()
                .filter(Host::is_active)
                .count();
            if active > 1 {
                return Err(RegistryError::Conflict {
                    entity: "host",
                    id: hardware_id.to_string(),
                    reason: format!("{active} active hosts share this hardware id"),
                });
            }
        }

        let touched_pairs: BTreeSet<(Uuid, &str)> = self
            .staged
            .mappings
            .values()
            .map(|m| (m.tenant_id, m.hardware_id.as_str()))
            .collect();
        for (tenant_id, hardware_id) in touched_pairs {
            if self.tenant(tenant_id).is_none() {
                return Err(RegistryError::TenantNotFound(tenant_id.to_string()));
            }
            let active = self
                .mappings_for_tenant(tenant_id)
                .into_iter()
                .filter(|m| m.is_active() && m.hardware_id == hardware_id)
                .count();
            if active > 1 {
                return Err(RegistryError::Conflict {
                    entity: "mapping",
                    id: format!("{tenant_id}/{hardware_id}"),
                    reason: format!("{active} active mappings for this tenant and host"),
                });
            }
        }

        Ok(())
    }
}

impl RegistryView for Transaction<'_> {
    fn host(&self, id: &str) -> Option<Host> {
        self.staged.host(id).or_else(|| self.base.host(id))
    }

    fn hosts(&self) -> Vec<Host> {
        merge(&self.base.hosts, &self.staged.hosts)
    }

    fn tenant(&self, id: Uuid) -> Option<Tenant> {
        self.staged.tenant(id).or_else(|| self.base.tenant(id))
    }

    fn tenants(&self) -> Vec<Tenant> {
        merge(&self.base.tenants, &self.staged.tenants)
    }

    fn mapping(&self, id: Uuid) -> Option<Mapping> {
        self.staged.mapping(id).or_else(|| self.base.mapping(id))
    }

    fn mappings(&self) -> Vec<Mapping> {
        merge(&self.base.mappings, &self.staged.mappings)
    }
}

/// Rows replaced by a commit, kept to undo it if persistence fails
#[derive(Default)]
struct Undo {
    hosts: Vec<(String, Option<Host>)>,
    tenants: Vec<(Uuid, Option<Tenant>)>,
    mappings: Vec<(Uuid, Option<Mapping>)>,
}

impl Undo {
    fn apply(staged: Tables, tables: &mut Tables) -> Self {
        let mut undo = Undo::default();
        for (id, host) in staged.hosts {
            undo.hosts.push((id.clone(), tables.hosts.insert(id, host)));
        }
        for (id, tenant) in staged.tenants {
            undo.tenants.push((id, tables.tenants.insert(id, tenant)));
        }
        for (id, mapping) in staged.mappings {
            undo.mappings.push((id, tables.mappings.insert(id, mapping)));
        }
        undo
    }

    fn revert(self, tables: &mut Tables) {
        for (id, previous) in self.hosts {
            match previous {
                Some(host) => tables.hosts.insert(id, host),
                None => tables.hosts.remove(&id),
            };
        }
        for (id, previous) in self.tenants {
            match previous {
                Some(tenant) => tables.tenants.insert(id, tenant),
                None => tables.tenants.remove(&id),
            };
        }
        for (id, previous) in self.mappings {
            match previous {
                Some(mapping) => tables.mappings.insert(id, mapping),
                None => tables.mappings.remove(&id),
            };
        }
    }
}

/// The registry shared by the sync engine and the admin API
pub struct Registry {
    tables: RwLock<Tables>,
    snapshot: Option<SnapshotFile>,
    generation: AtomicU64,
}

impl Registry {
    /// Volatile registry
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Registry backed by a snapshot file, loading it when present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let snapshot = SnapshotFile::new(path);
        let tables = snapshot.load()?.unwrap_or_default();
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(snapshot),
            generation: AtomicU64::new(0),
        })
    }

    /// Number of commits that changed state since the registry was opened
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run `f` against a consistent view of committed state
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Run `f` as one atomic transaction.
    ///
    /// Any error from `f`, a stale version or an invariant violation
    /// discards every staged write.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        let (value, staged) = {
            let mut txn = Transaction {
                base: &guard,
                staged: Tables::default(),
            };
            let value = f(&mut txn)?;
            if txn.is_empty() {
                return Ok(value);
            }
            txn.validate()?;
            (value, txn.staged)
        };

        let writes = staged.hosts.len() + staged.tenants.len() + staged.mappings.len();
        let undo = Undo::apply(staged, &mut guard);

        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.store(&guard) {
                error!(error = %e, "Registry snapshot write failed, rolling back");
                undo.revert(&mut guard);
                return Err(e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(writes, generation, "Registry transaction committed");
        Ok(value)
    }
}
