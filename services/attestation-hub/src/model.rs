//! Registry data model
//!
//! Hosts, tenants and tenant-to-host mappings. Nothing is ever physically
//! removed: records move between `Active` and `Deleted` and keep their ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tag name to tag values, ordered for stable serialization
pub type TagMap = BTreeMap<String, Vec<String>>;

/// Trust domain (bios, vmm, location, ...) to trusted flag
pub type TrustDomains = BTreeMap<String, bool>;

/// Actor recorded on writes performed by the sync engine
pub const SYSTEM_ACTOR: &str = "attestation-hub";

/// Reserved plugin property naming the provider kind
pub const PLUGIN_PROVIDER_KEY: &str = "plugin.provider";

/// Hardware ids are compared case-insensitively; stored upper case
pub fn normalize_hardware_id(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Why a record left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// Another host record re-enrolled with the same hardware id
    Superseded,
    /// The verified trust assertion is past its validity window
    Expired,
    /// Dropped from a tenant's mapping set under replace semantics
    Unmapped,
    /// Removed through the admin API
    Administrative,
}

/// Lifecycle of every registry record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    Active,
    Deleted {
        reason: DeleteReason,
        at: DateTime<Utc>,
    },
}

impl RecordState {
    pub fn is_active(&self) -> bool {
        matches!(self, RecordState::Active)
    }

    pub fn deleted(reason: DeleteReason, at: DateTime<Utc>) -> Self {
        RecordState::Deleted { reason, at }
    }
}

/// Who touched a record and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_by: String,
    pub modified_at: DateTime<Utc>,
}

impl Audit {
    pub fn new(actor: &str, at: DateTime<Utc>) -> Self {
        Self {
            created_by: actor.to_string(),
            created_at: at,
            modified_by: actor.to_string(),
            modified_at: at,
        }
    }

    pub fn touch(&mut self, actor: &str, at: DateTime<Utc>) {
        self.modified_by = actor.to_string();
        self.modified_at = at;
    }
}

/// Trust state derived from the last verified assertion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustState {
    pub domains: TrustDomains,
    pub trusted: bool,
    pub valid_to: Option<DateTime<Utc>>,
}

/// A physical machine as last seen by the attestation authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Registry id; the authority's host id
    pub id: String,
    /// Upper-cased hardware uuid
    pub hardware_id: String,
    pub name: String,
    pub connection_url: Option<String>,
    pub aik_certificate: Option<String>,
    pub aik_sha1: Option<String>,
    pub bios_mle_uuid: Option<String>,
    pub trust: TrustState,
    pub tags: TagMap,
    /// Host trust response document as published by the authority
    pub trust_response: Option<serde_json::Value>,
    /// Raw signed assertion, re-verified by the expiry sweeper
    pub assertion: Option<String>,
    pub state: RecordState,
    pub audit: Audit,
    /// Optimistic concurrency counter; 0 means never stored
    pub version: u64,
}

impl Host {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// A named delivery target for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PluginProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginProperty {
    pub key: String,
    pub value: String,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(PluginProperty {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// First non-blank value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key && !p.value.trim().is_empty())
            .map(|p| p.value.trim())
    }

    /// Provider kind: the `plugin.provider` property, else the plugin name
    pub fn provider(&self) -> &str {
        self.get(PLUGIN_PROVIDER_KEY).unwrap_or(self.name.as_str())
    }
}

/// A customer of the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub plugins: Vec<PluginConfig>,
    pub state: RecordState,
    pub audit: Audit,
    pub version: u64,
}

impl Tenant {
    pub fn new(name: impl Into<String>, plugins: Vec<PluginConfig>, actor: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            plugins,
            state: RecordState::Active,
            audit: Audit::new(actor, now),
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Membership of a host (by hardware id) in a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub hardware_id: String,
    pub state: RecordState,
    pub audit: Audit,
    pub version: u64,
}

impl Mapping {
    pub fn new(tenant_id: Uuid, hardware_id: &str, actor: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            hardware_id: normalize_hardware_id(hardware_id),
            state: RecordState::Active,
            audit: Audit::new(actor, at),
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
