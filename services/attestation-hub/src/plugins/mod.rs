//! Delivery Plugins
//!
//! A plugin pushes one tenant's batch of trust reports to one downstream
//! orchestrator. Plugins are looked up by provider kind in a registry of
//! factories so new kinds can be added without touching the dispatcher.

pub mod kubernetes;
pub mod local_file;
pub mod mesos;
pub mod nova;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::PluginError;
use crate::model::PluginConfig;
use crate::report::ComposedReport;

pub use kubernetes::KubernetesPlugin;
pub use local_file::LocalFilePlugin;
pub use mesos::MesosPlugin;
pub use nova::NovaPlugin;

/// One host entry of a delivery payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDelivery {
    pub host_id: String,
    pub hardware_uuid: String,
    pub host_name: String,
    /// Serialized trust report; the exact bytes the signature covers
    pub trust_report: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_trust_report: Option<String>,
}

impl From<&ComposedReport> for HostDelivery {
    fn from(report: &ComposedReport) -> Self {
        Self {
            host_id: report.host_id.clone(),
            hardware_uuid: report.hardware_id.clone(),
            host_name: report.host_name.clone(),
            trust_report: report.trust_report_json.clone(),
            signed_trust_report: report.signed_trust_report.clone(),
        }
    }
}

/// Everything one tenant receives in a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub tenant_id: Uuid,
    pub hosts: Vec<HostDelivery>,
}

/// Push contract every delivery plugin implements
#[async_trait]
pub trait DeliveryPlugin: Send + Sync {
    /// Provider kind this plugin implements
    fn kind(&self) -> &str;

    /// Deliver `payload` using the tenant's plugin configuration
    async fn push(&self, config: &PluginConfig, payload: &DeliveryPayload) -> Result<(), PluginError>;
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn DeliveryPlugin> + Send + Sync>;

/// Settings shared by the built-in plugins
#[derive(Debug, Clone)]
pub struct PluginSettings {
    /// Default directory of the local-file plugin
    pub output_dir: PathBuf,
    /// Per-request timeout of HTTP based plugins
    pub request_timeout: Duration,
}

/// Provider kind to plugin factory; lookups are case-insensitive
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the local-file, nova, kubernetes and mesos plugins
    pub fn with_builtins(settings: &PluginSettings) -> Result<Self, PluginError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| PluginError::Transport(format!("Failed to create HTTP client: {e}")))?;

        let mut registry = Self::new();

        let local_file = Arc::new(LocalFilePlugin::new(settings.output_dir.clone()));
        registry.register_shared(local_file::KIND, local_file.clone());
        registry.register_shared("file", local_file);

        let nova = Arc::new(NovaPlugin::new(client.clone()));
        registry.register_shared(nova::KIND, nova.clone());
        registry.register_shared("openstack", nova);

        registry.register_shared(kubernetes::KIND, Arc::new(KubernetesPlugin::new()));
        registry.register_shared(mesos::KIND, Arc::new(MesosPlugin::new(client)));

        Ok(registry)
    }

    /// Register a factory for `kind`, replacing any previous one
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Arc<dyn DeliveryPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_lowercase(), Box::new(factory));
    }

    /// Register a single shared instance for `kind`
    pub fn register_shared(&mut self, kind: &str, plugin: Arc<dyn DeliveryPlugin>) {
        self.register(kind, move || plugin.clone());
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn DeliveryPlugin>, PluginError> {
        self.factories
            .get(&kind.trim().to_lowercase())
            .map(|factory| factory())
            .ok_or_else(|| PluginError::UnknownProvider(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Required, non-blank plugin property
pub(crate) fn required<'a>(config: &'a PluginConfig, key: &str) -> Result<&'a str, PluginError> {
    config
        .get(key)
        .ok_or_else(|| PluginError::MissingProperty(key.to_string()))
}

/// Parse an http(s) URL property
pub(crate) fn required_url(config: &PluginConfig, key: &str) -> Result<reqwest::Url, PluginError> {
    let raw = required(config, key)?;
    let url = reqwest::Url::parse(raw).map_err(|e| PluginError::InvalidProperty {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(PluginError::InvalidProperty {
            key: key.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
