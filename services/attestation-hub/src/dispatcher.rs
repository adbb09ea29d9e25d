//! Plugin Dispatcher
//!
//! Fans composed trust reports out to every configured plugin of every
//! active tenant. Each (tenant, plugin) push is isolated: a failure or a
//! timeout is recorded and never affects the other pushes.

use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PluginError;
use crate::model::{Host, PluginConfig, Tenant};
use crate::plugins::{DeliveryPayload, HostDelivery, PluginRegistry};
use crate::registry::{Registry, RegistryView};
use crate::report::{ComposedReport, TrustReportComposer};

/// Result of one (tenant, plugin) push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub tenant_id: Uuid,
    pub plugin: String,
    pub provider: String,
    pub hosts: usize,
    pub error: Option<String>,
}

impl PushOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub tenants: usize,
    /// Active tenants without any deliverable host or composable report
    pub skipped_tenants: usize,
    pub signed: bool,
    /// Set when signing is required but no key is available
    pub withheld: bool,
    pub outcomes: Vec<PushOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Directory holding `hub_private_key.pem`; `None` delivers unsigned
    pub key_dir: Option<PathBuf>,
    pub push_timeout: Duration,
    /// Withhold delivery entirely when no signing key is available
    pub require_signed: bool,
}

struct TenantBatch {
    tenant: Tenant,
    hosts: Vec<Host>,
}

pub struct PluginDispatcher {
    registry: Arc<Registry>,
    plugins: Arc<PluginRegistry>,
    settings: DispatcherSettings,
}

impl PluginDispatcher {
    pub fn new(registry: Arc<Registry>, plugins: Arc<PluginRegistry>, settings: DispatcherSettings) -> Self {
        Self {
            registry,
            plugins,
            settings,
        }
    }

    /// Deliver the current registry state to every tenant
    pub async fn dispatch(&self) -> DispatchReport {
        // key is reloaded every cycle so a rotated or newly provisioned key is picked up
        let composer = match &self.settings.key_dir {
            Some(dir) => TrustReportComposer::from_key_dir(dir),
            None => TrustReportComposer::new(None),
        };

        let mut report = DispatchReport {
            signed: composer.is_signing(),
            ..Default::default()
        };

        if self.settings.require_signed && !composer.is_signing() {
            error!("Signed trust reports are required but no signing key is available, withholding delivery");
            report.withheld = true;
            return report;
        }

        let batches = self.collect_batches();
        report.tenants = batches.len();

        let mut pushes = Vec::new();
        for batch in batches {
            let tenant_id = batch.tenant.id;
            if batch.hosts.is_empty() {
                debug!(tenant = %tenant_id, "Tenant has no deliverable hosts, skipping");
                report.skipped_tenants += 1;
                continue;
            }

            let Some(payload) = compose_payload(tenant_id, &batch.hosts, |host| composer.compose(host)) else {
                warn!(tenant = %tenant_id, "No trust report could be composed for tenant, skipping");
                report.skipped_tenants += 1;
                continue;
            };
            let payload = Arc::new(payload);

            for config in batch.tenant.plugins {
                pushes.push(self.push(config, payload.clone()));
            }
        }

        report.outcomes = join_all(pushes).await;

        for outcome in &report.outcomes {
            match &outcome.error {
                None => debug!(tenant = %outcome.tenant_id, plugin = %outcome.plugin, "Push delivered"),
                Some(e) => error!(
                    tenant = %outcome.tenant_id,
                    plugin = %outcome.plugin,
                    provider = %outcome.provider,
                    error = %e,
                    "Push failed"
                ),
            }
        }

        info!(
            tenants = report.tenants,
            skipped = report.skipped_tenants,
            delivered = report.delivered(),
            failed = report.failed(),
            signed = report.signed,
            "Dispatch complete"
        );

        report
    }

    /// Active tenants with the active hosts behind their active mappings,
    /// read from one consistent registry view
    fn collect_batches(&self) -> Vec<TenantBatch> {
        self.registry.read(|tables| {
            tables
                .active_tenants()
                .into_iter()
                .map(|tenant| {
                    let hosts = tables
                        .active_mappings_for_tenant(tenant.id)
                        .iter()
                        .filter_map(|m| tables.active_host_by_hardware_id(&m.hardware_id))
                        .collect();
                    TenantBatch { tenant, hosts }
                })
                .collect()
        })
    }

    async fn push(&self, config: PluginConfig, payload: Arc<DeliveryPayload>) -> PushOutcome {
        let provider = config.provider().to_string();
        let mut outcome = PushOutcome {
            tenant_id: payload.tenant_id,
            plugin: config.name.clone(),
            provider: provider.clone(),
            hosts: payload.hosts.len(),
            error: None,
        };

        let result = match self.plugins.resolve(&provider) {
            Ok(plugin) => {
                match tokio::time::timeout(self.settings.push_timeout, plugin.push(&config, &payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(PluginError::Timeout(self.settings.push_timeout.as_secs())),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            outcome.error = Some(e.to_string());
        }
        outcome
    }
}

/// Compose a report per host; `None` when not a single one could be built
fn compose_payload<F>(tenant_id: Uuid, hosts: &[Host], compose: F) -> Option<DeliveryPayload>
where
    F: Fn(&Host) -> Result<ComposedReport, serde_json::Error>,
{
    let mut deliveries = Vec::with_capacity(hosts.len());
    for host in hosts {
        match compose(host) {
            Ok(composed) => deliveries.push(HostDelivery::from(&composed)),
            Err(e) => warn!(tenant = %tenant_id, host_id = %host.id, error = %e, "Failed to compose trust report"),
        }
    }
    if deliveries.is_empty() {
        return None;
    }
    Some(DeliveryPayload {
        tenant_id,
        hosts: deliveries,
    })
}
