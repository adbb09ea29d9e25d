//! Kubernetes delivery
//!
//! Server-side applies one `HostAttributes` custom resource per (tenant, host)
//! so schedulers in the tenant cluster can match workloads to trusted nodes.
//! Names carry the tenant id, so tenants sharing a namespace never write to
//! each other's objects.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{DeliveryPayload, DeliveryPlugin, HostDelivery};
use crate::error::PluginError;
use crate::model::PluginConfig;

pub const KIND: &str = "kubernetes";

pub const CRD_GROUP: &str = "crd.attestation-hub.io";
pub const CRD_VERSION: &str = "v1beta1";
pub const CRD_KIND: &str = "HostAttributes";
pub const CRD_PLURAL: &str = "hostattributes";

const FIELD_MANAGER: &str = "attestation-hub";
const DEFAULT_NAMESPACE: &str = "default";

pub fn host_attributes_resource() -> ApiResource {
    ApiResource {
        group: CRD_GROUP.to_string(),
        version: CRD_VERSION.to_string(),
        api_version: format!("{}/{}", CRD_GROUP, CRD_VERSION),
        kind: CRD_KIND.to_string(),
        plural: CRD_PLURAL.to_string(),
    }
}

/// DNS-1123 object name for a tenant's view of a host
pub fn resource_name(tenant_id: &str, hardware_uuid: &str) -> String {
    let name: String = format!("{tenant_id}-{hardware_uuid}")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    let name = if name.len() > 253 { &name[..253] } else { name };
    name.trim_end_matches('-').to_string()
}

/// `HostAttributes` object for one host of a tenant payload
pub fn host_attributes_object(namespace: &str, tenant_id: &str, host: &HostDelivery) -> Value {
    let report: Value = serde_json::from_str(&host.trust_report).unwrap_or(Value::Null);
    json!({
        "apiVersion": format!("{}/{}", CRD_GROUP, CRD_VERSION),
        "kind": CRD_KIND,
        "metadata": {
            "name": resource_name(tenant_id, &host.hardware_uuid),
            "namespace": namespace,
            "labels": {
                "attestation-hub.io/tenant": tenant_id,
                "attestation-hub.io/managed-by": FIELD_MANAGER
            }
        },
        "spec": {
            "hostName": host.host_name,
            "hardwareUuid": host.hardware_uuid,
            "trusted": report["trusted"],
            "validTo": report["valid_to"],
            "trustTags": report["asset_tags"],
            "trustReport": host.trust_report,
            "signedTrustReport": host.signed_trust_report
        }
    })
}

pub struct KubernetesPlugin {
    client: OnceCell<Client>,
}

impl KubernetesPlugin {
    /// Client is created on first push from kubeconfig or in-cluster config
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, PluginError> {
        self.client
            .get_or_try_init(|| async { Client::try_default().await })
            .await
            .map_err(PluginError::from)
    }
}

impl Default for KubernetesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryPlugin for KubernetesPlugin {
    fn kind(&self) -> &str {
        KIND
    }

    async fn push(&self, config: &PluginConfig, payload: &DeliveryPayload) -> Result<(), PluginError> {
        let namespace = config.get("kubernetes.namespace").unwrap_or(DEFAULT_NAMESPACE);
        let client = self.client().await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &host_attributes_resource());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let tenant_id = payload.tenant_id.to_string();

        let mut failures = Vec::new();
        for host in &payload.hosts {
            let name = resource_name(&tenant_id, &host.hardware_uuid);
            let object = host_attributes_object(namespace, &tenant_id, host);
            if let Err(e) = api.patch(&name, &params, &Patch::Apply(&object)).await {
                warn!(tenant = %tenant_id, resource = %name, error = %e, "Failed to apply HostAttributes");
                failures.push(format!("{name}: {e}"));
            }
        }

        if !failures.is_empty() {
            return Err(PluginError::Transport(format!(
                "{} of {} HostAttributes failed: {}",
                failures.len(),
                payload.hosts.len(),
                failures.join("; ")
            )));
        }

        info!(
            tenant = %tenant_id,
            namespace = %namespace,
            hosts = payload.hosts.len(),
            "Applied HostAttributes resources"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_is_dns_safe() {
        assert_eq!(
            resource_name("9b2f0c3e-1d4a-4c55-8e7f-0a1b2c3d4e5f", "8032632B-8FA4-E811-906E-00163566263E"),
            "9b2f0c3e-1d4a-4c55-8e7f-0a1b2c3d4e5f-8032632b-8fa4-e811-906e-00163566263e"
        );
        assert_eq!(resource_name("--Acme", "Host_01.rack--"), "acme-host-01-rack");
        assert!(resource_name("t", &"a".repeat(300)).len() <= 253);
    }

    #[test]
    fn test_tenants_in_one_namespace_get_distinct_names() {
        let acme = resource_name("tenant-acme", "HW-1");
        let globex = resource_name("tenant-globex", "HW-1");
        assert_ne!(acme, globex);
    }

    #[test]
    fn test_host_attributes_object() {
        let host = HostDelivery {
            host_id: "h-1".into(),
            hardware_uuid: "HW-1".into(),
            host_name: "compute-1".into(),
            trust_report: r#"{"hostname":"compute-1","trust":{"bios":true},"trusted":true,"valid_to":"2030-01-01T00:00:00Z","asset_tags":{"location":["us-west"]}}"#.into(),
            signed_trust_report: Some("hdr..sig".into()),
        };

        let object = host_attributes_object("trusted", "tenant-1", &host);

        assert_eq!(object["apiVersion"], "crd.attestation-hub.io/v1beta1");
        assert_eq!(object["metadata"]["name"], "tenant-1-hw-1");
        assert_eq!(object["metadata"]["namespace"], "trusted");
        assert_eq!(object["metadata"]["labels"]["attestation-hub.io/tenant"], "tenant-1");
        assert_eq!(object["spec"]["trusted"], true);
        assert_eq!(object["spec"]["trustTags"]["location"][0], "us-west");
        assert_eq!(object["spec"]["signedTrustReport"], "hdr..sig");

        let resource = host_attributes_resource();
        assert_eq!(resource.plural, CRD_PLURAL);
    }
}
