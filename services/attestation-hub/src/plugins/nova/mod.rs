//! OpenStack Nova delivery
//!
//! Authenticates against Keystone, then posts the tenant payload to the
//! compute API's `os-hypervisors` resource with the issued token.

pub mod keystone;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use super::{required, required_url, DeliveryPayload, DeliveryPlugin};
use crate::error::PluginError;
use crate::model::PluginConfig;

pub use keystone::{KeystoneCredentials, KeystoneSession, KeystoneVersion};

pub const KIND: &str = "nova";

const AUTH_TOKEN_HEADER: &str = "x-auth-token";
const HYPERVISORS_RESOURCE: &str = "os-hypervisors";

/// Validated Nova plugin properties
#[derive(Debug, Clone)]
pub struct NovaSettings {
    pub api_endpoint: reqwest::Url,
    pub auth_endpoint: reqwest::Url,
    pub version: KeystoneVersion,
    pub credentials: KeystoneCredentials,
}

impl NovaSettings {
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginError> {
        let api_endpoint = required_url(config, "api.endpoint")?;
        let auth_endpoint = required_url(config, "auth.endpoint")?;
        let version: KeystoneVersion = required(config, "auth.version")?.parse()?;
        let credentials = KeystoneCredentials {
            username: required(config, "user.name")?.to_string(),
            password: required(config, "user.password")?.to_string(),
            project: required(config, "tenant.name")?.to_string(),
            domain: config.get("domain.name").map(str::to_string),
        };
        if version == KeystoneVersion::V3 && credentials.domain.is_none() {
            return Err(PluginError::MissingProperty("domain.name".to_string()));
        }

        Ok(Self {
            api_endpoint,
            auth_endpoint,
            version,
            credentials,
        })
    }

    /// Push URL: the configured API host plus the catalog endpoint's path
    pub fn push_url(&self, session: &KeystoneSession) -> Result<String, PluginError> {
        let catalog = reqwest::Url::parse(&session.compute_endpoint).map_err(|e| {
            PluginError::Auth(format!("bad compute endpoint '{}': {e}", session.compute_endpoint))
        })?;
        Ok(format!(
            "{}{}/{}",
            self.api_endpoint.as_str().trim_end_matches('/'),
            catalog.path().trim_end_matches('/'),
            HYPERVISORS_RESOURCE
        ))
    }
}

pub struct NovaPlugin {
    client: Client,
}

impl NovaPlugin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryPlugin for NovaPlugin {
    fn kind(&self) -> &str {
        KIND
    }

    async fn push(&self, config: &PluginConfig, payload: &DeliveryPayload) -> Result<(), PluginError> {
        let settings = NovaSettings::from_config(config)?;

        let session = keystone::authenticate(
            &self.client,
            settings.version,
            settings.auth_endpoint.as_str(),
            &settings.credentials,
        )
        .await?;
        let url = settings.push_url(&session)?;

        let response = self
            .client
            .post(&url)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            tenant = %payload.tenant_id,
            plugin = %config.name,
            hosts = payload.hosts.len(),
            "Pushed trust reports to Nova"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::HostDelivery;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Received {
        pushes: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        base: Arc<Mutex<String>>,
    }

    async fn keystone_v3(State(state): State<Received>, Json(body): Json<Value>) -> impl IntoResponse {
        let user = body["auth"]["identity"]["password"]["user"]["name"].as_str();
        if user != Some("hub") {
            return (StatusCode::UNAUTHORIZED, HeaderMap::new(), Json(json!({}))).into_response();
        }
        let base = state.base.lock().unwrap().clone();
        let mut headers = HeaderMap::new();
        headers.insert("x-subject-token", "tok-123".parse().unwrap());
        (
            StatusCode::CREATED,
            headers,
            Json(json!({
                "token": {
                    "catalog": [{
                        "type": "compute",
                        "endpoints": [{ "interface": "public", "url": format!("{base}/v2.1/proj") }]
                    }]
                }
            })),
        )
            .into_response()
    }

    async fn hypervisors(
        State(state): State<Received>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let token = headers
            .get("x-auth-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        state.pushes.lock().unwrap().push((token, body));
        StatusCode::OK
    }

    async fn fake_openstack() -> (String, Received) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Received::default();
        *state.base.lock().unwrap() = base.clone();

        let router = Router::new()
            .route("/v3/auth/tokens", post(keystone_v3))
            .route("/v2.1/proj/os-hypervisors", post(hypervisors))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (base, state)
    }

    fn config(base: &str, user: &str) -> PluginConfig {
        PluginConfig::new("acme-nova")
            .property("plugin.provider", "nova")
            .property("api.endpoint", base)
            .property("auth.endpoint", base)
            .property("auth.version", "v3")
            .property("user.name", user)
            .property("user.password", "s3cret")
            .property("tenant.name", "acme")
            .property("domain.name", "Default")
    }

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            tenant_id: Uuid::new_v4(),
            hosts: vec![HostDelivery {
                host_id: "h-1".into(),
                hardware_uuid: "HW-1".into(),
                host_name: "compute-1".into(),
                trust_report: "{}".into(),
                signed_trust_report: None,
            }],
        }
    }

    fn plugin() -> NovaPlugin {
        NovaPlugin::new(Client::builder().timeout(Duration::from_secs(5)).build().unwrap())
    }

    #[test]
    fn test_settings_validation() {
        let mut cfg = config("https://nova.example.com", "hub");
        assert!(NovaSettings::from_config(&cfg).is_ok());

        cfg.properties.retain(|p| p.key != "domain.name");
        assert!(matches!(
            NovaSettings::from_config(&cfg),
            Err(PluginError::MissingProperty(key)) if key == "domain.name"
        ));

        // first non-blank value wins
        let duplicated = config("https://nova.example.com", "hub").property("auth.version", "v2");
        assert_eq!(NovaSettings::from_config(&duplicated).unwrap().version, KeystoneVersion::V3);
    }

    #[test]
    fn test_push_url_uses_catalog_path() {
        let settings = NovaSettings::from_config(&config("https://nova.example.com/", "hub")).unwrap();
        let session = KeystoneSession {
            token: "t".into(),
            compute_endpoint: "http://10.0.0.5:8774/v2.1/abc/".into(),
        };
        assert_eq!(
            settings.push_url(&session).unwrap(),
            "https://nova.example.com/v2.1/abc/os-hypervisors"
        );
    }

    #[tokio::test]
    async fn test_push_authenticates_then_posts() {
        let (base, state) = fake_openstack().await;
        let payload = payload();

        plugin().push(&config(&base, "hub"), &payload).await.unwrap();

        let pushes = state.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.as_deref(), Some("tok-123"));
        assert_eq!(pushes[0].1["tenant_id"], payload.tenant_id.to_string());
        assert_eq!(pushes[0].1["hosts"][0]["hardware_uuid"], "HW-1");
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_before_push() {
        let (base, state) = fake_openstack().await;

        let err = plugin().push(&config(&base, "intruder"), &payload()).await.unwrap_err();

        assert!(matches!(err, PluginError::Auth(_)));
        assert!(state.pushes.lock().unwrap().is_empty());
    }
}
