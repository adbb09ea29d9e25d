//! Mesos delivery
//!
//! Posts the tenant payload to the attestation endpoint of a Mesos
//! framework, optionally with HTTP basic auth.

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use super::{required_url, DeliveryPayload, DeliveryPlugin};
use crate::error::PluginError;
use crate::model::PluginConfig;

pub const KIND: &str = "mesos";

pub struct MesosPlugin {
    client: Client,
}

impl MesosPlugin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryPlugin for MesosPlugin {
    fn kind(&self) -> &str {
        KIND
    }

    async fn push(&self, config: &PluginConfig, payload: &DeliveryPayload) -> Result<(), PluginError> {
        let url = required_url(config, "api.endpoint")?;

        let mut request = self.client.post(url.clone()).json(payload);
        match (config.get("user.name"), config.get("user.password")) {
            (Some(user), password) => request = request.basic_auth(user, password),
            (None, Some(_)) => return Err(PluginError::MissingProperty("user.name".to_string())),
            (None, None) => {}
        }

        let response = request.send().await?;
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
            endpoint = %url,
            hosts = payload.hosts.len(),
            "Pushed trust reports to Mesos"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    async fn serve() -> String {
        let router = Router::new().route(
            "/hub/reports",
            post(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Basic bWVzb3M6cHc=") => StatusCode::ACCEPTED,
                    _ => StatusCode::FORBIDDEN,
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/hub/reports")
    }

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            tenant_id: Uuid::new_v4(),
            hosts: vec![],
        }
    }

    fn plugin() -> MesosPlugin {
        MesosPlugin::new(Client::builder().timeout(Duration::from_secs(5)).build().unwrap())
    }

    #[tokio::test]
    async fn test_push_with_basic_auth() {
        let url = serve().await;
        let config = PluginConfig::new("mesos")
            .property("api.endpoint", &url)
            .property("user.name", "mesos")
            .property("user.password", "pw");

        plugin().push(&config, &payload()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let url = serve().await;
        let config = PluginConfig::new("mesos").property("api.endpoint", &url);

        match plugin().push(&config, &payload()).await {
            Err(PluginError::Rejected { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_password_without_user_is_invalid() {
        let config = PluginConfig::new("mesos")
            .property("api.endpoint", "http://127.0.0.1:9/")
            .property("user.password", "pw");

        assert!(matches!(
            plugin().push(&config, &payload()).await,
            Err(PluginError::MissingProperty(_))
        ));
    }
}
