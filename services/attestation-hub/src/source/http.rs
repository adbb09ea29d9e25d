//! HTTP client for the attestation authority REST API

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{Attestation, AttestationSource, HostDescriptor};
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
struct HostCollection {
    #[serde(default)]
    hosts: Vec<HostDescriptor>,
}

#[derive(Debug, Deserialize)]
struct AttestationCollection {
    #[serde(default, alias = "hostAttestations", alias = "host_attestations")]
    attestations: Vec<Attestation>,
}

/// Attestation authority reached over HTTPS with basic auth
pub struct HttpAttestationSource {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpAttestationSource {
    /// Create a client for the authority at `base_url`
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Querying attestation authority");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AttestationSource for HttpAttestationSource {
    async fn fetch_all_hosts(&self) -> Result<Vec<HostDescriptor>, SourceError> {
        let collection: HostCollection = self.get_json("/hosts", &[]).await?;
        Ok(collection.hosts)
    }

    async fn fetch_host(&self, id: &str) -> Result<HostDescriptor, SourceError> {
        let path = format!("/hosts/{}", urlencoding::encode(id));
        self.get_json(&path, &[]).await
    }

    async fn fetch_latest_attestation(&self, host_id: &str) -> Result<Option<Attestation>, SourceError> {
        let query = [("hostId", host_id.to_string()), ("limit", "1".to_string())];
        let collection: AttestationCollection = self.get_json("/host-attestations", &query).await?;
        Ok(collection.attestations.into_iter().max_by_key(|a| a.created))
    }

    async fn fetch_attestations(&self, since: DateTime<Utc>) -> Result<Vec<Attestation>, SourceError> {
        let query = [("fromDate", since.to_rfc3339_opts(SecondsFormat::Millis, true))];
        let collection: AttestationCollection = self.get_json("/host-attestations", &query).await?;
        Ok(collection.attestations)
    }
}
