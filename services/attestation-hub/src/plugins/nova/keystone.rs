//! Keystone token handshake (identity API v2.0 and v3)

use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::PluginError;

const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const COMPUTE_SERVICE: &str = "compute";

/// Identity API generation selected by `auth.version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoneVersion {
    V2,
    V3,
}

impl FromStr for KeystoneVersion {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "v2" | "v2.0" | "2" => Ok(KeystoneVersion::V2),
            "v3" | "3" => Ok(KeystoneVersion::V3),
            other => Err(PluginError::InvalidProperty {
                key: "auth.version".to_string(),
                reason: format!("unsupported identity version '{other}'"),
            }),
        }
    }
}

impl fmt::Display for KeystoneVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeystoneVersion::V2 => write!(f, "v2.0"),
            KeystoneVersion::V3 => write!(f, "v3"),
        }
    }
}

/// Password credentials scoped to a project
#[derive(Clone)]
pub struct KeystoneCredentials {
    pub username: String,
    pub password: String,
    pub project: String,
    pub domain: Option<String>,
}

impl fmt::Debug for KeystoneCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoneCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project", &self.project)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Token plus the compute endpoint advertised in the service catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoneSession {
    pub token: String,
    pub compute_endpoint: String,
}

impl KeystoneVersion {
    /// Token endpoint under `auth_endpoint`, tolerating a versioned base
    pub fn token_url(&self, auth_endpoint: &str) -> String {
        let base = auth_endpoint.trim_end_matches('/');
        match self {
            KeystoneVersion::V2 => {
                let base = base.strip_suffix("/v2.0").unwrap_or(base);
                format!("{base}/v2.0/tokens")
            }
            KeystoneVersion::V3 => {
                let base = base.strip_suffix("/v3").unwrap_or(base);
                format!("{base}/v3/auth/tokens")
            }
        }
    }

    pub fn request_body(&self, credentials: &KeystoneCredentials) -> Result<Value, PluginError> {
        match self {
            KeystoneVersion::V2 => Ok(json!({
                "auth": {
                    "tenantName": credentials.project,
                    "passwordCredentials": {
                        "username": credentials.username,
                        "password": credentials.password
                    }
                }
            })),
            KeystoneVersion::V3 => {
                let domain = credentials
                    .domain
                    .as_deref()
                    .ok_or_else(|| PluginError::MissingProperty("domain.name".to_string()))?;
                Ok(json!({
                    "auth": {
                        "identity": {
                            "methods": ["password"],
                            "password": {
                                "user": {
                                    "name": credentials.username,
                                    "domain": { "name": domain },
                                    "password": credentials.password
                                }
                            }
                        },
                        "scope": {
                            "project": {
                                "name": credentials.project,
                                "domain": { "name": domain }
                            }
                        }
                    }
                }))
            }
        }
    }

    /// Extract the token and compute endpoint from a token response
    pub fn parse_session(&self, headers: &HeaderMap, body: &Value) -> Result<KeystoneSession, PluginError> {
        match self {
            KeystoneVersion::V2 => {
                let token = body["access"]["token"]["id"]
                    .as_str()
                    .ok_or_else(|| PluginError::Auth("token id missing from v2.0 response".into()))?;
                let compute_endpoint = find_compute(&body["access"]["serviceCatalog"])
                    .and_then(|service| service["endpoints"].as_array()?.first()?["publicURL"].as_str())
                    .ok_or_else(|| PluginError::Auth("no compute endpoint in v2.0 catalog".into()))?;
                Ok(KeystoneSession {
                    token: token.to_string(),
                    compute_endpoint: compute_endpoint.to_string(),
                })
            }
            KeystoneVersion::V3 => {
                let token = headers
                    .get(SUBJECT_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| PluginError::Auth(format!("{SUBJECT_TOKEN_HEADER} header missing")))?;
                let endpoints = find_compute(&body["token"]["catalog"])
                    .and_then(|service| service["endpoints"].as_array())
                    .ok_or_else(|| PluginError::Auth("no compute service in v3 catalog".into()))?;
                let endpoint = endpoints
                    .iter()
                    .find(|e| e["interface"].as_str() == Some("public"))
                    .or_else(|| endpoints.first())
                    .and_then(|e| e["url"].as_str())
                    .ok_or_else(|| PluginError::Auth("compute service has no endpoints".into()))?;
                Ok(KeystoneSession {
                    token: token.to_string(),
                    compute_endpoint: endpoint.to_string(),
                })
            }
        }
    }
}

fn find_compute(catalog: &Value) -> Option<&Value> {
    catalog
        .as_array()?
        .iter()
        .find(|service| service["type"].as_str() == Some(COMPUTE_SERVICE))
}

/// Obtain a scoped token from Keystone
pub async fn authenticate(
    client: &Client,
    version: KeystoneVersion,
    auth_endpoint: &str,
    credentials: &KeystoneCredentials,
) -> Result<KeystoneSession, PluginError> {
    let url = version.token_url(auth_endpoint);
    let body = version.request_body(credentials)?;
    debug!(url = %url, version = %version, user = %credentials.username, "Requesting Keystone token");

    let response = client.post(&url).json(&body).send().await?;
    let status = response.status();
    if !(status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED) {
        let text = response.text().await.unwrap_or_default();
        return Err(PluginError::Auth(format!("Keystone returned {status}: {text}")));
    }

    let headers = response.headers().clone();
    let body: Value = response
        .json()
        .await
        .map_err(|e| PluginError::Auth(format!("unreadable Keystone response: {e}")))?;
    version.parse_session(&headers, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn credentials(domain: Option<&str>) -> KeystoneCredentials {
        KeystoneCredentials {
            username: "hub".into(),
            password: "s3cret".into(),
            project: "acme".into(),
            domain: domain.map(str::to_string),
        }
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("V2".parse::<KeystoneVersion>().unwrap(), KeystoneVersion::V2);
        assert_eq!("v2.0".parse::<KeystoneVersion>().unwrap(), KeystoneVersion::V2);
        assert_eq!(" v3 ".parse::<KeystoneVersion>().unwrap(), KeystoneVersion::V3);
        assert!("v4".parse::<KeystoneVersion>().is_err());
    }

    #[test]
    fn test_token_urls() {
        assert_eq!(
            KeystoneVersion::V2.token_url("http://keystone:5000/"),
            "http://keystone:5000/v2.0/tokens"
        );
        assert_eq!(
            KeystoneVersion::V3.token_url("http://keystone:5000/v3"),
            "http://keystone:5000/v3/auth/tokens"
        );
    }

    #[test]
    fn test_v2_body_and_session() {
        let body = KeystoneVersion::V2.request_body(&credentials(None)).unwrap();
        assert_eq!(body["auth"]["tenantName"], "acme");
        assert_eq!(body["auth"]["passwordCredentials"]["username"], "hub");

        let response = json!({
            "access": {
                "token": { "id": "tok-v2" },
                "serviceCatalog": [
                    { "type": "identity", "endpoints": [{ "publicURL": "http://keystone:5000" }] },
                    { "type": "compute", "endpoints": [{ "publicURL": "http://nova:8774/v2/abc" }] }
                ]
            }
        });
        let session = KeystoneVersion::V2
            .parse_session(&HeaderMap::new(), &response)
            .unwrap();
        assert_eq!(session.token, "tok-v2");
        assert_eq!(session.compute_endpoint, "http://nova:8774/v2/abc");
    }

    #[test]
    fn test_v3_requires_domain() {
        assert!(matches!(
            KeystoneVersion::V3.request_body(&credentials(None)),
            Err(PluginError::MissingProperty(_))
        ));
        let body = KeystoneVersion::V3.request_body(&credentials(Some("Default"))).unwrap();
        assert_eq!(body["auth"]["identity"]["methods"][0], "password");
        assert_eq!(body["auth"]["scope"]["project"]["domain"]["name"], "Default");
    }

    #[test]
    fn test_v3_session_prefers_public_interface() {
        let mut headers = HeaderMap::new();
        headers.insert(SUBJECT_TOKEN_HEADER, HeaderValue::from_static("tok-v3"));
        let response = json!({
            "token": {
                "catalog": [{
                    "type": "compute",
                    "endpoints": [
                        { "interface": "internal", "url": "http://10.0.0.5:8774/v2.1" },
                        { "interface": "public", "url": "https://nova.example.com/v2.1" }
                    ]
                }]
            }
        });

        let session = KeystoneVersion::V3.parse_session(&headers, &response).unwrap();
        assert_eq!(session.token, "tok-v3");
        assert_eq!(session.compute_endpoint, "https://nova.example.com/v2.1");

        assert!(matches!(
            KeystoneVersion::V3.parse_session(&HeaderMap::new(), &response),
            Err(PluginError::Auth(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", credentials(None));
        assert!(!rendered.contains("s3cret"));
    }
}
