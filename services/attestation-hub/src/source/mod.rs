//! Attestation Source
//!
//! Boundary to the external attestation authority. The authority publishes
//! host descriptors and signed attestations; the hub pulls either everything
//! (first run) or the delta since the last successful cycle.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::SourceError;

pub use http::HttpAttestationSource;

/// Host as described by the attestation authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDescriptor {
    pub id: String,
    pub hardware_uuid: String,
    pub host_name: String,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub aik_certificate: Option<String>,
    #[serde(default)]
    pub aik_sha1: Option<String>,
    #[serde(default)]
    pub bios_mle_uuid: Option<String>,
}

/// One attestation of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub id: String,
    pub host_id: String,
    pub created: DateTime<Utc>,
    /// Host trust response document; opaque to the hub
    #[serde(default)]
    pub host_trust_response: Option<serde_json::Value>,
    /// Signed trust assertion blob
    #[serde(alias = "saml")]
    pub assertion: String,
}

/// A host descriptor joined with its most recent attestation
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub host: HostDescriptor,
    pub attestation: Attestation,
}

/// Client contract of the attestation authority
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// Every host known to the authority
    async fn fetch_all_hosts(&self) -> Result<Vec<HostDescriptor>, SourceError>;

    /// A single host descriptor
    async fn fetch_host(&self, id: &str) -> Result<HostDescriptor, SourceError>;

    /// Most recent attestation of one host, if it has any
    async fn fetch_latest_attestation(&self, host_id: &str) -> Result<Option<Attestation>, SourceError>;

    /// Attestations created at or after `since`
    async fn fetch_attestations(&self, since: DateTime<Utc>) -> Result<Vec<Attestation>, SourceError>;
}

/// Pull mode chosen from the persisted cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    Full,
    Incremental(DateTime<Utc>),
}

impl PullMode {
    pub fn from_cursor(cursor: Option<DateTime<Utc>>) -> Self {
        match cursor {
            Some(since) => PullMode::Incremental(since),
            None => PullMode::Full,
        }
    }
}

/// Pull the records a cycle must reconcile.
///
/// Only an unavailable authority fails the pull. Hosts that cannot be
/// resolved individually are logged and left for a later cycle.
pub async fn pull(
    source: &dyn AttestationSource,
    mode: PullMode,
) -> Result<Vec<SourceRecord>, SourceError> {
    let records = match mode {
        PullMode::Full => pull_full(source).await?,
        PullMode::Incremental(since) => pull_delta(source, since).await?,
    };

    info!(
        mode = ?mode,
        count = records.len(),
        "Pulled attestation records"
    );

    Ok(records)
}

async fn pull_full(source: &dyn AttestationSource) -> Result<Vec<SourceRecord>, SourceError> {
    let hosts = source.fetch_all_hosts().await?;

    let mut records = Vec::with_capacity(hosts.len());
    for host in hosts {
        match source.fetch_latest_attestation(&host.id).await {
            Ok(Some(attestation)) if attestation.host_id == host.id => {
                records.push(SourceRecord { host, attestation });
            }
            Ok(Some(attestation)) => {
                warn!(
                    host_id = %host.id,
                    attested_host = %attestation.host_id,
                    "Attestation belongs to another host, skipping"
                );
            }
            Ok(None) => debug!(host_id = %host.id, "Host has no attestation yet"),
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "Failed to fetch host attestation, skipping");
            }
        }
    }

    sort_by_created(&mut records);
    Ok(records)
}

async fn pull_delta(
    source: &dyn AttestationSource,
    since: DateTime<Utc>,
) -> Result<Vec<SourceRecord>, SourceError> {
    let attestations = latest_per_host(source.fetch_attestations(since).await?);

    let mut records = Vec::with_capacity(attestations.len());
    for (host_id, attestation) in attestations {
        match source.fetch_host(&host_id).await {
            Ok(host) => records.push(SourceRecord { host, attestation }),
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                warn!(host_id = %host_id, error = %e, "Failed to resolve host, skipping");
            }
        }
    }

    sort_by_created(&mut records);
    Ok(records)
}

/// Keep only the newest attestation per host id
fn latest_per_host(attestations: Vec<Attestation>) -> BTreeMap<String, Attestation> {
    let mut latest: BTreeMap<String, Attestation> = BTreeMap::new();
    for attestation in attestations {
        match latest.get(&attestation.host_id) {
            Some(existing) if existing.created >= attestation.created => {}
            _ => {
                latest.insert(attestation.host_id.clone(), attestation);
            }
        }
    }
    latest
}

fn sort_by_created(records: &mut [SourceRecord]) {
    records.sort_by(|a, b| {
        a.attestation
            .created
            .cmp(&b.attestation.created)
            .then_with(|| a.host.id.cmp(&b.host.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    struct ScriptedSource {
        hosts: Vec<HostDescriptor>,
        attestations: Vec<Attestation>,
        missing_host: Option<String>,
        unavailable_host: Option<String>,
        rejected_attestation: Option<String>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AttestationSource for ScriptedSource {
        async fn fetch_all_hosts(&self) -> Result<Vec<HostDescriptor>, SourceError> {
            self.requests.lock().unwrap().push("hosts".into());
            Ok(self.hosts.clone())
        }

        async fn fetch_host(&self, id: &str) -> Result<HostDescriptor, SourceError> {
            self.requests.lock().unwrap().push(format!("host:{id}"));
            if self.unavailable_host.as_deref() == Some(id) {
                return Err(SourceError::Unavailable("connection refused".into()));
            }
            if self.missing_host.as_deref() == Some(id) {
                return Err(SourceError::Rejected {
                    status: 404,
                    message: "not found".into(),
                });
            }
            self.hosts
                .iter()
                .find(|h| h.id == id)
                .cloned()
                .ok_or_else(|| SourceError::Malformed(id.to_string()))
        }

        async fn fetch_latest_attestation(&self, host_id: &str) -> Result<Option<Attestation>, SourceError> {
            self.requests.lock().unwrap().push(format!("latest:{host_id}"));
            if self.unavailable_host.as_deref() == Some(host_id) {
                return Err(SourceError::Unavailable("connection refused".into()));
            }
            if self.rejected_attestation.as_deref() == Some(host_id) {
                return Err(SourceError::Rejected {
                    status: 500,
                    message: "attestation query failed".into(),
                });
            }
            Ok(self
                .attestations
                .iter()
                .filter(|a| a.host_id == host_id)
                .max_by_key(|a| a.created)
                .cloned())
        }

        async fn fetch_attestations(&self, since: DateTime<Utc>) -> Result<Vec<Attestation>, SourceError> {
            self.requests.lock().unwrap().push("attestations".into());
            Ok(self
                .attestations
                .iter()
                .filter(|a| a.created >= since)
                .cloned()
                .collect())
        }
    }

    fn host(id: &str) -> HostDescriptor {
        HostDescriptor {
            id: id.to_string(),
            hardware_uuid: format!("hw-{id}"),
            host_name: format!("{id}.example.com"),
            connection_string: None,
            aik_certificate: None,
            aik_sha1: None,
            bios_mle_uuid: None,
        }
    }

    fn attestation(id: &str, host_id: &str, created: DateTime<Utc>) -> Attestation {
        Attestation {
            id: id.to_string(),
            host_id: host_id.to_string(),
            created,
            host_trust_response: None,
            assertion: format!("assertion-{id}"),
        }
    }

    fn source(hosts: Vec<HostDescriptor>, attestations: Vec<Attestation>) -> ScriptedSource {
        ScriptedSource {
            hosts,
            attestations,
            missing_host: None,
            unavailable_host: None,
            rejected_attestation: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_pull_mode_from_cursor() {
        assert_eq!(PullMode::from_cursor(None), PullMode::Full);
        let now = Utc::now();
        assert_eq!(PullMode::from_cursor(Some(now)), PullMode::Incremental(now));
    }

    #[tokio::test]
    async fn test_full_pull_joins_latest_attestation_per_host() {
        let t0 = Utc::now() - Duration::hours(2);
        let src = source(
            vec![host("a"), host("b"), host("c")],
            vec![
                attestation("1", "a", t0),
                attestation("2", "a", t0 + Duration::minutes(5)),
                attestation("3", "b", t0 + Duration::minutes(1)),
                attestation("4", "ghost", t0),
            ],
        );

        let records = pull(&src, PullMode::Full).await.unwrap();

        let pairs: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.host.id.as_str(), r.attestation.id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("b", "3"), ("a", "2")]);
        assert_eq!(
            *src.requests.lock().unwrap(),
            vec!["hosts", "latest:a", "latest:b", "latest:c"]
        );
    }

    #[tokio::test]
    async fn test_full_pull_skips_host_whose_attestation_query_is_rejected() {
        let t0 = Utc::now() - Duration::hours(1);
        let mut src = source(
            vec![host("a"), host("b"), host("c")],
            vec![
                attestation("1", "a", t0),
                attestation("2", "b", t0 + Duration::minutes(1)),
                attestation("3", "c", t0 + Duration::minutes(2)),
            ],
        );
        src.rejected_attestation = Some("b".into());

        let records = pull(&src, PullMode::Full).await.unwrap();

        let hosts: Vec<&str> = records.iter().map(|r| r.host.id.as_str()).collect();
        assert_eq!(hosts, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_full_pull_aborts_when_authority_unreachable() {
        let t0 = Utc::now();
        let mut src = source(
            vec![host("a"), host("b")],
            vec![attestation("1", "a", t0), attestation("2", "b", t0)],
        );
        src.unavailable_host = Some("a".into());

        let err = pull(&src, PullMode::Full).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!src.requests.lock().unwrap().contains(&"latest:b".to_string()));
    }

    #[tokio::test]
    async fn test_delta_pull_resolves_hosts_and_skips_missing() {
        let t0 = Utc::now() - Duration::minutes(30);
        let mut src = source(
            vec![host("a"), host("b")],
            vec![
                attestation("1", "a", t0 - Duration::minutes(10)),
                attestation("2", "a", t0 + Duration::minutes(1)),
                attestation("3", "b", t0 + Duration::minutes(2)),
            ],
        );
        src.missing_host = Some("b".into());

        let records = pull(&src, PullMode::Incremental(t0)).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attestation.id, "2");
        let requests = src.requests.lock().unwrap();
        assert!(requests.contains(&"host:a".to_string()));
        assert!(!requests.contains(&"hosts".to_string()));
    }

    #[tokio::test]
    async fn test_delta_pull_aborts_when_authority_unreachable() {
        let t0 = Utc::now() - Duration::minutes(30);
        let mut src = source(vec![host("a")], vec![attestation("1", "a", t0)]);
        src.unavailable_host = Some("a".into());

        let err = pull(&src, PullMode::Incremental(t0)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_attestation_accepts_saml_field_name() {
        let json = serde_json::json!({
            "id": "att-1",
            "hostId": "h-1",
            "created": "2024-05-01T10:00:00Z",
            "saml": "<assertion/>"
        });
        let parsed: Attestation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.assertion, "<assertion/>");
        assert!(parsed.host_trust_response.is_none());
    }
}
