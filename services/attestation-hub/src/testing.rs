//! Shared fixtures for unit tests

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

pub const AUTHORITY_PRIVATE_KEY: &str = include_str!("../tests/fixtures/authority_private_key.pem");
pub const AUTHORITY_PUBLIC_KEY: &str = include_str!("../tests/fixtures/authority_public_key.pem");
pub const HUB_PRIVATE_KEY: &str = include_str!("../tests/fixtures/hub_private_key.pem");
pub const HUB_PUBLIC_KEY: &str = include_str!("../tests/fixtures/hub_public_key.pem");

pub const AUTHORITY_ISSUER: &str = "attestation-authority";

/// Claims of an assertion for `host_id` tagged `location=us-west`
pub fn assertion_claims(
    host_id: &str,
    issued_at: DateTime<Utc>,
    not_after: DateTime<Utc>,
    trust: &[(&str, bool)],
) -> Value {
    let trust: serde_json::Map<String, Value> = trust
        .iter()
        .map(|(domain, ok)| (domain.to_string(), Value::Bool(*ok)))
        .collect();
    json!({
        "iss": AUTHORITY_ISSUER,
        "sub": host_id,
        "iat": issued_at.timestamp(),
        "exp": not_after.timestamp(),
        "trust": trust,
        "attributes": [
            { "name": "TAG[location]", "values": ["us-west"] },
            { "name": "hostName", "values": [host_id] }
        ]
    })
}

/// Sign claims as the attestation authority
pub fn sign_assertion(claims: &Value) -> String {
    let key = EncodingKey::from_rsa_pem(AUTHORITY_PRIVATE_KEY.as_bytes()).unwrap();
    encode(&Header::new(Algorithm::RS256), claims, &key).unwrap()
}

/// Active host record with no trust data
pub fn host(id: &str, hardware_id: &str) -> crate::model::Host {
    use crate::model::{Audit, Host, RecordState, TrustState, SYSTEM_ACTOR};
    Host {
        id: id.to_string(),
        hardware_id: hardware_id.to_string(),
        name: format!("{id}.example.com"),
        connection_url: None,
        aik_certificate: None,
        aik_sha1: None,
        bios_mle_uuid: None,
        trust: TrustState::default(),
        tags: Default::default(),
        trust_response: None,
        assertion: None,
        state: RecordState::Active,
        audit: Audit::new(SYSTEM_ACTOR, Utc::now()),
        version: 0,
    }
}
