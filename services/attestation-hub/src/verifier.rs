//! Trust Assertion Verifier
//!
//! Verifies the signed trust assertions published by the attestation
//! authority and extracts trust booleans, the validity window and tag
//! attributes. Expiry is not enforced here: an authentic but expired
//! assertion verifies, and the sweeper retires the host.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::VerificationError;
use crate::model::{TagMap, TrustDomains};

/// Default prefix of tag attributes, e.g. `TAG[location]`
pub const DEFAULT_TAG_MARKER: &str = "TAG";

/// Named attribute carried by an assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionAttribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedAssertion {
    /// Host id the assertion was issued for, when stated
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub trust: TrustDomains,
    pub trusted: bool,
    pub issued_at: DateTime<Utc>,
    /// notOnOrAfter of the assertion
    pub not_after: DateTime<Utc>,
    pub attributes: Vec<AssertionAttribute>,
}

impl VerifiedAssertion {
    /// Tag map built from attributes named `<marker>[<tag>]`
    pub fn tags(&self, marker: &str) -> TagMap {
        parse_tag_attributes(&self.attributes, marker)
    }

    /// Whether the validity window has closed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Reject an assertion issued for a different host
    pub fn ensure_subject(&self, host_id: &str) -> Result<(), VerificationError> {
        match &self.subject {
            Some(subject) if subject != host_id => Err(VerificationError::SubjectMismatch {
                expected: host_id.to_string(),
                actual: subject.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Verifies authority-signed assertions
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, assertion: &str) -> Result<VerifiedAssertion, VerificationError>;
}

/// Build a tag map from assertion attributes.
///
/// `TAG[env]` with values `["prod"]` becomes `env -> ["prod"]`. Attributes
/// without the marker, without a bracketed name, or without any non-blank
/// value are ignored.
pub fn parse_tag_attributes(attributes: &[AssertionAttribute], marker: &str) -> TagMap {
    let mut tags = TagMap::new();

    for attribute in attributes {
        let Some(rest) = attribute.name.strip_prefix(marker) else {
            continue;
        };
        let Some(name) = rest
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .map(str::trim)
        else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let values: Vec<String> = attribute
            .values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if values.is_empty() {
            continue;
        }

        let entry = tags.entry(name.to_string()).or_default();
        for value in values {
            if !entry.contains(&value) {
                entry.push(value);
            }
        }
    }

    tags
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    iat: i64,
    exp: i64,
    #[serde(default)]
    trust: TrustDomains,
    #[serde(default)]
    trusted: Option<bool>,
    #[serde(default)]
    attributes: Vec<AssertionAttribute>,
}

/// Compact JWS assertions signed by the authority's key
pub struct JwsAssertionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwsAssertionVerifier {
    /// RSA public key in PEM form (RS256/RS384/RS512)
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, VerificationError> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        Ok(Self::with_algorithms(
            key,
            vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
        ))
    }

    /// EC public key in PEM form (ES256/ES384)
    pub fn from_ec_pem(pem: &[u8]) -> Result<Self, VerificationError> {
        let key = DecodingKey::from_ec_pem(pem)?;
        Ok(Self::with_algorithms(
            key,
            vec![Algorithm::ES256, Algorithm::ES384],
        ))
    }

    /// Load a PEM public key, RSA first then EC
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, VerificationError> {
        let path = path.as_ref();
        let pem = std::fs::read(path)
            .map_err(|e| VerificationError::Key(format!("{}: {e}", path.display())))?;
        Self::from_rsa_pem(&pem).or_else(|_| Self::from_ec_pem(&pem))
    }

    /// Only accept assertions from `issuer`
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        self.validation.set_issuer(&[issuer]);
        self
    }

    fn with_algorithms(key: DecodingKey, algorithms: Vec<Algorithm>) -> Self {
        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp"]);
        Self { key, validation }
    }
}

impl AssertionVerifier for JwsAssertionVerifier {
    fn verify(&self, assertion: &str) -> Result<VerifiedAssertion, VerificationError> {
        let data = decode::<AssertionClaims>(assertion.trim(), &self.key, &self.validation)?;
        let claims = data.claims;

        let issued_at = DateTime::from_timestamp(claims.iat, 0)
            .ok_or_else(|| VerificationError::Malformed(format!("iat out of range: {}", claims.iat)))?;
        let not_after = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| VerificationError::Malformed(format!("exp out of range: {}", claims.exp)))?;
        if not_after < issued_at {
            return Err(VerificationError::Malformed(
                "assertion expires before it was issued".to_string(),
            ));
        }

        let trusted = claims
            .trusted
            .unwrap_or_else(|| !claims.trust.is_empty() && claims.trust.values().all(|v| *v));

        Ok(VerifiedAssertion {
            subject: claims.sub,
            issuer: claims.iss,
            trust: claims.trust,
            trusted,
            issued_at,
            not_after,
            attributes: claims.attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, AUTHORITY_PUBLIC_KEY, HUB_PUBLIC_KEY};
    use chrono::Duration;

    fn attribute(name: &str, values: &[&str]) -> AssertionAttribute {
        AssertionAttribute {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_tag_attributes() {
        let attributes = vec![
            attribute("TAG[location]", &["us-west", " "]),
            attribute("TAG[location]", &["us-east", "us-west"]),
            attribute("TAG[ ]", &["ignored"]),
            attribute("TAG[empty]", &[""]),
            attribute("TAGlocation", &["no brackets"]),
            attribute("biosTrusted", &["true"]),
            attribute("TAG[tier]", &["gold"]),
        ];

        let tags = parse_tag_attributes(&attributes, DEFAULT_TAG_MARKER);

        assert_eq!(tags.len(), 2);
        assert_eq!(tags["location"], vec!["us-west", "us-east"]);
        assert_eq!(tags["tier"], vec!["gold"]);
    }

    #[test]
    fn test_parse_tag_attributes_custom_marker() {
        let attributes = vec![attribute("ASSET[rack]", &["r12"]), attribute("TAG[rack]", &["r1"])];
        let tags = parse_tag_attributes(&attributes, "ASSET");
        assert_eq!(tags["rack"], vec!["r12"]);
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn test_verify_extracts_trust_state() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes()).unwrap();
        let issued = Utc::now() - Duration::minutes(1);
        let token = testing::sign_assertion(&testing::assertion_claims(
            "h-1",
            issued,
            issued + Duration::hours(24),
            &[("bios", true), ("vmm", false)],
        ));

        let verified = verifier.verify(&token).unwrap();

        assert_eq!(verified.subject.as_deref(), Some("h-1"));
        assert_eq!(verified.trust["bios"], true);
        assert_eq!(verified.trust["vmm"], false);
        assert!(!verified.trusted);
        assert_eq!(verified.issued_at.timestamp(), issued.timestamp());
        assert_eq!(verified.tags(DEFAULT_TAG_MARKER)["location"], vec!["us-west"]);
    }

    #[test]
    fn test_expired_assertion_still_verifies() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes()).unwrap();
        let issued = Utc::now() - Duration::days(2);
        let token = testing::sign_assertion(&testing::assertion_claims(
            "h-1",
            issued,
            issued + Duration::days(1),
            &[("bios", true)],
        ));

        let verified = verifier.verify(&token).unwrap();
        assert!(verified.trusted);
        assert!(verified.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_wrong_key_is_bad_signature() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(HUB_PUBLIC_KEY.as_bytes()).unwrap();
        let now = Utc::now();
        let token = testing::sign_assertion(&testing::assertion_claims(
            "h-1",
            now,
            now + Duration::hours(1),
            &[("bios", true)],
        ));

        assert!(matches!(
            verifier.verify(&token),
            Err(VerificationError::BadSignature(_))
        ));
    }

    #[test]
    fn test_issuer_pinning() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes())
            .unwrap()
            .with_issuer("someone-else");
        let now = Utc::now();
        let token = testing::sign_assertion(&testing::assertion_claims(
            "h-1",
            now,
            now + Duration::hours(1),
            &[("bios", true)],
        ));

        assert!(matches!(
            verifier.verify(&token),
            Err(VerificationError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes()).unwrap();
        assert!(matches!(
            verifier.verify("<saml:Assertion/>"),
            Err(VerificationError::Malformed(_))
        ));
    }

    #[test]
    fn test_subject_binding() {
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes()).unwrap();
        let now = Utc::now();
        let token = testing::sign_assertion(&testing::assertion_claims(
            "h-1",
            now,
            now + Duration::hours(1),
            &[("bios", true)],
        ));
        let verified = verifier.verify(&token).unwrap();

        assert!(verified.ensure_subject("h-1").is_ok());
        assert!(matches!(
            verified.ensure_subject("h-2"),
            Err(VerificationError::SubjectMismatch { .. })
        ));
    }
}
