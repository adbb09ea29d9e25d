//! Trust Report Composer and Signer
//!
//! Builds the per-host trust report handed to tenants and signs it with the
//! hub's private key. The signature is a detached JWS over the exact bytes of
//! the serialized report: `<header>..<signature>`, base64url encoded.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::SigningError;
use crate::model::{Host, TagMap, TrustDomains};

/// Well-known private key file inside the key directory
pub const HUB_PRIVATE_KEY_FILE: &str = "hub_private_key.pem";

/// Well-known public key file inside the key directory
pub const HUB_PUBLIC_KEY_FILE: &str = "hub_public_key.pem";

const SIGNING_ALGORITHM: Algorithm = Algorithm::RS256;

/// Trust report document delivered to tenants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustReport {
    pub hostname: String,
    pub trust: TrustDomains,
    pub trusted: bool,
    pub valid_to: Option<DateTime<Utc>>,
    pub asset_tags: TagMap,
}

impl From<&Host> for TrustReport {
    fn from(host: &Host) -> Self {
        Self {
            hostname: host.name.clone(),
            trust: host.trust.domains.clone(),
            trusted: host.trust.trusted,
            valid_to: host.trust.valid_to,
            asset_tags: host.tags.clone(),
        }
    }
}

/// A composed report ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedReport {
    pub host_id: String,
    pub hardware_id: String,
    pub host_name: String,
    pub trust_report: TrustReport,
    /// Exact serialized bytes covered by the signature
    pub trust_report_json: String,
    pub signed_trust_report: Option<String>,
}

/// RS256 signer holding the hub private key
pub struct ReportSigner {
    key: EncodingKey,
}

impl ReportSigner {
    pub fn from_pem(pem: &[u8]) -> Result<Self, SigningError> {
        let key = EncodingKey::from_rsa_pem(pem).map_err(|e| SigningError::KeyInvalid(e.to_string()))?;
        Ok(Self { key })
    }

    /// Load `hub_private_key.pem` from `key_dir`
    pub fn load(key_dir: &Path) -> Result<Self, SigningError> {
        Self::from_pem(&read_key(key_dir, HUB_PRIVATE_KEY_FILE)?)
    }

    /// Fail unless signatures from this key verify under `public`
    pub fn check_pair(&self, public: &DecodingKey) -> Result<(), SigningError> {
        let sample = b"attestation-hub key pair check";
        let signature = self.sign_detached(sample)?;
        check_detached(public, sample, &signature)
            .map_err(|e| SigningError::KeyInvalid(format!("private and public key do not match: {e}")))
    }

    /// Detached compact JWS over `payload`
    pub fn sign_detached(&self, payload: &[u8]) -> Result<String, SigningError> {
        let header = serde_json::to_vec(&Header::new(SIGNING_ALGORITHM))
            .map_err(|e| SigningError::Sign(e.to_string()))?;
        let header = URL_SAFE_NO_PAD.encode(header);
        let message = format!("{header}.{}", URL_SAFE_NO_PAD.encode(payload));
        let signature = crypto::sign(message.as_bytes(), &self.key, SIGNING_ALGORITHM)
            .map_err(|e| SigningError::Sign(e.to_string()))?;
        Ok(format!("{header}..{signature}"))
    }
}

fn read_key(key_dir: &Path, file: &str) -> Result<Vec<u8>, SigningError> {
    let path = key_dir.join(file);
    std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SigningError::KeyMissing(path.display().to_string()),
        _ => SigningError::KeyInvalid(format!("{}: {e}", path.display())),
    })
}

/// Load `hub_public_key.pem` from `key_dir`
pub fn load_verifying_key(key_dir: &Path) -> Result<DecodingKey, SigningError> {
    DecodingKey::from_rsa_pem(&read_key(key_dir, HUB_PUBLIC_KEY_FILE)?)
        .map_err(|e| SigningError::KeyInvalid(e.to_string()))
}

/// Check a detached signature against the delivered report bytes and parse
/// the report
pub fn verify_detached(
    key: &DecodingKey,
    trust_report_json: &str,
    detached: &str,
) -> Result<TrustReport, SigningError> {
    check_detached(key, trust_report_json.as_bytes(), detached)?;
    serde_json::from_str(trust_report_json).map_err(|e| SigningError::Verify(format!("report: {e}")))
}

fn check_detached(key: &DecodingKey, payload: &[u8], detached: &str) -> Result<(), SigningError> {
    let mut parts = detached.split('.');
    let (Some(header), Some(""), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(SigningError::Verify("not a detached compact JWS".into()));
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| SigningError::Verify(format!("header encoding: {e}")))?;
    let parsed: Header = serde_json::from_slice(&header_bytes)
        .map_err(|e| SigningError::Verify(format!("header: {e}")))?;
    if parsed.alg != SIGNING_ALGORITHM {
        return Err(SigningError::Verify(format!("unexpected algorithm {:?}", parsed.alg)));
    }

    let message = format!("{header}.{}", URL_SAFE_NO_PAD.encode(payload));
    let valid = crypto::verify(signature, message.as_bytes(), key, SIGNING_ALGORITHM)
        .map_err(|e| SigningError::Verify(e.to_string()))?;
    if !valid {
        return Err(SigningError::Verify("signature mismatch".into()));
    }
    Ok(())
}

/// Composes and, when a key is available, signs trust reports
pub struct TrustReportComposer {
    signer: Option<ReportSigner>,
}

impl TrustReportComposer {
    pub fn new(signer: Option<ReportSigner>) -> Self {
        Self { signer }
    }

    /// Composer for the key directory; a missing or bad key yields unsigned
    /// reports. When `hub_public_key.pem` is present the private key must
    /// match it.
    pub fn from_key_dir(key_dir: &Path) -> Self {
        let signer = ReportSigner::load(key_dir).and_then(|signer| match load_verifying_key(key_dir) {
            Ok(public) => signer.check_pair(&public).map(|_| signer),
            Err(SigningError::KeyMissing(path)) => {
                debug!(path = %path, "No hub public key to check the signing key against");
                Ok(signer)
            }
            Err(e) => Err(e),
        });
        match signer {
            Ok(signer) => Self::new(Some(signer)),
            Err(e) => {
                warn!(error = %e, "Hub signing key unavailable, trust reports will be unsigned");
                Self::new(None)
            }
        }
    }

    pub fn is_signing(&self) -> bool {
        self.signer.is_some()
    }

    pub fn compose(&self, host: &Host) -> Result<ComposedReport, serde_json::Error> {
        let trust_report = TrustReport::from(host);
        let trust_report_json = serde_json::to_string(&trust_report)?;

        let signed_trust_report = self.signer.as_ref().and_then(|signer| {
            match signer.sign_detached(trust_report_json.as_bytes()) {
                Ok(signature) => Some(signature),
                Err(e) => {
                    warn!(host_id = %host.id, error = %e, "Failed to sign trust report, sending unsigned");
                    None
                }
            }
        });

        debug!(host_id = %host.id, signed = signed_trust_report.is_some(), "Composed trust report");

        Ok(ComposedReport {
            host_id: host.id.clone(),
            hardware_id: host.hardware_id.clone(),
            host_name: host.name.clone(),
            trust_report,
            trust_report_json,
            signed_trust_report,
        })
    }
}
