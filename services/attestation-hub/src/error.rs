//! Error taxonomy for the attestation hub
//!
//! Each concern has its own enum so callers can decide how far a failure
//! travels: a verification error skips one host, a source error aborts the
//! cycle, a plugin error stays with one (tenant, plugin) pair.

use thiserror::Error;

/// Failures talking to the attestation authority
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection-level failure; the cycle is aborted
    #[error("Attestation source unavailable: {0}")]
    Unavailable(String),

    /// The authority answered but refused or failed the request
    #[error("Attestation source rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The authority answered with a body we could not decode
    #[error("Malformed attestation source response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Whether the failure means the authority cannot be reached at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SourceError::Unavailable(err.to_string())
        } else if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

/// Trust assertion verification failures; always scoped to one host
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Assertion signature is invalid: {0}")]
    BadSignature(String),

    #[error("Assertion issuer is not trusted: {0}")]
    UnknownIssuer(String),

    #[error("Assertion payload is malformed: {0}")]
    Malformed(String),

    #[error("Assertion subject {actual} does not match host {expected}")]
    SubjectMismatch { expected: String, actual: String },

    #[error("Verifier key could not be loaded: {0}")]
    Key(String),
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                VerificationError::BadSignature(err.to_string())
            }
            ErrorKind::InvalidIssuer => VerificationError::UnknownIssuer(err.to_string()),
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
                VerificationError::Key(err.to_string())
            }
            _ => VerificationError::Malformed(err.to_string()),
        }
    }
}

/// Registry transaction failures
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Stale write or invariant violation; the whole transaction is discarded
    #[error("Registry conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// Snapshot could not be read or written; fatal for the cycle
    #[error("Registry persistence failed: {0}")]
    Persistence(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

/// Delivery plugin failures; isolated to one (tenant, plugin) pair
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Unknown plugin provider: {0}")]
    UnknownProvider(String),

    #[error("Missing plugin property: {0}")]
    MissingProperty(String),

    #[error("Invalid plugin property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Plugin authentication failed: {0}")]
    Auth(String),

    #[error("Plugin transport error: {0}")]
    Transport(String),

    #[error("Plugin endpoint rejected push ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Plugin push timed out after {0}s")]
    Timeout(u64),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plugin serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        PluginError::Transport(err.to_string())
    }
}

/// Report signing failures; delivery falls back to unsigned reports
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Signing key not found: {0}")]
    KeyMissing(String),

    #[error("Signing key is unusable: {0}")]
    KeyInvalid(String),

    #[error("Signing failed: {0}")]
    Sign(String),

    #[error("Signature verification failed: {0}")]
    Verify(String),
}

/// Cursor persistence failures
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("Cursor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort a whole sync cycle; the cursor is left unchanged
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("Registry worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
