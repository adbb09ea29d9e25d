//! Hub configuration from CLI flags and environment

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cursor::CURSOR_FILE;
use crate::verifier::DEFAULT_TAG_MARKER;

/// File holding the registry snapshot inside the data directory
pub const REGISTRY_FILE: &str = "registry.json";

/// Attestation Hub - syncs host trust from the attestation authority to tenant orchestrators
#[derive(Parser, Debug, Clone)]
#[command(name = "attestation-hub", version, about)]
pub struct HubConfig {
    /// Base URL of the attestation authority API
    #[arg(long, env = "ATTESTATION_SERVICE_URL")]
    pub attestation_service_url: String,

    #[arg(long, env = "ATTESTATION_SERVICE_USER")]
    pub attestation_service_user: String,

    #[arg(long, env = "ATTESTATION_SERVICE_PASSWORD", hide_env_values = true)]
    pub attestation_service_password: String,

    /// PEM public key (RSA or EC) of the assertion issuer
    #[arg(long, env = "ASSERTION_PUBLIC_KEY_PATH")]
    pub assertion_public_key_path: PathBuf,

    /// Expected `iss` of trust assertions; unchecked when unset
    #[arg(long, env = "ASSERTION_ISSUER")]
    pub assertion_issuer: Option<String>,

    /// Minutes between sync cycles
    #[arg(long, env = "HUB_POLL_INTERVAL_MINUTES", default_value = "2")]
    pub poll_interval_minutes: u64,

    /// Directory holding hub_private_key.pem / hub_public_key.pem
    #[arg(long, env = "HUB_KEY_DIR", default_value = "/etc/attestation-hub/keys")]
    pub key_dir: PathBuf,

    /// Directory for the registry snapshot, cursor and local-file deliveries
    #[arg(long, env = "HUB_DATA_DIR", default_value = "/var/lib/attestation-hub")]
    pub data_dir: PathBuf,

    /// Attribute prefix marking asset tags in assertions
    #[arg(long, env = "HUB_TAG_MARKER", default_value = DEFAULT_TAG_MARKER)]
    pub tag_marker: String,

    /// Upper bound for one plugin push
    #[arg(long, env = "HUB_PUSH_TIMEOUT_SECS", default_value = "60")]
    pub push_timeout_secs: u64,

    /// Timeout of a single request to the authority or a plugin endpoint
    #[arg(long, env = "HUB_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Admin API listen address
    #[arg(long, env = "HUB_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Run one cycle and exit (for CronJob mode)
    #[arg(long, default_value = "false")]
    pub once: bool,

    /// Withhold delivery when no hub signing key is available
    #[arg(long, env = "HUB_REQUIRE_SIGNED_REPORTS", default_value = "false")]
    pub require_signed_reports: bool,
}

impl HubConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes.max(1).saturating_mul(60))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join(CURSOR_FILE)
    }

    /// Default output directory of the local-file plugin
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("deliveries")
    }
}
