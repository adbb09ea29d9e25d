//! Local file delivery
//!
//! Writes each tenant payload to `<dir>/<tenant id>_<plugin name>.json`.
//! Useful for air-gapped tenants that sync the directory themselves.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use super::{DeliveryPayload, DeliveryPlugin};
use crate::error::PluginError;
use crate::fsutil::write_atomic;
use crate::model::PluginConfig;

pub const KIND: &str = "local-file";

/// Property overriding the output directory
pub const DIRECTORY_PROPERTY: &str = "file.directory";

pub struct LocalFilePlugin {
    default_dir: PathBuf,
}

impl LocalFilePlugin {
    pub fn new(default_dir: PathBuf) -> Self {
        Self { default_dir }
    }

    pub fn target_path(&self, config: &PluginConfig, payload: &DeliveryPayload) -> PathBuf {
        let dir = config
            .get(DIRECTORY_PROPERTY)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_dir.clone());
        let name: String = config
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{}_{}.json", payload.tenant_id, name))
    }
}

#[async_trait]
impl DeliveryPlugin for LocalFilePlugin {
    fn kind(&self) -> &str {
        KIND
    }

    async fn push(&self, config: &PluginConfig, payload: &DeliveryPayload) -> Result<(), PluginError> {
        let path = self.target_path(config, payload);
        let bytes = serde_json::to_vec_pretty(payload)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| PluginError::Transport(format!("file writer task failed: {e}")))??;

        info!(
            tenant = %payload.tenant_id,
            path = %path.display(),
            hosts = payload.hosts.len(),
            "Wrote trust reports to file"
        );
        Ok(())
    }
}
