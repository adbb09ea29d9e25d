//! Attestation Hub - Standalone Binary
//!
//! Runs the sync scheduler and the admin API in one process.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use attestation_hub::cursor::FileCursorStore;
use attestation_hub::model::SYSTEM_ACTOR;
use attestation_hub::plugins::{PluginRegistry, PluginSettings};
use attestation_hub::source::HttpAttestationSource;
use attestation_hub::verifier::JwsAssertionVerifier;
use attestation_hub::{api, DispatcherSettings, HubConfig, PluginDispatcher, Registry, SyncScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .json()
        .init();

    let config = HubConfig::parse();

    info!(
        authority = %config.attestation_service_url,
        interval_minutes = config.poll_interval_minutes,
        data_dir = %config.data_dir.display(),
        key_dir = %config.key_dir.display(),
        once = config.once,
        "Starting Attestation Hub"
    );

    let registry = Arc::new(
        Registry::open(config.registry_path())
            .with_context(|| format!("Failed to open registry at {}", config.registry_path().display()))?,
    );

    let mut verifier = JwsAssertionVerifier::from_pem_file(&config.assertion_public_key_path)
        .context("Failed to load assertion issuer key")?;
    if let Some(issuer) = &config.assertion_issuer {
        verifier = verifier.with_issuer(issuer.clone());
    }

    let source = HttpAttestationSource::new(
        config.attestation_service_url.clone(),
        config.attestation_service_user.clone(),
        config.attestation_service_password.clone(),
        config.request_timeout(),
    )
    .context("Failed to create attestation authority client")?;

    let plugins = PluginRegistry::with_builtins(&PluginSettings {
        output_dir: config.output_dir(),
        request_timeout: config.request_timeout(),
    })
    .context("Failed to initialize delivery plugins")?;
    info!(kinds = ?plugins.kinds(), "Delivery plugins registered");

    let dispatcher = Arc::new(PluginDispatcher::new(
        registry.clone(),
        Arc::new(plugins),
        DispatcherSettings {
            key_dir: Some(config.key_dir.clone()),
            push_timeout: config.push_timeout(),
            require_signed: config.require_signed_reports,
        },
    ));

    let scheduler = SyncScheduler::new(
        Arc::new(source),
        Arc::new(verifier),
        registry.clone(),
        Arc::new(FileCursorStore::new(config.cursor_path())),
        dispatcher,
    )
    .with_tag_marker(config.tag_marker.clone());

    if config.once {
        let report = scheduler.run_once().await.context("Sync cycle failed")?;
        info!(
            pulled = report.pulled,
            delivered = report.dispatch.delivered(),
            failed = report.dispatch.failed(),
            "Single cycle finished"
        );
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Admin API listening");

    let app = api::router(api::AppState::new(registry, SYSTEM_ACTOR));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Admin API stopped");
        }
    });

    scheduler
        .run(config.poll_interval(), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
