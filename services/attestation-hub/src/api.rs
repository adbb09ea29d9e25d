//! Admin API
//!
//! HTTP binding for tenant lifecycle and host mapping calls. Shares the
//! registry with the sync scheduler.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{TagMap, Tenant};
use crate::reconcile::{MappingMode, MappingRef, MappingResult, NewTenant, TenantAdmin, TenantMappingReconciler};
use crate::registry::{Registry, RegistryView};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    tenants: Arc<TenantAdmin>,
    mappings: Arc<TenantMappingReconciler>,
}

impl AppState {
    /// State whose writes are audited as `actor`
    pub fn new(registry: Arc<Registry>, actor: &str) -> Self {
        Self {
            tenants: Arc::new(TenantAdmin::new(registry.clone(), actor)),
            mappings: Arc::new(TenantMappingReconciler::new(registry.clone(), actor)),
            registry,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/hosts", get(list_hosts))
        .route("/v1/tenants", post(create_tenant))
        .route("/v1/tenants/:id", delete(delete_tenant))
        .route("/v1/mappings", post(create_mappings).put(update_mappings))
        .route("/v1/mappings/:id", delete(delete_mapping))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Registry failure rendered as a JSON error response
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::TenantNotFound(_) | RegistryError::MappingNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict { .. } => StatusCode::CONFLICT,
            RegistryError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Admin request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Run a registry write off the runtime threads; commits fsync the snapshot
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RegistryError::Persistence(format!("registry worker failed: {e}")))?
        .map_err(ApiError::from)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "attestation-hub",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostSummary {
    pub id: String,
    pub hardware_id: String,
    pub name: String,
    pub trusted: bool,
    pub valid_to: Option<DateTime<Utc>>,
    pub tags: TagMap,
}

async fn list_hosts(State(state): State<AppState>) -> Json<Vec<HostSummary>> {
    let hosts = state.registry.read(|t| t.active_hosts());
    Json(
        hosts
            .into_iter()
            .map(|h| HostSummary {
                id: h.id,
                hardware_id: h.hardware_id,
                name: h.name,
                trusted: h.trust.trusted,
                valid_to: h.trust.valid_to,
                tags: h.tags,
            })
            .collect(),
    )
}

/// Tenant as returned to callers; plugin properties may hold credentials
/// and are never echoed back
#[derive(Debug, Serialize, Deserialize)]
pub struct TenantSummary {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub plugins: Vec<PluginSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PluginSummary {
    pub name: String,
    pub provider: String,
}

impl From<&Tenant> for TenantSummary {
    fn from(t: &Tenant) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            active: t.is_active(),
            plugins: t
                .plugins
                .iter()
                .map(|p| PluginSummary {
                    name: p.name.clone(),
                    provider: p.provider().to_string(),
                })
                .collect(),
        }
    }
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(request): Json<NewTenant>,
) -> Result<(StatusCode, Json<TenantSummary>), ApiError> {
    let tenants = state.tenants.clone();
    let tenant = blocking(move || tenants.create_tenant(request)).await?;
    Ok((StatusCode::CREATED, Json(TenantSummary::from(&tenant))))
}

async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantSummary>, ApiError> {
    let tenants = state.tenants.clone();
    let tenant = blocking(move || tenants.delete_tenant(id)).await?;
    Ok(Json(TenantSummary::from(&tenant)))
}

#[derive(Debug, Deserialize)]
pub struct MappingRequest {
    pub tenant_id: Uuid,
    pub host_ids: Vec<String>,
}

async fn create_mappings(
    State(state): State<AppState>,
    Json(request): Json<MappingRequest>,
) -> Result<Json<MappingResult>, ApiError> {
    map_hosts(&state, request, MappingMode::Create).await
}

async fn update_mappings(
    State(state): State<AppState>,
    Json(request): Json<MappingRequest>,
) -> Result<Json<MappingResult>, ApiError> {
    map_hosts(&state, request, MappingMode::Update).await
}

async fn map_hosts(
    state: &AppState,
    request: MappingRequest,
    mode: MappingMode,
) -> Result<Json<MappingResult>, ApiError> {
    if request.host_ids.iter().all(|id| id.trim().is_empty()) && mode == MappingMode::Create {
        return Err(RegistryError::Invalid("at least one host id is required".into()).into());
    }
    let mappings = state.mappings.clone();
    let result =
        blocking(move || mappings.create_or_update(request.tenant_id, &request.host_ids, mode)).await?;
    Ok(Json(result))
}

async fn delete_mapping(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MappingRef>, ApiError> {
    let mappings = state.mappings.clone();
    Ok(Json(blocking(move || mappings.delete_mapping(id)).await?))
}
