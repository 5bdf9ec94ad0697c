use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::config::DestinationConfig;
use crate::destination::Destination;
use crate::engine::Engine;
use crate::errors::AppError;
use crate::leads::{prepare_work_items, LeadRecord, SkippedLead};
use crate::models::EnrichedCampaign;
use crate::reporter::BatchOutcome;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Settings of the configured push destination.
    pub destination: DestinationConfig,
    /// Client for the destination. `None` when it could not be built, in
    /// which case dispatch requests report the configuration error.
    pub destination_client: Option<Arc<dyn Destination>>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub leads: Vec<LeadRecord>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub batch: BatchOutcome,
    pub skipped: Vec<SkippedLead>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshParams {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct CampaignListResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<EnrichedCampaign>,
}

/// Routes under `/api/v1`. Health is mounted separately so it can bypass rate limiting.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/dispatch", post(dispatch_leads))
        .route("/api/v1/campaigns", get(list_campaigns))
        .route("/api/v1/campaigns/:id", get(get_campaign))
        .route("/api/v1/cache/invalidate", post(invalidate_cache))
}

/// Full router without transport-level layers.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-lead-dispatch",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/dispatch
///
/// Validates and de-duplicates the submitted leads, then pushes them to the
/// configured destination. Partial failures are a 200 with per-item detail;
/// a batch where every lead failed is a 502.
pub async fn dispatch_leads(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, AppError> {
    tracing::info!("POST /dispatch - {} leads", request.leads.len());

    let prepared = prepare_work_items(request.leads);
    if prepared.items.is_empty() && !prepared.skipped.is_empty() {
        return Err(AppError::BadRequest(format!(
            "none of the {} submitted leads has a valid email",
            prepared.skipped.len()
        )));
    }

    let batch = match &state.destination_client {
        Some(client) => {
            state
                .engine
                .dispatch_batch_to(prepared.items, &state.destination, client.clone())
                .await?
        }
        None => {
            state
                .engine
                .dispatch_batch(prepared.items, &state.destination)
                .await?
        }
    };

    Ok(Json(DispatchResponse {
        success: true,
        batch,
        skipped: prepared.skipped,
    }))
}

/// GET /api/v1/campaigns?refresh=bool
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<CampaignListResponse>, AppError> {
    tracing::info!("GET /campaigns - refresh: {}", params.refresh);

    let campaigns = state.engine.get_enriched_entities(params.refresh).await?;

    Ok(Json(CampaignListResponse {
        success: true,
        count: campaigns.len(),
        data: campaigns,
    }))
}

/// GET /api/v1/campaigns/:id?refresh=bool
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<EnrichedCampaign>, AppError> {
    tracing::info!("GET /campaigns/{} - refresh: {}", id, params.refresh);

    state
        .engine
        .get_enriched_entity_by_id(&id, params.refresh)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))
}

/// POST /api/v1/cache/invalidate
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.engine.invalidate_cache().await;
    tracing::info!("Cache invalidated on request");

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Cache invalidated"
        })),
    )
}
