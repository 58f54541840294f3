use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::health::{HealthChecker, SharedStoreStatus};
use crate::key_generator::IdentityCandidates;
use crate::rate_limit_config::Outcome;
use crate::response::AdmissionResult;
use crate::throttler::{AdmissionGateway, AdmissionRequest};
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Everything the handlers need, built once at startup.
pub struct AppState {
    pub gateway: AdmissionGateway,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(gateway: AdmissionGateway, health: HealthChecker) -> SharedState {
        Arc::new(Self { gateway, health })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRequest {
    #[serde(flatten)]
    pub identity: IdentityCandidates,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Decide admission for one request under `label`
pub async fn check_admission(
    State(state): State<SharedState>,
    Path(label): Path<String>,
    Json(identity): Json<IdentityCandidates>,
) -> Result<AdmissionResult> {
    RequestValidator::validate_label(&label)?;
    RequestValidator::validate_identity(&identity)?;

    state
        .gateway
        .handle(&AdmissionRequest::new(label, identity))
        .await
}

/// Report the outcome of an admitted operation
pub async fn record_outcome(
    State(state): State<SharedState>,
    Path(label): Path<String>,
    Json(payload): Json<OutcomeRequest>,
) -> Result<StatusCode> {
    RequestValidator::validate_label(&label)?;
    RequestValidator::validate_identity(&payload.identity)?;

    state
        .gateway
        .record_outcome(&AdmissionRequest::new(label, payload.identity), payload.outcome)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reset one identity's counter under `label`
pub async fn reset_counter(
    State(state): State<SharedState>,
    Path((label, identity)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    RequestValidator::validate_label(&label)?;
    RequestValidator::validate_identity_key(&identity)?;

    state.gateway.reset(&label, &identity).await?;

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "Counter reset".to_string(),
        policy: Some(label),
        identity: Some(identity),
    }))
}

/// Reset every counter in both stores
pub async fn reset_all(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    state.gateway.reset_all().await?;
    state.gateway.metrics().reset().await;

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "All counters reset".to_string(),
        policy: None,
        identity: None,
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health())
}

/// Readiness check endpoint. The service can always decide, so it is ready
/// even while the shared store is down.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let shared_store = state.health.shared_store_status().await;

    let body = match shared_store {
        SharedStoreStatus::Unavailable => serde_json::json!({
            "status": "ready",
            "sharedStore": shared_store,
            "note": "Enforcing with process-local counters"
        }),
        SharedStoreStatus::Connected => serde_json::json!({
            "status": "ready",
            "sharedStore": shared_store
        }),
        SharedStoreStatus::Disabled => serde_json::json!({
            "status": "ready",
            "sharedStore": shared_store,
            "note": "Running in local-only mode"
        }),
    };
    (StatusCode::OK, Json(body))
}

/// Per-policy decision counters
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.gateway.metrics().report().await)
}
