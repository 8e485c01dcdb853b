use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppJson, JSend};
use crate::events::DeliveryMode;
use crate::lifecycle::SweepReport;
use crate::object_store::keys;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub event_delivery: String,
    pub background_queue_depth: usize,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub owner_id: String,
    pub used_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct AssignPlanRequest {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct AssignPlanResponse {
    pub owner_id: String,
    pub plan: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    let event_delivery = match state.events.mode() {
        DeliveryMode::Durable => "durable",
        DeliveryMode::Fallback => "fallback",
    };
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.config.node.id.clone(),
        event_delivery: event_delivery.to_string(),
        background_queue_depth: state.queue.depth(),
    })
}

pub async fn reconcile_owner(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Result<Json<JSend<ReconcileResponse>>, ApiError> {
    let used_bytes = state.orchestrator.reconcile(&owner_id).await?;
    tracing::info!(owner_id = %owner_id, used_bytes, "Quota reconciled on request");
    Ok(JSend::success(ReconcileResponse {
        owner_id,
        used_bytes,
    }))
}

pub async fn assign_plan(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    AppJson(req): AppJson<AssignPlanRequest>,
) -> Result<Json<JSend<AssignPlanResponse>>, ApiError> {
    if !keys::is_valid_owner_id(&owner_id) {
        return Err(ApiError::bad_request("Invalid owner id"));
    }
    let plan = state.plans.assign(&owner_id, &req.plan)?;
    Ok(JSend::success(AssignPlanResponse {
        owner_id,
        plan: plan.name.clone(),
    }))
}

pub async fn run_sweep(State(state): State<Arc<AppState>>) -> Json<JSend<SweepReport>> {
    let report = state.lifecycle.sweep(Utc::now()).await;
    tracing::warn!(
        cold = report.cold,
        archived = report.archived,
        purged = report.purged,
        "Lifecycle sweep run on request"
    );
    JSend::success(report)
}
