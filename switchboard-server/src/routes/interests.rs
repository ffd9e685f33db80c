// src/routes/interests.rs

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use switchboard_core::models::{CreateInterestRequest, InterestResponse};

use crate::auth::AuthedService;
use crate::context::BridgeContext;
use crate::routes::ApiError;

pub async fn create(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
    Json(req): Json<CreateInterestRequest>,
) -> Result<Json<InterestResponse>, ApiError> {
    let outcome = ctx.interests.upsert(service.id, &req).await?;
    if !outcome.created {
        // Idempotent repeat: the existing row is the answer.
        return Ok(Json(InterestResponse::from(&outcome.interest)));
    }

    let primary_key = outcome.interest.key();
    for key in &outcome.ensure_keys {
        match ctx.manager.ensure(key).await {
            Ok(()) => {}
            Err(err) if *key == primary_key => {
                // The caller's own subscription failed; surface it. The
                // interest stays registered so a later ensure can recover.
                return Err(ApiError(err));
            }
            Err(err) => {
                warn!(key = %key, "Companion interest ensure failed: {err}");
            }
        }
    }
    Ok(Json(InterestResponse::from(&outcome.interest)))
}

pub async fn list(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
) -> Result<Json<Vec<InterestResponse>>, ApiError> {
    let rows = ctx.interests.list_for_service(service.id).await?;
    Ok(Json(rows.iter().map(InterestResponse::from).collect()))
}

pub async fn remove(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
    Path(interest_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let (key, still_used) = ctx.interests.delete(service.id, interest_id).await?;
    if !still_used {
        if let Err(e) = ctx.manager.release(&key).await {
            warn!(key = %key, "Release after delete failed: {e}");
        }
    }
    Ok(Json(json!({ "deleted": true, "last_for_key": !still_used })))
}

pub async fn heartbeat(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
    Path(interest_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let touched = ctx.interests.heartbeat(service.id, interest_id).await?;
    Ok(Json(json!({ "ok": true, "touched": touched })))
}

pub async fn heartbeat_all(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
) -> Result<Json<Value>, ApiError> {
    let touched = ctx.interests.heartbeat_all(service.id).await?;
    Ok(Json(json!({ "ok": true, "touched": touched })))
}
