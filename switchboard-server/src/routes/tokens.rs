// src/routes/tokens.rs

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::AuthedService;
use crate::context::BridgeContext;
use crate::routes::ApiError;

pub async fn create_ws_token(
    State(ctx): State<Arc<BridgeContext>>,
    AuthedService(service): AuthedService,
) -> Result<Json<Value>, ApiError> {
    let (token, expires_in) = ctx.ws_tokens.mint(service.id);
    // "ws_token" is the legacy field name older clients read.
    Ok(Json(json!({
        "token": token,
        "ws_token": token,
        "expires_in": expires_in,
    })))
}
