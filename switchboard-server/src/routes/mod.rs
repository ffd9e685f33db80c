// src/routes/mod.rs

pub mod interests;
pub mod tokens;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use switchboard_core::Error;

use crate::context::BridgeContext;

pub fn build_router(ctx: Arc<BridgeContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/interests", post(interests::create).get(interests::list))
        .route("/v1/interests/heartbeat", post(interests::heartbeat_all))
        .route("/v1/interests/:id", delete(interests::remove))
        .route("/v1/interests/:id/heartbeat", post(interests::heartbeat))
        .route("/v1/ws-token", post(tokens::create_ws_token))
        .route("/ws/events", get(ws::ws_events))
        .route("/webhooks/twitch/eventsub", post(webhook::twitch_eventsub))
        .with_state(ctx)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// Gateway translation of core errors onto HTTP statuses. The core raises
/// structured errors; only this layer knows about status codes.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownEventType(_)
            | Error::WebhookUrlRequired
            | Error::InvalidWebhookTarget(_)
            | Error::InvalidBroadcaster(_)
            | Error::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,

            Error::InvalidServiceCredentials
            | Error::InvalidToken
            | Error::ExpiredToken
            | Error::AlreadyUsed => StatusCode::UNAUTHORIZED,

            Error::NotFound(_) | Error::BotNotAccessible(_) => StatusCode::NOT_FOUND,

            Error::InvalidSignature | Error::StaleTimestamp => StatusCode::FORBIDDEN,

            Error::MissingScope(_)
            | Error::InsufficientPermissions(_)
            | Error::Unauthorized(_)
            | Error::SubscriptionCreateFailed(_)
            | Error::UnsupportedUpstream(_)
            | Error::RateLimited(_)
            | Error::Timeout(_)
            | Error::Network(_)
            | Error::Http(_) => StatusCode::BAD_GATEWAY,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}
