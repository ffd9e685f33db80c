// src/routes/webhook.rs
//
// Upstream Twitch delivery endpoint. The raw body is required verbatim for
// HMAC verification, so this handler reads bytes before any JSON parsing.
// The IP allowlist never applies here; Twitch's callers are verified by
// signature instead.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, warn};

use switchboard_core::dedupe::Freshness;
use switchboard_core::ingress::{
    verify_delivery, SignedDelivery, HEADER_MESSAGE_ID, HEADER_MESSAGE_SIGNATURE,
    HEADER_MESSAGE_TIMESTAMP, HEADER_MESSAGE_TYPE,
};
use switchboard_core::Error;

use crate::context::BridgeContext;
use crate::routes::ApiError;

pub async fn twitch_eventsub(
    State(ctx): State<Arc<BridgeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(secret) = ctx.config.webhook_secret.as_deref() else {
        // Without a shared secret nothing can be verified.
        return Err(ApiError(Error::InvalidSignature));
    };

    let message_id = header(&headers, HEADER_MESSAGE_ID);
    let timestamp = header(&headers, HEADER_MESSAGE_TIMESTAMP);
    let signature = header(&headers, HEADER_MESSAGE_SIGNATURE);
    let message_type = header(&headers, HEADER_MESSAGE_TYPE).to_lowercase();

    let delivery = SignedDelivery {
        message_id: &message_id,
        timestamp: &timestamp,
        signature: &signature,
    };
    verify_delivery(secret, &delivery, &body).map_err(|err| {
        warn!(message_id = %message_id, "Rejected Twitch webhook delivery: {err}");
        ApiError(err)
    })?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| ApiError(Error::Json(e)))?;

    if ctx.manager.message_dedupe.observe(&message_id) == Freshness::Duplicate {
        debug!(message_id = %message_id, "Duplicate Twitch webhook delivery");
        // Verification retries still need their challenge answered.
        if message_type == "webhook_callback_verification" {
            return Ok(challenge_response(&payload));
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    match message_type.as_str() {
        "webhook_callback_verification" => Ok(challenge_response(&payload)),
        "notification" => {
            let manager = ctx.manager.clone();
            // Ack fast; fan-out happens off the request path.
            tokio::spawn(async move {
                manager.route(&payload, &message_id).await;
            });
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        "revocation" => {
            let manager = ctx.manager.clone();
            tokio::spawn(async move {
                manager.handle_revocation(&payload).await;
            });
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

fn challenge_response(payload: &Value) -> Response {
    let challenge = payload
        .get("challenge")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (StatusCode::OK, challenge).into_response()
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
