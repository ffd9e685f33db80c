// src/auth.rs
//
// Service authentication for the downstream API: X-Client-Id plus
// X-Client-Secret headers checked against the stored pbkdf2 hash.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::debug;

use switchboard_core::models::ServiceAccount;
use switchboard_core::secrets::verify_secret;
use switchboard_core::Error;

use crate::context::BridgeContext;
use crate::routes::ApiError;

pub struct AuthedService(pub ServiceAccount);

#[async_trait]
impl FromRequestParts<Arc<BridgeContext>> for AuthedService {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<BridgeContext>,
    ) -> Result<Self, Self::Rejection> {
        let client_id = header_value(parts, "x-client-id");
        let client_secret = header_value(parts, "x-client-secret");
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(ApiError(Error::InvalidServiceCredentials));
        }

        let service = ctx
            .services
            .get_by_client_id(&client_id)
            .await
            .map_err(ApiError)?
            .ok_or(ApiError(Error::InvalidServiceCredentials))?;
        if !service.enabled || !verify_secret(&client_secret, &service.client_secret_hash) {
            return Err(ApiError(Error::InvalidServiceCredentials));
        }

        if let Err(e) = ctx.stats.record_api_request(service.id).await {
            debug!("Skipping api-request stats update: {e}");
        }
        Ok(AuthedService(service))
    }
}

fn header_value(parts: &Parts, name: &str) -> String {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}
