// src/config.rs
//
// Environment-derived configuration for the bridge. Tunables that are not
// deployment-specific live here as constants so the rest of the crate has a
// single place to look them up.

use std::env;
use std::time::Duration;

use crate::Error;

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Lifetime of a minted `/v1/ws-token`.
pub const WS_TOKEN_TTL: Duration = Duration::from_secs(60);

/// How long an upstream message id is remembered for dedupe.
pub const MESSAGE_DEDUPE_TTL: Duration = Duration::from_secs(600);

/// Upper bound on remembered message ids.
pub const MESSAGE_DEDUPE_CAPACITY: usize = 16_384;

/// Interests with no heartbeat for this long are pruned.
pub const INTEREST_STALE_TTL: Duration = Duration::from_secs(3600);

/// Cadence of the stale-interest pruner.
pub const STALE_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Per `(service, key, code)` suppression window for `subscription.error`.
pub const SUBSCRIPTION_ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// Cap for the upstream WS reconnect backoff.
pub const WS_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Keepalive deadline used until the welcome frame advertises one.
pub const WS_DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// General outbound HTTP timeout.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing webhook delivery timeout.
pub const WEBHOOK_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per upstream subscription create and per webhook delivery.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Per-connection fan-out outbox depth.
pub const FANOUT_QUEUE_DEPTH: usize = 256;

/// Outgoing webhook worker pool size.
pub const DELIVERY_WORKERS: usize = 32;

/// Pending webhook delivery jobs held before coalescing drops kick in.
pub const DELIVERY_QUEUE_DEPTH: usize = 4096;

/// Signature header attached to outgoing webhook deliveries.
pub const OUTGOING_SIGNATURE_HEADER: &str = "X-Switchboard-Signature";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub eventsub_ws_url: String,
    /// When set, webhook-capable event types use the webhook upstream.
    pub webhook_callback_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub service_signing_secret: String,
    pub database_url: String,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, Error> {
        let webhook_callback_url = optional("TWITCH_EVENTSUB_WEBHOOK_CALLBACK_URL");
        let webhook_secret = optional("TWITCH_EVENTSUB_WEBHOOK_SECRET");
        if webhook_callback_url.is_some() {
            match &webhook_secret {
                Some(secret) => validate_webhook_secret(secret)?,
                None => {
                    return Err(Error::Config(
                        "TWITCH_EVENTSUB_WEBHOOK_SECRET is required when \
                         TWITCH_EVENTSUB_WEBHOOK_CALLBACK_URL is set"
                            .into(),
                    ))
                }
            }
        }

        Ok(Self {
            twitch_client_id: required("TWITCH_CLIENT_ID")?,
            twitch_client_secret: required("TWITCH_CLIENT_SECRET")?,
            eventsub_ws_url: optional("TWITCH_EVENTSUB_WS_URL")
                .unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
            webhook_callback_url,
            webhook_secret,
            service_signing_secret: required("SERVICE_SIGNING_SECRET")?,
            database_url: required("DATABASE_URL")?,
        })
    }

    /// Webhook upstream is only usable when both callback and secret exist.
    pub fn webhook_upstream_configured(&self) -> bool {
        self.webhook_callback_url.is_some() && self.webhook_secret.is_some()
    }
}

fn required(name: &str) -> Result<String, Error> {
    match optional(name) {
        Some(v) => Ok(v),
        None => Err(Error::Config(format!("{name} must be set"))),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// Twitch requires the HMAC secret to be 10-100 ASCII characters.
fn validate_webhook_secret(secret: &str) -> Result<(), Error> {
    if secret.len() < 10 || secret.len() > 100 || !secret.is_ascii() {
        return Err(Error::Config(
            "TWITCH_EVENTSUB_WEBHOOK_SECRET must be 10-100 ASCII characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_secret_length_is_enforced() {
        assert!(validate_webhook_secret("short").is_err());
        assert!(validate_webhook_secret(&"x".repeat(101)).is_err());
        assert!(validate_webhook_secret("long-enough-secret").is_ok());
    }

    #[test]
    fn non_ascii_webhook_secret_is_rejected() {
        assert!(validate_webhook_secret("sécret-sécret").is_err());
    }
}
