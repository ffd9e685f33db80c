// src/models.rs
//
// Domain rows shared across the registry, manager and repositories. These
// mirror the persisted tables; the repositories do the column mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// The fan-in dimension: every downstream interest sharing this key shares
/// one upstream Twitch subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterestKey {
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
}

impl std::fmt::Display for InterestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.bot_account_id, self.event_type, self.broadcaster_user_id
        )
    }
}

/// How the bridge hands matched envelopes to a downstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRoute {
    Ws,
    Webhook { url: String },
}

impl DeliveryRoute {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryRoute::Ws => "websocket",
            DeliveryRoute::Webhook { .. } => "webhook",
        }
    }

    pub fn webhook_url(&self) -> Option<&str> {
        match self {
            DeliveryRoute::Ws => None,
            DeliveryRoute::Webhook { url } => Some(url),
        }
    }

    /// Rebuild from the `transport` / `webhook_url` column pair.
    pub fn from_columns(kind: &str, webhook_url: Option<String>) -> Result<Self, Error> {
        match kind {
            "websocket" | "ws" => Ok(DeliveryRoute::Ws),
            "webhook" => match webhook_url {
                Some(url) if !url.is_empty() => Ok(DeliveryRoute::Webhook { url }),
                _ => Err(Error::WebhookUrlRequired),
            },
            other => Err(Error::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// One downstream service's declared desire to receive an event type for a
/// broadcaster via a specific transport.
#[derive(Debug, Clone)]
pub struct Interest {
    pub id: Uuid,
    pub service_account_id: Uuid,
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub route: DeliveryRoute,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Interest {
    pub fn key(&self) -> InterestKey {
        InterestKey {
            bot_account_id: self.bot_account_id,
            event_type: self.event_type.clone(),
            broadcaster_user_id: self.broadcaster_user_id.clone(),
        }
    }
}

/// Identity under which Twitch WebSocket EventSub subscriptions are created.
#[derive(Debug, Clone)]
pub struct BotAccount {
    pub id: Uuid,
    pub name: String,
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub enabled: bool,
}

/// Principal of downstream requests.
#[derive(Debug, Clone)]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    pub client_id: String,
    pub client_secret_hash: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamStatus {
    Enabled,
    Pending,
    Failed,
    Revoked,
    Other(String),
}

impl UpstreamStatus {
    pub fn parse(raw: &str) -> Self {
        // Twitch uses long-form statuses like
        // "webhook_callback_verification_pending"; fold them onto the small
        // lifecycle the bridge reasons about, keeping the raw text otherwise.
        if raw.starts_with("enabled") {
            UpstreamStatus::Enabled
        } else if raw.ends_with("pending") {
            UpstreamStatus::Pending
        } else if raw == "failed" || raw.ends_with("failed") || raw.ends_with("failures_exceeded") {
            UpstreamStatus::Failed
        } else if raw.starts_with("authorization_revoked") || raw == "revoked" {
            UpstreamStatus::Revoked
        } else {
            UpstreamStatus::Other(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UpstreamStatus::Enabled => "enabled",
            UpstreamStatus::Pending => "pending",
            UpstreamStatus::Failed => "failed",
            UpstreamStatus::Revoked => "revoked",
            UpstreamStatus::Other(raw) => raw,
        }
    }

    /// Counts against the one-live-subscription-per-key invariant.
    pub fn is_live(&self) -> bool {
        matches!(self, UpstreamStatus::Enabled | UpstreamStatus::Pending)
    }
}

/// Mirror of one upstream Twitch EventSub subscription.
#[derive(Debug, Clone)]
pub struct UpstreamSubscription {
    pub id: Uuid,
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub twitch_subscription_id: String,
    pub status: UpstreamStatus,
    pub upstream_transport: String,
    pub session_id: Option<String>,
    pub cost: i32,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UpstreamSubscription {
    pub fn key(&self) -> InterestKey {
        InterestKey {
            bot_account_id: self.bot_account_id,
            event_type: self.event_type.clone(),
            broadcaster_user_id: self.broadcaster_user_id.clone(),
        }
    }
}

/// Last-known stream liveness per (bot, broadcaster).
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub bot_account_id: Uuid,
    pub broadcaster_user_id: String,
    pub is_live: bool,
    pub title: Option<String>,
    pub game_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Per-service delivery/connection counters.
#[derive(Debug, Clone, Default)]
pub struct ServiceRuntimeStats {
    pub active_ws_connections: i32,
    pub total_ws_connects: i64,
    pub total_events_sent_ws: i64,
    pub total_events_sent_webhook: i64,
    pub total_webhook_failures: i64,
    pub last_event_sent_at: Option<DateTime<Utc>>,
}

/// Body of `POST /v1/interests`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInterestRequest {
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_transport() -> String {
    "websocket".to_string()
}

/// Wire shape of an interest returned to downstream services.
#[derive(Debug, Clone, Serialize)]
pub struct InterestResponse {
    pub id: Uuid,
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Interest> for InterestResponse {
    fn from(interest: &Interest) -> Self {
        Self {
            id: interest.id,
            bot_account_id: interest.bot_account_id,
            event_type: interest.event_type.clone(),
            broadcaster_user_id: interest.broadcaster_user_id.clone(),
            transport: interest.route.kind().to_string(),
            webhook_url: interest.route.webhook_url().map(str::to_string),
            created_at: interest.created_at,
            updated_at: interest.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_route_round_trips_columns() {
        let ws = DeliveryRoute::from_columns("websocket", None).unwrap();
        assert_eq!(ws, DeliveryRoute::Ws);
        assert_eq!(ws.kind(), "websocket");

        let hook =
            DeliveryRoute::from_columns("webhook", Some("https://svc.example/cb".into())).unwrap();
        assert_eq!(hook.webhook_url(), Some("https://svc.example/cb"));
    }

    #[test]
    fn webhook_route_requires_url() {
        assert!(matches!(
            DeliveryRoute::from_columns("webhook", None),
            Err(Error::WebhookUrlRequired)
        ));
    }

    #[test]
    fn upstream_status_folds_twitch_variants() {
        assert!(UpstreamStatus::parse("enabled").is_live());
        assert!(UpstreamStatus::parse("webhook_callback_verification_pending").is_live());
        assert_eq!(
            UpstreamStatus::parse("authorization_revoked"),
            UpstreamStatus::Revoked
        );
        assert_eq!(
            UpstreamStatus::parse("notification_failures_exceeded"),
            UpstreamStatus::Failed
        );
        assert!(!UpstreamStatus::parse("version_removed").is_live());
    }
}
