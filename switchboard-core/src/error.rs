// src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    // Validation
    #[error("Unknown EventSub event type: {0}")]
    UnknownEventType(String),

    #[error("Could not resolve broadcaster: {0}")]
    InvalidBroadcaster(String),

    #[error("webhook_url is required for webhook transport")]
    WebhookUrlRequired,

    #[error("Invalid webhook target: {0}")]
    InvalidWebhookTarget(String),

    // Auth
    #[error("Invalid service credentials")]
    InvalidServiceCredentials,

    #[error("Invalid ws token")]
    InvalidToken,

    #[error("Expired ws token")]
    ExpiredToken,

    #[error("ws token already used")]
    AlreadyUsed,

    #[error("Bot account not accessible: {0}")]
    BotNotAccessible(String),

    // Upstream permission
    #[error("Missing OAuth scope: {0}")]
    MissingScope(String),

    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    // Upstream transient
    #[error("Twitch rate limit: {0}")]
    RateLimited(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Upstream network error: {0}")]
    Network(String),

    // Upstream terminal
    #[error("Twitch rejected authorization: {0}")]
    Unauthorized(String),

    #[error("Subscription create failed: {0}")]
    SubscriptionCreateFailed(String),

    #[error("No usable upstream transport for event type: {0}")]
    UnsupportedUpstream(String),

    // Webhook ingress
    #[error("Invalid Twitch signature")]
    InvalidSignature,

    #[error("Stale Twitch message timestamp")]
    StaleTimestamp,

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a subscription-create failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Timeout(_) | Error::Network(_) | Error::Http(_)
        )
    }

    /// Stable error code carried inside a `subscription.error` envelope.
    pub fn subscription_error_code(&self) -> &'static str {
        match self {
            Error::InsufficientPermissions(_) => "insufficient_permissions",
            Error::MissingScope(_) => "missing_scope",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited(_) | Error::Timeout(_) | Error::Network(_) | Error::Http(_) => {
                "transient"
            }
            _ => "subscription_create_failed",
        }
    }

    /// Operator-facing hint matching the error code.
    pub fn subscription_error_hint(&self) -> &'static str {
        match self {
            Error::InsufficientPermissions(_) => {
                "Broadcaster authorization for this bot is missing or no longer valid."
            }
            Error::MissingScope(_) => {
                "Bot OAuth token is missing a required scope for this subscription type."
            }
            Error::Unauthorized(_) => {
                "Twitch rejected subscription authorization for this bot/condition."
            }
            Error::RateLimited(_) | Error::Timeout(_) | Error::Network(_) | Error::Http(_) => {
                "Transient upstream failure; the bridge will retry."
            }
            _ => "Twitch rejected subscription creation for this interest.",
        }
    }
}
