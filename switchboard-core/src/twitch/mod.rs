// src/twitch/mod.rs
//
// Twitch OAuth + Helix + EventSub management client. App-token requests are
// used for webhook-transport subscriptions and Helix reads; user tokens are
// passed explicitly for websocket-transport subscriptions.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::HTTP_TIMEOUT;
use crate::Error;

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const HELIX_BASE: &str = "https://api.twitch.tv/helix";

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub started_at: String,
}

/// The slice of a created/listed EventSub subscription the bridge keeps.
#[derive(Debug, Clone)]
pub struct RemoteSubscription {
    pub id: String,
    pub event_type: String,
    pub status: String,
    pub cost: i32,
    pub condition: Value,
    pub transport_method: String,
    pub session_id: Option<String>,
    pub connected_at: Option<String>,
}

impl RemoteSubscription {
    fn from_value(v: &Value) -> Option<Self> {
        let transport = v.get("transport").cloned().unwrap_or_default();
        Some(Self {
            id: v.get("id")?.as_str()?.to_string(),
            event_type: v.get("type")?.as_str()?.to_string(),
            status: v.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            cost: v.get("cost").and_then(Value::as_i64).unwrap_or(0) as i32,
            condition: v.get("condition").cloned().unwrap_or_default(),
            transport_method: transport
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            session_id: transport
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            connected_at: transport
                .get("connected_at")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn broadcaster_user_id(&self) -> Option<&str> {
        self.condition.get("broadcaster_user_id").and_then(Value::as_str)
    }

    pub fn condition_user_id(&self) -> Option<&str> {
        self.condition.get("user_id").and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

struct CachedAppToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct TwitchClient {
    http: reqwest::Client,
    pub client_id: String,
    client_secret: String,
    pub eventsub_ws_url: String,
    app_token: Mutex<Option<CachedAppToken>>,
}

impl TwitchClient {
    pub fn new(client_id: String, client_secret: String, eventsub_ws_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            client_id,
            client_secret,
            eventsub_ws_url,
            app_token: Mutex::new(None),
        }
    }

    /// Client-credentials token, cached until one minute before expiry.
    pub async fn app_access_token(&self) -> Result<String, Error> {
        let mut cached = self.app_token.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Utc::now() < entry.expires_at {
                return Ok(entry.token.clone());
            }
        }
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let resp = Self::check_auth_response(resp, "app token").await?;
        let token: TokenResponse = resp.json().await?;
        let entry = CachedAppToken {
            token: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(token.expires_in - 60),
        };
        *cached = Some(entry);
        Ok(token.access_token)
    }

    pub async fn refresh_user_token(&self, refresh_token: &str) -> Result<OAuthToken, Error> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let resp = Self::check_auth_response(resp, "token refresh").await?;
        let token: TokenResponse = resp.json().await?;
        Ok(OAuthToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    /// `/oauth2/validate`: confirms the token and yields its scopes/identity.
    pub async fn validate_user_token(&self, access_token: &str) -> Result<TokenInfo, Error> {
        let resp = self
            .http
            .get(VALIDATE_URL)
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized("user token failed validation".into()));
        }
        let resp = resp.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn get_user_by_login(&self, login: &str) -> Result<Option<HelixUser>, Error> {
        self.get_users(&[("login", login)]).await.map(|mut v| v.pop())
    }

    pub async fn get_user_by_id(&self, user_id: &str) -> Result<Option<HelixUser>, Error> {
        self.get_users(&[("id", user_id)]).await.map(|mut v| v.pop())
    }

    async fn get_users(&self, query: &[(&str, &str)]) -> Result<Vec<HelixUser>, Error> {
        let token = self.app_access_token().await?;
        let resp = self
            .http
            .get(format!("{HELIX_BASE}/users"))
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        #[derive(Deserialize)]
        struct Data {
            data: Vec<HelixUser>,
        }
        Ok(resp.json::<Data>().await?.data)
    }

    /// Live streams for up to 100 user ids per call; callers chunk.
    pub async fn get_streams_by_user_ids(
        &self,
        user_ids: &[String],
    ) -> Result<Vec<HelixStream>, Error> {
        let token = self.app_access_token().await?;
        let query: Vec<(&str, &str)> =
            user_ids.iter().map(|id| ("user_id", id.as_str())).collect();
        let resp = self
            .http
            .get(format!("{HELIX_BASE}/streams"))
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        #[derive(Deserialize)]
        struct Data {
            data: Vec<HelixStream>,
        }
        Ok(resp.json::<Data>().await?.data)
    }

    pub async fn get_chat_badges(&self, broadcaster_id: Option<&str>) -> Result<Value, Error> {
        self.get_chat_assets("chat/badges", broadcaster_id).await
    }

    pub async fn get_chat_emotes(&self, broadcaster_id: Option<&str>) -> Result<Value, Error> {
        self.get_chat_assets("chat/emotes", broadcaster_id).await
    }

    async fn get_chat_assets(
        &self,
        path: &str,
        broadcaster_id: Option<&str>,
    ) -> Result<Value, Error> {
        let token = self.app_access_token().await?;
        let url = match broadcaster_id {
            Some(_) => format!("{HELIX_BASE}/{path}"),
            None => format!("{HELIX_BASE}/{path}/global"),
        };
        let mut req = self
            .http
            .get(url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token);
        if let Some(id) = broadcaster_id {
            req = req.query(&[("broadcaster_id", id)]);
        }
        let resp = req.send().await?.error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body.get("data").cloned().unwrap_or(Value::Array(Vec::new())))
    }

    /// List EventSub subscriptions visible to the given token (app token
    /// when None), following pagination.
    pub async fn list_eventsub_subscriptions(
        &self,
        access_token: Option<&str>,
    ) -> Result<Vec<RemoteSubscription>, Error> {
        let token = match access_token {
            Some(t) => t.to_string(),
            None => self.app_access_token().await?,
        };
        let mut cursor: Option<String> = None;
        let mut out = Vec::new();
        loop {
            let mut req = self
                .http
                .get(format!("{HELIX_BASE}/eventsub/subscriptions"))
                .header("Client-Id", &self.client_id)
                .bearer_auth(&token);
            if let Some(after) = &cursor {
                req = req.query(&[("after", after.as_str())]);
            }
            let resp = req.send().await?.error_for_status()?;
            let body: Value = resp.json().await?;
            if let Some(items) = body.get("data").and_then(Value::as_array) {
                out.extend(items.iter().filter_map(RemoteSubscription::from_value));
            }
            cursor = body
                .get("pagination")
                .and_then(|p| p.get("cursor"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(out)
    }

    pub async fn create_eventsub_subscription(
        &self,
        event_type: &str,
        version: &str,
        condition: Value,
        transport: Value,
        access_token: Option<&str>,
    ) -> Result<RemoteSubscription, Error> {
        let token = match access_token {
            Some(t) => t.to_string(),
            None => self.app_access_token().await?,
        };
        let body = json!({
            "type": event_type,
            "version": version,
            "condition": condition,
            "transport": transport,
        });
        debug!("Creating EventSub subscription {event_type} v{version}");
        let resp = self
            .http
            .post(format!("{HELIX_BASE}/eventsub/subscriptions"))
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_create_failure(status, &text));
        }
        let body: Value = resp.json().await?;
        body.get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(RemoteSubscription::from_value)
            .ok_or_else(|| {
                Error::SubscriptionCreateFailed("empty create subscription response".into())
            })
    }

    pub async fn delete_eventsub_subscription(
        &self,
        subscription_id: &str,
        access_token: Option<&str>,
    ) -> Result<(), Error> {
        let token = match access_token {
            Some(t) => t.to_string(),
            None => self.app_access_token().await?,
        };
        let resp = self
            .http
            .delete(format!("{HELIX_BASE}/eventsub/subscriptions"))
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token)
            .query(&[("id", subscription_id)])
            .send()
            .await?;
        // A vanished subscription is the desired end state.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn check_auth_response(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, Error> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(Error::Unauthorized(format!("{what}: HTTP {status}: {text}")))
        } else {
            Err(Error::Network(format!("{what}: HTTP {status}: {text}")))
        }
    }
}

/// Map a failed subscription create onto the closed error taxonomy. Twitch
/// reports scope and authorization problems in the body text, so the
/// classification reads both the status code and the message.
pub fn classify_create_failure(status: reqwest::StatusCode, body: &str) -> Error {
    let message = body.to_lowercase();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Error::RateLimited(body.to_string());
    }
    if status.is_server_error() {
        return Error::Network(format!("HTTP {status}: {body}"));
    }
    if message.contains("missing proper authorization") {
        return Error::InsufficientPermissions(body.to_string());
    }
    if message.contains("missing required scope") || message.contains("scope") {
        return Error::MissingScope(body.to_string());
    }
    if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
        || message.contains("unauthorized")
        || message.contains("forbidden")
    {
        return Error::Unauthorized(format!("HTTP {status}: {body}"));
    }
    Error::SubscriptionCreateFailed(format!("HTTP {status}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn rate_limit_is_transient() {
        let err = classify_create_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_transient());
        assert_eq!(err.subscription_error_code(), "transient");
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify_create_failure(StatusCode::BAD_GATEWAY, "oops");
        assert!(err.is_transient());
    }

    #[test]
    fn missing_authorization_maps_to_insufficient_permissions() {
        let err = classify_create_failure(
            StatusCode::FORBIDDEN,
            "subscription missing proper authorization",
        );
        assert!(matches!(err, Error::InsufficientPermissions(_)));
        assert_eq!(err.subscription_error_code(), "insufficient_permissions");
        assert!(!err.is_transient());
    }

    #[test]
    fn scope_problems_map_to_missing_scope() {
        let err = classify_create_failure(
            StatusCode::BAD_REQUEST,
            "missing required scope channel:read:polls",
        );
        assert!(matches!(err, Error::MissingScope(_)));
        assert_eq!(err.subscription_error_code(), "missing_scope");
    }

    #[test]
    fn unauthorized_is_terminal() {
        let err = classify_create_failure(StatusCode::UNAUTHORIZED, "invalid token");
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn anything_else_is_create_failed() {
        let err = classify_create_failure(StatusCode::CONFLICT, "subscription already exists");
        assert!(matches!(err, Error::SubscriptionCreateFailed(_)));
        assert_eq!(err.subscription_error_code(), "subscription_create_failed");
    }

    #[test]
    fn remote_subscription_parses_transport() {
        let value = serde_json::json!({
            "id": "sub-1",
            "type": "channel.follow",
            "status": "enabled",
            "cost": 1,
            "condition": {"broadcaster_user_id": "42"},
            "transport": {"method": "websocket", "session_id": "s-9", "connected_at": "t"},
        });
        let sub = RemoteSubscription::from_value(&value).unwrap();
        assert_eq!(sub.broadcaster_user_id(), Some("42"));
        assert_eq!(sub.session_id.as_deref(), Some("s-9"));
        assert_eq!(sub.transport_method, "websocket");
    }
}
