// src/fanout/envelope.rs
//
// The uniform JSON wrapper every downstream receives. Synthetic bridge
// events (subscription.error) use the "twitch-service" provider so clients
// can tell them apart from relayed Twitch payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PROVIDER_TWITCH: &str = "twitch";
pub const PROVIDER_BRIDGE: &str = "twitch-service";

pub const SUBSCRIPTION_ERROR_TYPE: &str = "subscription.error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub event: Value,
    /// Best-effort chat enrichment; absent for non-chat events and when the
    /// asset lookup fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitch_chat_assets: Option<Value>,
}

impl Envelope {
    pub fn for_notification(message_id: &str, event_type: &str, event: Value) -> Self {
        Self {
            id: message_id.to_string(),
            provider: PROVIDER_TWITCH.to_string(),
            event_type: event_type.to_string(),
            event_timestamp: Utc::now(),
            event,
            twitch_chat_assets: None,
        }
    }

    pub fn synthetic(event_type: &str, event: Value) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            provider: PROVIDER_BRIDGE.to_string(),
            event_type: event_type.to_string(),
            event_timestamp: Utc::now(),
            event,
            twitch_chat_assets: None,
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("envelope serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_envelope_shape() {
        let env = Envelope::for_notification(
            "m1",
            "channel.chat.message",
            json!({"broadcaster_user_id": "123"}),
        );
        let value: Value = serde_json::from_str(&env.to_json_string()).unwrap();
        assert_eq!(value["id"], "m1");
        assert_eq!(value["provider"], "twitch");
        assert_eq!(value["type"], "channel.chat.message");
        assert_eq!(value["event"]["broadcaster_user_id"], "123");
        assert!(value.get("twitch_chat_assets").is_none());
        assert!(value["event_timestamp"].is_string());
    }

    #[test]
    fn chat_assets_round_trip_when_present() {
        let mut env = Envelope::for_notification("m2", "channel.chat.message", json!({}));
        env.twitch_chat_assets = Some(json!({"badges": []}));
        let value: Value = serde_json::from_str(&env.to_json_string()).unwrap();
        assert_eq!(value["twitch_chat_assets"]["badges"], json!([]));

        let parsed: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.id, "m2");
        assert!(parsed.twitch_chat_assets.is_some());
    }

    #[test]
    fn synthetic_envelopes_use_bridge_provider_and_fresh_ids() {
        let a = Envelope::synthetic(SUBSCRIPTION_ERROR_TYPE, json!({"error_code": "unauthorized"}));
        let b = Envelope::synthetic(SUBSCRIPTION_ERROR_TYPE, json!({}));
        assert_eq!(a.provider, PROVIDER_BRIDGE);
        assert_ne!(a.id, b.id);
    }
}
