// src/assets.rs
//
// In-memory cache of Twitch chat badges and emotes (global + per
// broadcaster) used to enrich channel.chat.* envelopes without a Helix call
// per message. Enrichment is best-effort; a failed refresh serves stale data
// for a grace period and otherwise yields nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::twitch::TwitchClient;
use crate::Error;

const FRESH_TTL: Duration = Duration::from_secs(6 * 3600);
const STALE_IF_ERROR_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < FRESH_TTL
    }

    fn is_servable(&self) -> bool {
        self.fetched_at.elapsed() < STALE_IF_ERROR_TTL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AssetKind {
    Badges,
    Emotes,
}

pub struct ChatAssetCache {
    twitch: Arc<TwitchClient>,
    global: Mutex<HashMap<AssetKind, CacheEntry>>,
    channel: Mutex<HashMap<(AssetKind, String), CacheEntry>>,
}

impl ChatAssetCache {
    pub fn new(twitch: Arc<TwitchClient>) -> Self {
        Self {
            twitch,
            global: Mutex::new(HashMap::new()),
            channel: Mutex::new(HashMap::new()),
        }
    }

    /// Assemble the `twitch_chat_assets` enrichment for a broadcaster, or
    /// None when nothing could be fetched.
    pub async fn enrich(&self, broadcaster_user_id: &str) -> Option<Value> {
        let global_badges = self.get_global(AssetKind::Badges).await;
        let global_emotes = self.get_global(AssetKind::Emotes).await;
        let channel_badges = self.get_channel(AssetKind::Badges, broadcaster_user_id).await;
        let channel_emotes = self.get_channel(AssetKind::Emotes, broadcaster_user_id).await;

        if global_badges.is_none()
            && global_emotes.is_none()
            && channel_badges.is_none()
            && channel_emotes.is_none()
        {
            return None;
        }

        Some(json!({
            "badges": {
                "global": global_badges.unwrap_or(Value::Array(Vec::new())),
                "channel": channel_badges.unwrap_or(Value::Array(Vec::new())),
            },
            "emotes": {
                "global": global_emotes.unwrap_or(Value::Array(Vec::new())),
                "channel": channel_emotes.unwrap_or(Value::Array(Vec::new())),
            },
        }))
    }

    async fn get_global(&self, kind: AssetKind) -> Option<Value> {
        {
            let cache = self.global.lock().await;
            if let Some(entry) = cache.get(&kind) {
                if entry.is_fresh() {
                    return Some(entry.value.clone());
                }
            }
        }
        match self.fetch(kind, None).await {
            Ok(value) => {
                let mut cache = self.global.lock().await;
                cache.insert(
                    kind,
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Some(value)
            }
            Err(e) => {
                debug!("Global chat asset refresh failed: {e}");
                let cache = self.global.lock().await;
                cache
                    .get(&kind)
                    .filter(|entry| entry.is_servable())
                    .map(|entry| entry.value.clone())
            }
        }
    }

    async fn get_channel(&self, kind: AssetKind, broadcaster_id: &str) -> Option<Value> {
        let key = (kind, broadcaster_id.to_string());
        {
            let cache = self.channel.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.is_fresh() {
                    return Some(entry.value.clone());
                }
            }
        }
        match self.fetch(kind, Some(broadcaster_id)).await {
            Ok(value) => {
                let mut cache = self.channel.lock().await;
                cache.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Some(value)
            }
            Err(e) => {
                debug!("Channel chat asset refresh failed for {broadcaster_id}: {e}");
                let cache = self.channel.lock().await;
                cache
                    .get(&key)
                    .filter(|entry| entry.is_servable())
                    .map(|entry| entry.value.clone())
            }
        }
    }

    async fn fetch(&self, kind: AssetKind, broadcaster_id: Option<&str>) -> Result<Value, Error> {
        match kind {
            AssetKind::Badges => self.twitch.get_chat_badges(broadcaster_id).await,
            AssetKind::Emotes => self.twitch.get_chat_emotes(broadcaster_id).await,
        }
    }
}
