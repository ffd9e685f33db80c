// tests/routing_tests.rs
//
// Drives the notification path end to end against in-memory repositories:
// upstream payload -> SubscriptionManager::route -> registry match ->
// FanoutHub -> connected service socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use switchboard_core::assets::ChatAssetCache;
use switchboard_core::config::{
    BridgeConfig, DELIVERY_QUEUE_DEPTH, WEBHOOK_DELIVERY_TIMEOUT,
};
use switchboard_core::dedupe::Freshness;
use switchboard_core::fanout::delivery::DeliveryQueue;
use switchboard_core::fanout::FanoutHub;
use switchboard_core::manager::SubscriptionManager;
use switchboard_core::models::{
    BotAccount, ChannelState, DeliveryRoute, Interest, InterestKey, UpstreamStatus,
    UpstreamSubscription,
};
use switchboard_core::registry::InterestRegistry;
use switchboard_core::repositories::{
    BotAccountRepository, ChannelStateRepository, RuntimeStatsRepository, SubscriptionRepository,
};
use switchboard_core::twitch::TwitchClient;
use switchboard_core::Error;

// ---------------------------------------------------------------------
// In-memory repositories
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemorySubscriptionRepo {
    rows: Mutex<Vec<UpstreamSubscription>>,
}

#[async_trait]
impl SubscriptionRepository for MemorySubscriptionRepo {
    async fn get_by_key(&self, key: &InterestKey) -> Result<Option<UpstreamSubscription>, Error> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|row| row.key() == *key)
            .cloned())
    }

    async fn get_by_twitch_id(
        &self,
        twitch_subscription_id: &str,
    ) -> Result<Option<UpstreamSubscription>, Error> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|row| row.twitch_subscription_id == twitch_subscription_id)
            .cloned())
    }

    async fn insert(&self, sub: &UpstreamSubscription) -> Result<(), Error> {
        let mut rows = self.rows.lock().await;
        rows.retain(|row| row.key() != sub.key());
        rows.push(sub.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), Error> {
        self.rows.lock().await.retain(|row| row.id != id);
        Ok(())
    }

    async fn update_status(
        &self,
        twitch_subscription_id: &str,
        status: &UpstreamStatus,
    ) -> Result<(), Error> {
        for row in self.rows.lock().await.iter_mut() {
            if row.twitch_subscription_id == twitch_subscription_id {
                row.status = status.clone();
            }
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<UpstreamSubscription>, Error> {
        Ok(self.rows.lock().await.clone())
    }

    async fn list_by_event_types(
        &self,
        event_types: &[&str],
    ) -> Result<Vec<UpstreamSubscription>, Error> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| event_types.contains(&row.event_type.as_str()))
            .cloned()
            .collect())
    }

    async fn replace_all(&self, subs: &[UpstreamSubscription]) -> Result<(), Error> {
        *self.rows.lock().await = subs.to_vec();
        Ok(())
    }
}

#[derive(Default)]
struct MemoryBotRepo {
    bots: Mutex<HashMap<Uuid, BotAccount>>,
}

#[async_trait]
impl BotAccountRepository for MemoryBotRepo {
    async fn get(&self, bot_account_id: Uuid) -> Result<Option<BotAccount>, Error> {
        Ok(self.bots.lock().await.get(&bot_account_id).cloned())
    }

    async fn get_by_twitch_user_id(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<BotAccount>, Error> {
        Ok(self
            .bots
            .lock()
            .await
            .values()
            .find(|bot| bot.twitch_user_id == twitch_user_id)
            .cloned())
    }

    async fn update_tokens(
        &self,
        bot_account_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        if let Some(bot) = self.bots.lock().await.get_mut(&bot_account_id) {
            bot.access_token = access_token.to_string();
            bot.refresh_token = refresh_token.to_string();
            bot.token_expires_at = expires_at;
        }
        Ok(())
    }

    async fn disable(&self, bot_account_id: Uuid) -> Result<(), Error> {
        if let Some(bot) = self.bots.lock().await.get_mut(&bot_account_id) {
            bot.enabled = false;
            bot.access_token.clear();
            bot.refresh_token.clear();
        }
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<BotAccount>, Error> {
        Ok(self
            .bots
            .lock()
            .await
            .values()
            .filter(|bot| bot.enabled)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct MemoryChannelStateRepo {
    states: Mutex<HashMap<(Uuid, String), ChannelState>>,
}

#[async_trait]
impl ChannelStateRepository for MemoryChannelStateRepo {
    async fn get(
        &self,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
    ) -> Result<Option<ChannelState>, Error> {
        Ok(self
            .states
            .lock()
            .await
            .get(&(bot_account_id, broadcaster_user_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, state: &ChannelState) -> Result<(), Error> {
        self.states.lock().await.insert(
            (state.bot_account_id, state.broadcaster_user_id.clone()),
            state.clone(),
        );
        Ok(())
    }
}

#[derive(Default)]
struct NullStats;

#[async_trait]
impl RuntimeStatsRepository for NullStats {
    async fn record_ws_connect(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn record_ws_disconnect(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn record_ws_event(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn record_webhook_event(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn record_webhook_failure(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn record_api_request(&self, _: Uuid) -> Result<(), Error> {
        Ok(())
    }
    async fn reset_connection_counts(&self) -> Result<(), Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    manager: Arc<SubscriptionManager>,
    fanout: Arc<FanoutHub>,
    registry: Arc<InterestRegistry>,
    subs: Arc<MemorySubscriptionRepo>,
    bots: Arc<MemoryBotRepo>,
    channel_states: Arc<MemoryChannelStateRepo>,
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        twitch_client_id: "client".into(),
        twitch_client_secret: "secret".into(),
        eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".into(),
        webhook_callback_url: None,
        webhook_secret: None,
        service_signing_secret: "signing-secret-test".into(),
        database_url: "postgres://unused".into(),
    }
}

fn build_harness() -> Harness {
    let config = test_config();
    let twitch = Arc::new(TwitchClient::new(
        config.twitch_client_id.clone(),
        config.twitch_client_secret.clone(),
        config.eventsub_ws_url.clone(),
    ));
    let registry = Arc::new(InterestRegistry::new());
    let subs = Arc::new(MemorySubscriptionRepo::default());
    let bots = Arc::new(MemoryBotRepo::default());
    let channel_states = Arc::new(MemoryChannelStateRepo::default());
    let stats: Arc<dyn RuntimeStatsRepository> = Arc::new(NullStats);
    let delivery = Arc::new(DeliveryQueue::new(
        DELIVERY_QUEUE_DEPTH,
        config.service_signing_secret.clone(),
        WEBHOOK_DELIVERY_TIMEOUT,
    ));
    let fanout = Arc::new(FanoutHub::new(delivery, stats));
    let assets = Arc::new(ChatAssetCache::new(twitch.clone()));
    let manager = Arc::new(SubscriptionManager::new(
        config,
        twitch,
        registry.clone(),
        fanout.clone(),
        assets,
        subs.clone(),
        bots.clone(),
        channel_states.clone(),
    ));
    Harness {
        manager,
        fanout,
        registry,
        subs,
        bots,
        channel_states,
    }
}

fn bot(twitch_user_id: &str) -> BotAccount {
    BotAccount {
        id: Uuid::new_v4(),
        name: format!("bot-{twitch_user_id}"),
        twitch_user_id: twitch_user_id.to_string(),
        twitch_login: format!("login{twitch_user_id}"),
        access_token: "access".into(),
        refresh_token: "refresh".into(),
        token_expires_at: Utc::now() + chrono::Duration::hours(4),
        enabled: true,
    }
}

fn interest(service: Uuid, bot: &BotAccount, event_type: &str, broadcaster: &str) -> Interest {
    let now = Utc::now();
    Interest {
        id: Uuid::new_v4(),
        service_account_id: service,
        bot_account_id: bot.id,
        event_type: event_type.to_string(),
        broadcaster_user_id: broadcaster.to_string(),
        route: DeliveryRoute::Ws,
        created_at: now,
        updated_at: now,
        last_heartbeat_at: now,
    }
}

fn subscription_row(bot: &BotAccount, event_type: &str, broadcaster: &str, twitch_id: &str)
    -> UpstreamSubscription
{
    UpstreamSubscription {
        id: Uuid::new_v4(),
        bot_account_id: bot.id,
        event_type: event_type.to_string(),
        broadcaster_user_id: broadcaster.to_string(),
        twitch_subscription_id: twitch_id.to_string(),
        status: UpstreamStatus::Enabled,
        upstream_transport: "websocket".into(),
        session_id: Some("sess-1".into()),
        cost: 0,
        last_seen_at: Utc::now(),
        created_at: Utc::now(),
    }
}

fn notification(twitch_sub_id: &str, event_type: &str, broadcaster: &str) -> Value {
    json!({
        "subscription": {
            "id": twitch_sub_id,
            "type": event_type,
            "condition": { "broadcaster_user_id": broadcaster },
        },
        "event": {
            "broadcaster_user_id": broadcaster,
            "user_id": "777",
            "user_login": "someone",
        },
    })
}

// ---------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------

#[tokio::test]
async fn notification_reaches_every_interested_service() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());
    h.subs
        .insert(&subscription_row(&bot, "channel.follow", "100", "tw-sub-1"))
        .await
        .unwrap();

    let service_a = Uuid::new_v4();
    let service_b = Uuid::new_v4();
    h.registry.add(interest(service_a, &bot, "channel.follow", "100"));
    h.registry.add(interest(service_b, &bot, "channel.follow", "100"));

    let socket_a = h.fanout.connect(service_a).await;
    let socket_b = h.fanout.connect(service_b).await;

    h.manager
        .route(&notification("tw-sub-1", "channel.follow", "100"), "m1")
        .await;

    for socket in [&socket_a, &socket_b] {
        let frame = socket.next_frame().await.unwrap();
        let envelope: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope["id"], "m1");
        assert_eq!(envelope["provider"], "twitch");
        assert_eq!(envelope["type"], "channel.follow");
        assert_eq!(envelope["event"]["broadcaster_user_id"], "100");
    }
}

#[tokio::test]
async fn notifications_for_other_keys_do_not_leak() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());
    h.subs
        .insert(&subscription_row(&bot, "channel.cheer", "100", "tw-sub-2"))
        .await
        .unwrap();

    let service = Uuid::new_v4();
    h.registry.add(interest(service, &bot, "channel.follow", "100"));
    let socket = h.fanout.connect(service).await;

    h.manager
        .route(&notification("tw-sub-2", "channel.cheer", "100"), "m2")
        .await;

    socket.close();
    assert!(socket.next_frame().await.is_none());
}

#[tokio::test]
async fn legacy_rows_fall_back_to_broadcaster_lookup() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());
    // No subscription row: the sub id is unknown, so routing falls back to
    // matching the broadcaster against bot identities.
    let service = Uuid::new_v4();
    h.registry.add(interest(service, &bot, "channel.follow", "100"));
    let socket = h.fanout.connect(service).await;

    h.manager
        .route(&notification("unknown-sub", "channel.follow", "100"), "m3")
        .await;

    let frame = socket.next_frame().await.unwrap();
    assert!(frame.contains("\"m3\""));
}

#[tokio::test]
async fn stream_events_update_channel_state() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());
    h.subs
        .insert(&subscription_row(&bot, "stream.online", "100", "tw-sub-3"))
        .await
        .unwrap();

    let mut payload = notification("tw-sub-3", "stream.online", "100");
    payload["event"]["started_at"] = json!("2026-03-01T18:00:00Z");
    h.manager.route(&payload, "m4").await;

    let state = h.channel_states.get(bot.id, "100").await.unwrap().unwrap();
    assert!(state.is_live);
    assert!(state.started_at.is_some());

    h.manager
        .route(&notification("tw-sub-3", "stream.offline", "100"), "m5")
        .await;
    // stream.offline has its own key; the row above covers stream.online
    // only, so routing resolves the bot via broadcaster fallback.
    let state = h.channel_states.get(bot.id, "100").await.unwrap().unwrap();
    assert!(!state.is_live);
    assert!(state.started_at.is_none());
}

#[tokio::test]
async fn authorization_revoke_disables_the_bot() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());

    let payload = json!({
        "subscription": { "id": "sys-1", "type": "user.authorization.revoke",
                          "condition": { "client_id": "client" } },
        "event": { "user_id": "100", "client_id": "client" },
    });
    h.manager.route(&payload, "m6").await;

    let stored = h.bots.get(bot.id).await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert!(stored.access_token.is_empty());
}

#[tokio::test]
async fn revocation_marks_the_mirrored_row() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());
    h.subs
        .insert(&subscription_row(&bot, "channel.follow", "100", "tw-sub-4"))
        .await
        .unwrap();

    let payload = json!({ "subscription": { "id": "tw-sub-4", "status": "authorization_revoked" } });
    h.manager.handle_revocation(&payload).await;

    let row = h.subs.get_by_twitch_id("tw-sub-4").await.unwrap().unwrap();
    assert_eq!(row.status, UpstreamStatus::Revoked);
}

#[tokio::test]
async fn subscription_errors_fan_out_once_per_cooldown() {
    let h = build_harness();
    let bot = bot("100");
    h.bots.bots.lock().await.insert(bot.id, bot.clone());

    let service = Uuid::new_v4();
    let row = interest(service, &bot, "channel.chat.message", "999");
    let key = row.key();
    h.registry.add(row);
    let socket = h.fanout.connect(service).await;

    let err = Error::InsufficientPermissions("broadcaster grant missing".into());
    h.manager.emit_subscription_error(&key, &err, "websocket").await;
    // Identical failure inside the cooldown window: no second envelope.
    h.manager.emit_subscription_error(&key, &err, "websocket").await;

    let frame = socket.next_frame().await.unwrap();
    let envelope: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(envelope["type"], "subscription.error");
    assert_eq!(envelope["provider"], "twitch-service");
    assert_eq!(envelope["event"]["error_code"], "insufficient_permissions");
    assert_eq!(envelope["event"]["event_type"], "channel.chat.message");
    assert_eq!(envelope["event"]["upstream_transport"], "websocket");

    socket.close();
    assert!(socket.next_frame().await.is_none());
}

#[tokio::test]
async fn duplicate_message_ids_are_suppressed_by_the_shared_window() {
    let h = build_harness();
    assert_eq!(h.manager.message_dedupe.observe("m-dup"), Freshness::Fresh);
    assert_eq!(
        h.manager.message_dedupe.observe("m-dup"),
        Freshness::Duplicate
    );
}

#[tokio::test]
async fn transport_selection_prefers_webhook_when_configured() {
    let h = build_harness();
    // No webhook callback configured: everything websocket-capable rides ws.
    assert_eq!(h.manager.transport_for_event("channel.follow"), "websocket");
    assert_eq!(
        h.manager.transport_for_event("user.authorization.revoke"),
        "webhook"
    );

    let mut config = test_config();
    config.webhook_callback_url = Some("https://bridge.example/webhooks/twitch/eventsub".into());
    config.webhook_secret = Some("0123456789abcdef".into());
    let twitch = Arc::new(TwitchClient::new(
        "client".into(),
        "secret".into(),
        "wss://example".into(),
    ));
    let registry = Arc::new(InterestRegistry::new());
    let stats: Arc<dyn RuntimeStatsRepository> = Arc::new(NullStats);
    let delivery = Arc::new(DeliveryQueue::new(
        DELIVERY_QUEUE_DEPTH,
        "s".into(),
        WEBHOOK_DELIVERY_TIMEOUT,
    ));
    let fanout = Arc::new(FanoutHub::new(delivery, stats));
    let assets = Arc::new(ChatAssetCache::new(twitch.clone()));
    let manager = SubscriptionManager::new(
        config,
        twitch,
        registry,
        fanout,
        assets,
        Arc::new(MemorySubscriptionRepo::default()),
        Arc::new(MemoryBotRepo::default()),
        Arc::new(MemoryChannelStateRepo::default()),
    );
    assert_eq!(manager.transport_for_event("channel.follow"), "webhook");
    assert_eq!(manager.transport_for_event("channel.chat.message"), "webhook");
}
