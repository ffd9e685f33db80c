// src/manager/mod.rs
//
// Reconciles declared interests with upstream Twitch EventSub subscriptions:
// one live upstream subscription per interest key, created over the right
// transport with the right token, recreated on session rotation, torn down
// when the last interest goes away.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::ChatAssetCache;
use crate::catalog;
use crate::config::{
    BridgeConfig, MAX_DELIVERY_ATTEMPTS, MESSAGE_DEDUPE_CAPACITY, MESSAGE_DEDUPE_TTL,
    SUBSCRIPTION_ERROR_COOLDOWN,
};
use crate::dedupe::{DedupeWindow, Freshness};
use crate::fanout::envelope::{Envelope, SUBSCRIPTION_ERROR_TYPE};
use crate::fanout::FanoutHub;
use crate::models::{
    BotAccount, ChannelState, InterestKey, UpstreamStatus, UpstreamSubscription,
};
use crate::registry::InterestRegistry;
use crate::repositories::{
    BotAccountRepository, ChannelStateRepository, SubscriptionRepository,
};
use crate::twitch::{RemoteSubscription, TwitchClient};
use crate::Error;

pub const UPSTREAM_WEBSOCKET: &str = "websocket";
pub const UPSTREAM_WEBHOOK: &str = "webhook";

/// System subscription kept alive independently of interests.
const AUTHORIZATION_REVOKE: &str = "user.authorization.revoke";

/// Refresh a bot token this close to expiry.
const TOKEN_SKEW_SECONDS: i64 = 120;

struct TerminalFailure {
    code: &'static str,
    reason: String,
    at: Instant,
}

pub struct SubscriptionManager {
    config: BridgeConfig,
    twitch: Arc<TwitchClient>,
    registry: Arc<InterestRegistry>,
    fanout: Arc<FanoutHub>,
    assets: Arc<ChatAssetCache>,
    subs: Arc<dyn SubscriptionRepository>,
    bots: Arc<dyn BotAccountRepository>,
    channel_states: Arc<dyn ChannelStateRepository>,
    session_id: RwLock<Option<String>>,
    key_locks: DashMap<InterestKey, Arc<Mutex<()>>>,
    /// Suppresses repeated subscription.error envelopes per
    /// (service, key, code) inside the cooldown window.
    error_throttle: DedupeWindow,
    /// Suppresses re-ensure of a key right after a terminal failure.
    cooldowns: DashMap<InterestKey, TerminalFailure>,
    /// (bot, event_type) pairs parked after a missing_scope failure.
    scope_blocked: DashMap<(Uuid, String), ()>,
    /// Upstream message ids already forwarded; shared with webhook ingress.
    pub message_dedupe: Arc<DedupeWindow>,
}

impl SubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeConfig,
        twitch: Arc<TwitchClient>,
        registry: Arc<InterestRegistry>,
        fanout: Arc<FanoutHub>,
        assets: Arc<ChatAssetCache>,
        subs: Arc<dyn SubscriptionRepository>,
        bots: Arc<dyn BotAccountRepository>,
        channel_states: Arc<dyn ChannelStateRepository>,
    ) -> Self {
        Self {
            config,
            twitch,
            registry,
            fanout,
            assets,
            subs,
            bots,
            channel_states,
            session_id: RwLock::new(None),
            key_locks: DashMap::new(),
            error_throttle: DedupeWindow::new(SUBSCRIPTION_ERROR_COOLDOWN, 4096),
            cooldowns: DashMap::new(),
            scope_blocked: DashMap::new(),
            message_dedupe: Arc::new(DedupeWindow::new(
                MESSAGE_DEDUPE_TTL,
                MESSAGE_DEDUPE_CAPACITY,
            )),
        }
    }

    /// Which upstream transport this event type rides in this deployment.
    pub fn transport_for_event(&self, event_type: &str) -> &'static str {
        if catalog::is_webhook_only(event_type) || self.config.webhook_upstream_configured() {
            UPSTREAM_WEBHOOK
        } else {
            UPSTREAM_WEBSOCKET
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub(crate) async fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write().await = session_id;
    }

    // ------------------------------------------------------------------
    // ensure / release
    // ------------------------------------------------------------------

    /// Guarantee exactly one live upstream subscription for `key`. Safe to
    /// call concurrently; ensures for the same key coalesce on a lock.
    pub async fn ensure(&self, key: &InterestKey) -> Result<(), Error> {
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(failure) = self.cooldowns.get(key) {
            if failure.at.elapsed() < SUBSCRIPTION_ERROR_COOLDOWN {
                return Err(error_for_code(failure.code, &failure.reason));
            }
        }
        self.cooldowns.remove(key);

        let upstream = self.transport_for_event(&key.event_type);
        if upstream == UPSTREAM_WEBHOOK && !self.config.webhook_upstream_configured() {
            let err = Error::UnsupportedUpstream(key.event_type.clone());
            self.emit_subscription_error(key, &err, upstream).await;
            return Err(err);
        }

        let session_snapshot = self.session_id().await;
        if upstream == UPSTREAM_WEBSOCKET && session_snapshot.is_none() {
            // No session yet; the welcome handler re-ensures every key.
            return Ok(());
        }

        if self.scope_blocked.contains_key(&(key.bot_account_id, key.event_type.clone())) {
            let err = Error::MissingScope(format!(
                "bot is blocked for {} until its token is re-authorized",
                key.event_type
            ));
            return Err(err);
        }

        // Reuse a live row when it is still bound correctly.
        if let Some(existing) = self.subs.get_by_key(key).await? {
            if existing.status == UpstreamStatus::Enabled {
                match upstream {
                    UPSTREAM_WEBHOOK if existing.session_id.is_none() => return Ok(()),
                    UPSTREAM_WEBSOCKET if existing.session_id == session_snapshot => {
                        return Ok(())
                    }
                    _ => {}
                }
            }
            self.rotate_out(key, &existing, upstream).await?;
        }

        match self.create_upstream(key, upstream, session_snapshot).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Ok(()), // session changed mid-create; next welcome retries
            Err(err) => {
                if err.is_transient() {
                    return Err(err);
                }
                if matches!(err, Error::MissingScope(_)) {
                    self.scope_blocked
                        .insert((key.bot_account_id, key.event_type.clone()), ());
                }
                self.cooldowns.insert(
                    key.clone(),
                    TerminalFailure {
                        code: err.subscription_error_code(),
                        reason: err.to_string(),
                        at: Instant::now(),
                    },
                );
                self.mark_failed(key).await;
                self.emit_subscription_error(key, &err, upstream).await;
                Err(err)
            }
        }
    }

    /// Delete the old upstream row before creating a replacement.
    async fn rotate_out(
        &self,
        key: &InterestKey,
        existing: &UpstreamSubscription,
        upstream: &str,
    ) -> Result<(), Error> {
        let token = if upstream == UPSTREAM_WEBSOCKET {
            self.bot_token_for(key.bot_account_id).await.ok()
        } else {
            None
        };
        if let Err(e) = self
            .twitch
            .delete_eventsub_subscription(&existing.twitch_subscription_id, token.as_deref())
            .await
        {
            warn!(
                key = %key,
                sub = %existing.twitch_subscription_id,
                "Cannot rotate EventSub subscription: {e}"
            );
        }
        self.subs.delete(existing.id).await?;
        Ok(())
    }

    /// Returns Ok(None) when the websocket session rotated underneath us.
    async fn create_upstream(
        &self,
        key: &InterestKey,
        upstream: &str,
        session_snapshot: Option<String>,
    ) -> Result<Option<()>, Error> {
        let bot = self
            .bots
            .get(key.bot_account_id)
            .await?
            .ok_or_else(|| Error::BotNotAccessible(key.bot_account_id.to_string()))?;
        if !bot.enabled {
            return Err(Error::BotNotAccessible(format!(
                "bot account {} is disabled",
                bot.id
            )));
        }

        let transport = match upstream {
            UPSTREAM_WEBHOOK => json!({
                "method": "webhook",
                "callback": self.config.webhook_callback_url.as_deref().unwrap_or_default(),
                "secret": self.config.webhook_secret.as_deref().unwrap_or_default(),
            }),
            _ => {
                if self.session_id().await != session_snapshot || session_snapshot.is_none() {
                    info!(key = %key, "Skipping subscription create due to session change");
                    return Ok(None);
                }
                json!({
                    "method": "websocket",
                    "session_id": session_snapshot.as_deref().unwrap_or_default(),
                })
            }
        };

        let user_token = if upstream == UPSTREAM_WEBSOCKET {
            let token = self.ensure_bot_access_token(&bot).await?;
            self.preflight_scopes(key, &bot, &token).await?;
            Some(token)
        } else {
            None
        };

        let mut condition = json!({ "broadcaster_user_id": key.broadcaster_user_id });
        if catalog::requires_condition_user_id(&key.event_type) {
            condition["user_id"] = Value::String(bot.twitch_user_id.clone());
        }

        let created = self
            .create_with_retry(key, &condition, &transport, user_token.as_deref())
            .await?;

        let row = UpstreamSubscription {
            id: Uuid::new_v4(),
            bot_account_id: key.bot_account_id,
            event_type: key.event_type.clone(),
            broadcaster_user_id: key.broadcaster_user_id.clone(),
            twitch_subscription_id: created.id,
            status: UpstreamStatus::parse(&created.status),
            upstream_transport: upstream.to_string(),
            session_id: created.session_id,
            cost: created.cost,
            last_seen_at: Utc::now(),
            created_at: Utc::now(),
        };
        self.subs.insert(&row).await?;
        info!(key = %key, upstream, "Upstream subscription ensured");
        Ok(Some(()))
    }

    async fn create_with_retry(
        &self,
        key: &InterestKey,
        condition: &Value,
        transport: &Value,
        user_token: Option<&str>,
    ) -> Result<RemoteSubscription, Error> {
        let version = catalog::preferred_version(&key.event_type);
        let mut backoff = Duration::from_millis(500);
        let mut last_err: Option<Error> = None;
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            match self
                .twitch
                .create_eventsub_subscription(
                    &key.event_type,
                    version,
                    condition.clone(),
                    transport.clone(),
                    user_token,
                )
                .await
            {
                Ok(created) => return Ok(created),
                Err(err) if err.is_transient() && attempt < MAX_DELIVERY_ATTEMPTS => {
                    warn!(key = %key, attempt, "Transient subscription create failure: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::SubscriptionCreateFailed("subscription create retries exhausted".into())
        }))
    }

    /// Scope preflight for the bot's own channel; cross-channel grants are
    /// validated by Twitch at create time.
    async fn preflight_scopes(
        &self,
        key: &InterestKey,
        bot: &BotAccount,
        token: &str,
    ) -> Result<(), Error> {
        if key.broadcaster_user_id != bot.twitch_user_id {
            return Ok(());
        }
        let groups = catalog::required_scope_groups(&key.event_type);
        if groups.is_empty() {
            return Ok(());
        }
        let info = self.twitch.validate_user_token(token).await?;
        if !catalog::scopes_satisfy(&key.event_type, &info.scopes) {
            let missing = groups
                .iter()
                .map(|group| group.join("|"))
                .collect::<Vec<_>>()
                .join(" and ");
            return Err(Error::MissingScope(format!(
                "bot token is missing required scope(s) ({missing})"
            )));
        }
        Ok(())
    }

    /// Tear down the upstream subscription once no interest remains.
    pub async fn release(&self, key: &InterestKey) -> Result<(), Error> {
        if self.registry.has_key(key) {
            return Ok(());
        }
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(row) = self.subs.get_by_key(key).await? {
            let token = if row.upstream_transport == UPSTREAM_WEBSOCKET {
                self.bot_token_for(key.bot_account_id).await.ok()
            } else {
                None
            };
            if let Err(e) = self
                .twitch
                .delete_eventsub_subscription(&row.twitch_subscription_id, token.as_deref())
                .await
            {
                warn!(key = %key, "Upstream delete failed during release: {e}");
            }
            self.subs.delete(row.id).await?;
            info!(key = %key, "Released upstream subscription");
        }
        self.cooldowns.remove(key);
        Ok(())
    }

    async fn mark_failed(&self, key: &InterestKey) {
        if let Ok(Some(row)) = self.subs.get_by_key(key).await {
            let _ = self
                .subs
                .update_status(&row.twitch_subscription_id, &UpstreamStatus::Failed)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Boot/welcome reconciliation: fold Twitch's view of our subscriptions
    /// into the mirror, deleting strays and duplicates, then re-ensure every
    /// interest key.
    pub async fn reconcile(&self) -> Result<(), Error> {
        let remote = self.list_remote_subscriptions().await?;
        let previous_owner: HashMap<String, Uuid> = self
            .subs
            .list_all()
            .await?
            .into_iter()
            .map(|row| (row.twitch_subscription_id.clone(), row.bot_account_id))
            .collect();

        let mut winners: HashMap<(Uuid, String, String), (UpstreamSubscription, RankKey)> =
            HashMap::new();
        let mut strays: Vec<(RemoteSubscription, Option<Uuid>)> = Vec::new();

        for sub in remote {
            if sub.event_type == AUTHORIZATION_REVOKE && sub.transport_method == UPSTREAM_WEBHOOK {
                continue; // permanent system subscription
            }
            if sub.transport_method != UPSTREAM_WEBSOCKET
                && sub.transport_method != UPSTREAM_WEBHOOK
            {
                continue;
            }
            let Some(broadcaster) = sub.broadcaster_user_id().map(str::to_string) else {
                continue;
            };

            let bot = self.resolve_bot_for_remote(&sub, &broadcaster, &previous_owner).await;
            let Some(bot) = bot else {
                strays.push((sub, None));
                continue;
            };

            let key = InterestKey {
                bot_account_id: bot.id,
                event_type: sub.event_type.clone(),
                broadcaster_user_id: broadcaster.clone(),
            };
            let expected = self.transport_for_event(&key.event_type);
            let status = UpstreamStatus::parse(&sub.status);
            let usable = self.registry.has_key(&key)
                && sub.transport_method == expected
                && status.is_live();
            if !usable {
                strays.push((sub, Some(bot.id)));
                continue;
            }

            let rank = RankKey {
                enabled: status == UpstreamStatus::Enabled,
                connected_at: sub.connected_at.clone().unwrap_or_default(),
                id: sub.id.clone(),
            };
            let row = UpstreamSubscription {
                id: Uuid::new_v4(),
                bot_account_id: bot.id,
                event_type: sub.event_type.clone(),
                broadcaster_user_id: broadcaster.clone(),
                twitch_subscription_id: sub.id.clone(),
                status,
                upstream_transport: sub.transport_method.clone(),
                session_id: sub.session_id.clone(),
                cost: sub.cost,
                last_seen_at: Utc::now(),
                created_at: Utc::now(),
            };

            let slot = (bot.id, key.event_type.clone(), broadcaster);
            let keep_existing = winners
                .get(&slot)
                .map(|(_, existing_rank)| *existing_rank >= rank)
                .unwrap_or(false);
            if keep_existing {
                strays.push((sub, Some(bot.id)));
                continue;
            }
            if let Some((loser, _)) = winners.insert(slot, (row, rank)) {
                strays.push((
                    RemoteSubscription {
                        id: loser.twitch_subscription_id,
                        event_type: loser.event_type,
                        status: loser.status.as_str().to_string(),
                        cost: loser.cost,
                        condition: Value::Null,
                        transport_method: loser.upstream_transport,
                        session_id: loser.session_id,
                        connected_at: None,
                    },
                    Some(bot.id),
                ));
            }
        }

        let rows: Vec<UpstreamSubscription> =
            winners.into_values().map(|(row, _)| row).collect();
        self.subs.replace_all(&rows).await?;

        for (stray, bot_id) in strays {
            let token = match (stray.transport_method.as_str(), bot_id) {
                (UPSTREAM_WEBSOCKET, Some(bot_id)) => self.bot_token_for(bot_id).await.ok(),
                _ => None,
            };
            if let Err(e) = self
                .twitch
                .delete_eventsub_subscription(&stray.id, token.as_deref())
                .await
            {
                debug!("Stray subscription delete failed for {}: {e}", stray.id);
            } else {
                info!(
                    sub = %stray.id,
                    event_type = %stray.event_type,
                    "Removed stray Twitch subscription during reconcile"
                );
            }
        }

        self.ensure_authorization_revoke_subscription().await;
        Ok(())
    }

    /// WebSocket-transport subscriptions are only visible to the token that
    /// created them, so the remote listing merges the app token's view with
    /// each enabled bot's view.
    async fn list_remote_subscriptions(&self) -> Result<Vec<RemoteSubscription>, Error> {
        let mut merged: HashMap<String, RemoteSubscription> = HashMap::new();
        for sub in self.twitch.list_eventsub_subscriptions(None).await? {
            merged.insert(sub.id.clone(), sub);
        }
        for bot in self.bots.list_enabled().await? {
            let token = match self.ensure_bot_access_token(&bot).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(bot = %bot.id, "Skipping bot during remote listing: {e}");
                    continue;
                }
            };
            match self.twitch.list_eventsub_subscriptions(Some(&token)).await {
                Ok(subs) => {
                    for sub in subs {
                        merged.insert(sub.id.clone(), sub);
                    }
                }
                Err(e) => warn!(bot = %bot.id, "Listing with bot token failed: {e}"),
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn resolve_bot_for_remote(
        &self,
        sub: &RemoteSubscription,
        broadcaster: &str,
        previous_owner: &HashMap<String, Uuid>,
    ) -> Option<BotAccount> {
        if sub.event_type.starts_with("channel.chat.") {
            let user_id = sub.condition_user_id()?;
            return self.bots.get_by_twitch_user_id(user_id).await.ok().flatten();
        }
        if let Some(bot_id) = previous_owner.get(&sub.id) {
            if let Ok(Some(bot)) = self.bots.get(*bot_id).await {
                return Some(bot);
            }
        }
        self.bots.get_by_twitch_user_id(broadcaster).await.ok().flatten()
    }

    /// Re-ensure every key; called at boot and after each welcome.
    pub async fn ensure_all(&self) {
        let has_session = self.session_id().await.is_some();
        for key in self.registry.keys() {
            if self.transport_for_event(&key.event_type) == UPSTREAM_WEBSOCKET && !has_session {
                continue;
            }
            if let Err(e) = self.ensure(&key).await {
                warn!(key = %key, "Failed ensuring subscription: {e}");
            }
        }
    }

    async fn ensure_authorization_revoke_subscription(&self) {
        if !self.config.webhook_upstream_configured() {
            return;
        }
        let existing = match self.twitch.list_eventsub_subscriptions(None).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!("Cannot list subscriptions for authorization.revoke check: {e}");
                return;
            }
        };
        let present = existing.iter().any(|sub| {
            sub.event_type == AUTHORIZATION_REVOKE && sub.transport_method == UPSTREAM_WEBHOOK
        });
        if present {
            return;
        }
        let transport = json!({
            "method": "webhook",
            "callback": self.config.webhook_callback_url.as_deref().unwrap_or_default(),
            "secret": self.config.webhook_secret.as_deref().unwrap_or_default(),
        });
        let condition = json!({ "client_id": self.twitch.client_id });
        if let Err(e) = self
            .twitch
            .create_eventsub_subscription(AUTHORIZATION_REVOKE, "1", condition, transport, None)
            .await
        {
            warn!("Could not create {AUTHORIZATION_REVOKE} subscription: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Notification routing
    // ------------------------------------------------------------------

    /// Fan a verified upstream notification out to every matching interest.
    /// Callers have already deduped the message id.
    pub async fn route(&self, payload: &Value, message_id: &str) {
        let subscription = payload.get("subscription").cloned().unwrap_or_default();
        let event = payload.get("event").cloned().unwrap_or_default();
        let Some(event_type) = subscription.get("type").and_then(Value::as_str) else {
            return;
        };

        if event_type == AUTHORIZATION_REVOKE {
            self.handle_user_authorization_revoke(&event).await;
            return;
        }

        let broadcaster = event
            .get("broadcaster_user_id")
            .and_then(Value::as_str)
            .or_else(|| {
                subscription
                    .get("condition")
                    .and_then(|c| c.get("broadcaster_user_id"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);
        let Some(broadcaster) = broadcaster else {
            return;
        };

        let Some(bot) = self.resolve_bot_for_notification(&subscription, event_type, &broadcaster).await
        else {
            debug!(event_type, %broadcaster, "Dropping notification with no owning bot");
            return;
        };

        let key = InterestKey {
            bot_account_id: bot.id,
            event_type: event_type.to_string(),
            broadcaster_user_id: broadcaster.clone(),
        };
        let interests = self.registry.interested(&key);

        let mut envelope = Envelope::for_notification(message_id, event_type, event.clone());
        if event_type.starts_with("channel.chat.") {
            envelope.twitch_chat_assets = self.assets.enrich(&broadcaster).await;
        }

        self.update_channel_state(&bot, event_type, &broadcaster, &event).await;

        if interests.is_empty() {
            return;
        }
        debug!(
            key = %key,
            matched = interests.len(),
            message_id,
            "Fanning out notification"
        );
        for interest in &interests {
            self.fanout.deliver(interest, &envelope).await;
        }
    }

    async fn resolve_bot_for_notification(
        &self,
        subscription: &Value,
        event_type: &str,
        broadcaster: &str,
    ) -> Option<BotAccount> {
        let sub_id = subscription.get("id").and_then(Value::as_str).unwrap_or_default();
        if !sub_id.is_empty() {
            if let Ok(Some(row)) = self.subs.get_by_twitch_id(sub_id).await {
                if let Ok(Some(bot)) = self.bots.get(row.bot_account_id).await {
                    return Some(bot);
                }
            }
        }
        // Legacy rows predate subscription-id mapping; fall back to matching
        // on the condition identity.
        let lookup_id = if event_type.starts_with("channel.chat.") {
            subscription
                .get("condition")
                .and_then(|c| c.get("user_id"))
                .and_then(Value::as_str)
                .unwrap_or(broadcaster)
        } else {
            broadcaster
        };
        self.bots.get_by_twitch_user_id(lookup_id).await.ok().flatten()
    }

    /// Twitch revoked the bot's authorization: the bot cannot serve anything
    /// until an operator reconnects it.
    async fn handle_user_authorization_revoke(&self, event: &Value) {
        let Some(user_id) = event.get("user_id").and_then(Value::as_str) else {
            return;
        };
        let Ok(Some(bot)) = self.bots.get_by_twitch_user_id(user_id).await else {
            return;
        };
        if let Err(e) = self.bots.disable(bot.id).await {
            warn!(bot = %bot.id, "Failed disabling bot after authorization revoke: {e}");
            return;
        }
        warn!(bot = %bot.id, twitch_user_id = user_id, "Disabled bot after user.authorization.revoke");
    }

    /// Mark the mirrored row revoked. The next ensure for the key rotates
    /// it out and recreates.
    pub async fn handle_revocation(&self, payload: &Value) {
        let Some(twitch_id) = payload
            .get("subscription")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
        else {
            return;
        };
        warn!(sub = twitch_id, "Upstream subscription revoked");
        if let Err(e) = self
            .subs
            .update_status(twitch_id, &UpstreamStatus::Revoked)
            .await
        {
            warn!("Failed to mark subscription revoked: {e}");
        }
    }

    async fn update_channel_state(
        &self,
        bot: &BotAccount,
        event_type: &str,
        broadcaster: &str,
        event: &Value,
    ) {
        if event_type != "stream.online" && event_type != "stream.offline" {
            return;
        }
        let is_live = event_type == "stream.online";
        let existing = self
            .channel_states
            .get(bot.id, broadcaster)
            .await
            .ok()
            .flatten();
        let mut state = existing.unwrap_or(ChannelState {
            bot_account_id: bot.id,
            broadcaster_user_id: broadcaster.to_string(),
            is_live: false,
            title: None,
            game_name: None,
            started_at: None,
            last_event_at: None,
            last_checked_at: None,
        });
        state.is_live = is_live;
        state.started_at = if is_live {
            event
                .get("started_at")
                .and_then(Value::as_str)
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
        } else {
            None
        };
        state.last_event_at = Some(Utc::now());
        state.last_checked_at = Some(Utc::now());
        if let Err(e) = self.channel_states.upsert(&state).await {
            debug!("Skipping channel state update: {e}");
        }
    }

    /// Liveness can drift while the bridge is down; re-read it from Helix
    /// for every interested channel after a reconcile.
    pub async fn refresh_channel_states(&self) {
        let mut per_bot: HashMap<Uuid, Vec<String>> = HashMap::new();
        for key in self.registry.keys() {
            if key.event_type == AUTHORIZATION_REVOKE {
                continue;
            }
            let targets = per_bot.entry(key.bot_account_id).or_default();
            if !targets.contains(&key.broadcaster_user_id) {
                targets.push(key.broadcaster_user_id.clone());
            }
        }
        for (bot_id, broadcasters) in per_bot {
            for chunk in broadcasters.chunks(100) {
                let live = match self.twitch.get_streams_by_user_ids(chunk).await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(bot = %bot_id, "Failed refreshing stream states: {e}");
                        continue;
                    }
                };
                for broadcaster in chunk {
                    let stream = live.iter().find(|s| &s.user_id == broadcaster);
                    let state = ChannelState {
                        bot_account_id: bot_id,
                        broadcaster_user_id: broadcaster.clone(),
                        is_live: stream.is_some(),
                        title: stream.map(|s| s.title.clone()),
                        game_name: stream.map(|s| s.game_name.clone()),
                        started_at: stream.and_then(|s| {
                            chrono::DateTime::parse_from_rfc3339(&s.started_at)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc))
                        }),
                        last_event_at: None,
                        last_checked_at: Some(Utc::now()),
                    };
                    if let Err(e) = self.channel_states.upsert(&state).await {
                        debug!("Skipping channel state refresh write: {e}");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // subscription.error fan-out
    // ------------------------------------------------------------------

    /// Tell every service interested in `key` that its upstream
    /// subscription failed, at most once per (service, key, code) per
    /// cooldown window.
    pub async fn emit_subscription_error(&self, key: &InterestKey, err: &Error, upstream: &str) {
        let code = err.subscription_error_code();
        let reason = err.to_string();
        let hint = err.subscription_error_hint();
        for interest in self.registry.interested(key) {
            let throttle_key = format!(
                "{}|{}|{}|{}|{}",
                interest.service_account_id,
                key.bot_account_id,
                key.event_type,
                key.broadcaster_user_id,
                code
            );
            if self.error_throttle.observe(&throttle_key) == Freshness::Duplicate {
                continue;
            }
            let envelope = Envelope::synthetic(
                SUBSCRIPTION_ERROR_TYPE,
                json!({
                    "error_code": code,
                    "reason": reason,
                    "hint": hint,
                    "event_type": key.event_type,
                    "broadcaster_user_id": key.broadcaster_user_id,
                    "bot_account_id": key.bot_account_id.to_string(),
                    "upstream_transport": upstream,
                }),
            );
            self.fanout.deliver(&interest, &envelope).await;
        }
    }

    // ------------------------------------------------------------------
    // Bot tokens
    // ------------------------------------------------------------------

    async fn bot_token_for(&self, bot_account_id: Uuid) -> Result<String, Error> {
        let bot = self
            .bots
            .get(bot_account_id)
            .await?
            .ok_or_else(|| Error::BotNotAccessible(bot_account_id.to_string()))?;
        if !bot.enabled {
            return Err(Error::BotNotAccessible(format!("bot {} is disabled", bot.id)));
        }
        self.ensure_bot_access_token(&bot).await
    }

    /// Return a usable access token, refreshing and persisting when close
    /// to expiry.
    async fn ensure_bot_access_token(&self, bot: &BotAccount) -> Result<String, Error> {
        if bot.token_expires_at > Utc::now() + chrono::Duration::seconds(TOKEN_SKEW_SECONDS) {
            return Ok(bot.access_token.clone());
        }
        let refreshed = self.twitch.refresh_user_token(&bot.refresh_token).await?;
        self.bots
            .update_tokens(
                bot.id,
                &refreshed.access_token,
                &refreshed.refresh_token,
                refreshed.expires_at,
            )
            .await?;
        Ok(refreshed.access_token)
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    enabled: bool,
    connected_at: String,
    id: String,
}

fn error_for_code(code: &str, reason: &str) -> Error {
    match code {
        "insufficient_permissions" => Error::InsufficientPermissions(reason.to_string()),
        "missing_scope" => Error::MissingScope(reason.to_string()),
        "unauthorized" => Error::Unauthorized(reason.to_string()),
        _ => Error::SubscriptionCreateFailed(reason.to_string()),
    }
}
