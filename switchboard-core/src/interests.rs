// src/interests.rs
//
// Persistent interest operations: upsert with broadcaster resolution and
// companion interests, deletion, group heartbeats and stale pruning. Writes
// go to the repository first, then the in-memory registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::catalog;
use crate::models::{CreateInterestRequest, DeliveryRoute, Interest, InterestKey};
use crate::registry::InterestRegistry;
use crate::repositories::{is_unique_violation, BotAccountRepository, InterestRepository};
use crate::twitch::TwitchClient;
use crate::Error;

/// Interests auto-created alongside any new interest on the same
/// (service, bot, broadcaster).
const COMPANION_EVENT_TYPES: [&str; 2] = ["stream.online", "stream.offline"];

pub struct UpsertOutcome {
    pub interest: Interest,
    pub created: bool,
    /// Keys needing an upstream ensure: the primary (when newly created)
    /// plus any newly created companions.
    pub ensure_keys: Vec<InterestKey>,
}

pub struct InterestService {
    interests: Arc<dyn InterestRepository>,
    bots: Arc<dyn BotAccountRepository>,
    registry: Arc<InterestRegistry>,
    twitch: Arc<TwitchClient>,
}

impl InterestService {
    pub fn new(
        interests: Arc<dyn InterestRepository>,
        bots: Arc<dyn BotAccountRepository>,
        registry: Arc<InterestRegistry>,
        twitch: Arc<TwitchClient>,
    ) -> Self {
        Self {
            interests,
            bots,
            registry,
            twitch,
        }
    }

    /// Fill the registry from the persisted rows at boot.
    pub async fn load(&self) -> Result<usize, Error> {
        let rows = self.interests.list_all().await?;
        let count = rows.len();
        self.registry.load(rows);
        info!("Loaded {count} interests into the registry");
        Ok(count)
    }

    pub async fn upsert(
        &self,
        service_account_id: Uuid,
        req: &CreateInterestRequest,
    ) -> Result<UpsertOutcome, Error> {
        let event_type = req.event_type.trim().to_lowercase();
        if !catalog::is_known_event_type(&event_type) {
            return Err(Error::UnknownEventType(req.event_type.clone()));
        }

        let route = DeliveryRoute::from_columns(
            req.transport.trim(),
            req.webhook_url.clone().filter(|u| !u.trim().is_empty()),
        )?;
        if let DeliveryRoute::Webhook { url } = &route {
            validate_webhook_target(url)?;
        }

        let bot = self
            .bots
            .get(req.bot_account_id)
            .await?
            .ok_or_else(|| Error::BotNotAccessible(req.bot_account_id.to_string()))?;
        if !bot.enabled {
            return Err(Error::BotNotAccessible(format!("bot {} is disabled", bot.id)));
        }

        let broadcaster_user_id = self.resolve_broadcaster(&req.broadcaster_user_id).await?;

        let now = Utc::now();
        if let Some(existing) = self
            .interests
            .find_unique(
                service_account_id,
                bot.id,
                &event_type,
                &broadcaster_user_id,
                route.kind(),
                route.webhook_url(),
            )
            .await?
        {
            // Idempotent re-create: refresh the whole heartbeat group.
            self.interests
                .touch_group(service_account_id, bot.id, &broadcaster_user_id, now)
                .await?;
            let mut refreshed = existing.clone();
            refreshed.updated_at = now;
            refreshed.last_heartbeat_at = now;
            self.registry.replace(refreshed.clone());
            return Ok(UpsertOutcome {
                interest: refreshed,
                created: false,
                ensure_keys: Vec::new(),
            });
        }

        let interest = Interest {
            id: Uuid::new_v4(),
            service_account_id,
            bot_account_id: bot.id,
            event_type: event_type.clone(),
            broadcaster_user_id: broadcaster_user_id.clone(),
            route,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: now,
        };

        let interest = match self.interests.insert(&interest).await {
            Ok(()) => interest,
            Err(err) if is_unique_violation(&err) => {
                // Lost the insert race; the winner's row is the answer.
                debug!("Interest insert raced; re-reading the winner");
                self.interests
                    .find_unique(
                        service_account_id,
                        interest.bot_account_id,
                        &interest.event_type,
                        &interest.broadcaster_user_id,
                        interest.route.kind(),
                        interest.route.webhook_url(),
                    )
                    .await?
                    .ok_or(err)?
            }
            Err(err) => return Err(err),
        };

        let key = self.registry.add(interest.clone());
        let mut ensure_keys = vec![key];

        for companion in self
            .ensure_companion_interests(service_account_id, bot.id, &broadcaster_user_id)
            .await?
        {
            ensure_keys.push(self.registry.add(companion));
        }

        Ok(UpsertOutcome {
            interest,
            created: true,
            ensure_keys,
        })
    }

    /// Auto-create stream.online/stream.offline ws interests so every
    /// consumer can track liveness for channels it watches. Existing rows
    /// for the (service, bot, event, broadcaster) group are left alone
    /// whatever their transport.
    async fn ensure_companion_interests(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
    ) -> Result<Vec<Interest>, Error> {
        let mut created = Vec::new();
        let service_rows = self.interests.list_for_service(service_account_id).await?;
        for event_type in COMPANION_EVENT_TYPES {
            let exists = service_rows.iter().any(|row| {
                row.bot_account_id == bot_account_id
                    && row.event_type == event_type
                    && row.broadcaster_user_id == broadcaster_user_id
            });
            if exists {
                continue;
            }
            let now = Utc::now();
            let companion = Interest {
                id: Uuid::new_v4(),
                service_account_id,
                bot_account_id,
                event_type: event_type.to_string(),
                broadcaster_user_id: broadcaster_user_id.to_string(),
                route: DeliveryRoute::Ws,
                created_at: now,
                updated_at: now,
                last_heartbeat_at: now,
            };
            match self.interests.insert(&companion).await {
                Ok(()) => created.push(companion),
                Err(err) if is_unique_violation(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }

    /// Remove one interest. Returns its key and whether other interests
    /// still share it (when not, the caller releases the upstream sub).
    pub async fn delete(
        &self,
        service_account_id: Uuid,
        interest_id: Uuid,
    ) -> Result<(InterestKey, bool), Error> {
        let interest = self
            .interests
            .get(interest_id)
            .await?
            .filter(|row| row.service_account_id == service_account_id)
            .ok_or_else(|| Error::NotFound(format!("interest {interest_id}")))?;
        self.interests.delete(interest_id).await?;
        let (key, still_used) = self
            .registry
            .remove(interest_id)
            .unwrap_or((interest.key(), self.registry.has_key(&interest.key())));
        Ok((key, still_used))
    }

    /// Group heartbeat: touching one interest keeps every interest of the
    /// same (service, bot, broadcaster) cluster alive.
    pub async fn heartbeat(
        &self,
        service_account_id: Uuid,
        interest_id: Uuid,
    ) -> Result<u64, Error> {
        let interest = self
            .interests
            .get(interest_id)
            .await?
            .filter(|row| row.service_account_id == service_account_id)
            .ok_or_else(|| Error::NotFound(format!("interest {interest_id}")))?;
        let now = Utc::now();
        let touched = self
            .interests
            .touch_group(
                service_account_id,
                interest.bot_account_id,
                &interest.broadcaster_user_id,
                now,
            )
            .await?;
        self.touch_registry_group(
            service_account_id,
            interest.bot_account_id,
            &interest.broadcaster_user_id,
            now,
        );
        Ok(touched)
    }

    pub async fn heartbeat_all(&self, service_account_id: Uuid) -> Result<u64, Error> {
        let now = Utc::now();
        let touched = self.interests.touch_all(service_account_id, now).await?;
        for mut interest in self.registry.interests_for_service(service_account_id) {
            interest.updated_at = now;
            interest.last_heartbeat_at = now;
            self.registry.replace(interest);
        }
        Ok(touched)
    }

    fn touch_registry_group(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
        now: DateTime<Utc>,
    ) {
        for mut interest in self.registry.interests_for_service(service_account_id) {
            if interest.bot_account_id == bot_account_id
                && interest.broadcaster_user_id == broadcaster_user_id
            {
                interest.updated_at = now;
                interest.last_heartbeat_at = now;
                self.registry.replace(interest);
            }
        }
    }

    pub async fn list_for_service(
        &self,
        service_account_id: Uuid,
    ) -> Result<Vec<Interest>, Error> {
        self.interests.list_for_service(service_account_id).await
    }

    /// Drop interests whose heartbeat is older than `cutoff`. Returns each
    /// removed interest's key with its remaining-use flag so the caller can
    /// release orphaned upstream subscriptions.
    pub async fn prune_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(InterestKey, bool)>, Error> {
        let stale = self.interests.list_stale(cutoff).await?;
        let mut removed = Vec::new();
        for interest in stale {
            if let Err(e) = self.interests.delete(interest.id).await {
                warn!(interest = %interest.id, "Failed deleting stale interest: {e}");
                continue;
            }
            info!(
                interest = %interest.id,
                key = %interest.key(),
                "Pruned stale interest"
            );
            let entry = self
                .registry
                .remove(interest.id)
                .unwrap_or((interest.key(), self.registry.has_key(&interest.key())));
            removed.push(entry);
        }
        Ok(removed)
    }

    /// Accept a numeric id, a Twitch login, or a twitch.tv channel URL.
    async fn resolve_broadcaster(&self, raw: &str) -> Result<String, Error> {
        let token = normalize_broadcaster_input(raw);
        if token.is_empty() {
            return Err(Error::InvalidBroadcaster("broadcaster is required".into()));
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            return Ok(token);
        }
        let login = token.to_lowercase();
        let user = self
            .twitch
            .get_user_by_login(&login)
            .await
            .map_err(|e| Error::InvalidBroadcaster(format!("login lookup failed: {e}")))?
            .ok_or_else(|| Error::InvalidBroadcaster(format!("login '{login}' not found")))?;
        if user.id.is_empty() {
            return Err(Error::InvalidBroadcaster("user lookup returned empty id".into()));
        }
        Ok(user.id)
    }
}

/// Strip a twitch.tv URL, @-prefix or trailing path down to the bare
/// id/login token.
pub fn normalize_broadcaster_input(raw: &str) -> String {
    let mut value = raw.trim().to_string();
    if value.starts_with("http://") || value.starts_with("https://") {
        if let Ok(parsed) = Url::parse(&value) {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            if host.ends_with("twitch.tv") {
                if let Some(mut segments) = parsed.path_segments() {
                    if let Some(first) = segments.find(|s| !s.is_empty()) {
                        value = first.to_string();
                    }
                }
            }
        }
    }
    let value = value.trim().trim_start_matches('@');
    let value = value.split('/').next().unwrap_or_default();
    let value = value.split('?').next().unwrap_or_default();
    value.trim().to_string()
}

fn validate_webhook_target(raw: &str) -> Result<(), Error> {
    let parsed = Url::parse(raw)
        .map_err(|e| Error::InvalidWebhookTarget(format!("unparseable url: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(Error::InvalidWebhookTarget(
            "webhook_url must use http or https".into(),
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(Error::InvalidWebhookTarget(
            "webhook_url must not contain userinfo credentials".into(),
        ));
    }
    let host = parsed.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err(Error::InvalidWebhookTarget("webhook_url host is required".into()));
    }
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") || host.ends_with(".internal") {
        return Err(Error::InvalidWebhookTarget(
            "webhook_url target host is not public".into(),
        ));
    }
    match parsed.host() {
        Some(url::Host::Ipv4(v4)) if !is_public_ipv4(&v4) => {
            return Err(Error::InvalidWebhookTarget(
                "webhook_url target IP must be public".into(),
            ))
        }
        Some(url::Host::Ipv6(v6)) if !is_public_ipv6(&v6) => {
            return Err(Error::InvalidWebhookTarget(
                "webhook_url target IP must be public".into(),
            ))
        }
        _ => {}
    }
    Ok(())
}

fn is_public_ipv4(v4: &std::net::Ipv4Addr) -> bool {
    // 240.0.0.0/4 covers the reserved block plus broadcast.
    !(v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_multicast()
        || v4.is_unspecified()
        || v4.is_documentation()
        || v4.octets()[0] >= 240)
}

fn is_public_ipv6(v6: &std::net::Ipv6Addr) -> bool {
    let seg = v6.segments();
    let unique_local = (seg[0] & 0xfe00) == 0xfc00;
    let link_local = (seg[0] & 0xffc0) == 0xfe80;
    let mapped_non_public = v6.to_ipv4().map_or(false, |v4| !is_public_ipv4(&v4));
    !(v6.is_loopback()
        || v6.is_unspecified()
        || v6.is_multicast()
        || unique_local
        || link_local
        || mapped_non_public)
}
