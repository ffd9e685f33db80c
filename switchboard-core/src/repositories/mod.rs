// src/repositories/mod.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BotAccount, ChannelState, Interest, InterestKey, ServiceAccount, UpstreamStatus,
    UpstreamSubscription,
};
use crate::Error;

pub mod postgres;

pub use postgres::{
    PostgresBotAccountRepository, PostgresChannelStateRepository, PostgresInterestRepository,
    PostgresRuntimeStatsRepository, PostgresServiceAccountRepository,
    PostgresSubscriptionRepository,
};

/// True when `err` is the unique-tuple conflict raised by a concurrent
/// insert; callers recover by re-reading.
pub fn is_unique_violation(err: &Error) -> bool {
    match err {
        Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
pub trait InterestRepository: Send + Sync {
    async fn insert(&self, interest: &Interest) -> Result<(), Error>;
    async fn get(&self, interest_id: Uuid) -> Result<Option<Interest>, Error>;
    async fn find_unique(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        event_type: &str,
        broadcaster_user_id: &str,
        transport: &str,
        webhook_url: Option<&str>,
    ) -> Result<Option<Interest>, Error>;
    async fn list_all(&self) -> Result<Vec<Interest>, Error>;
    async fn list_for_service(&self, service_account_id: Uuid) -> Result<Vec<Interest>, Error>;
    async fn delete(&self, interest_id: Uuid) -> Result<bool, Error>;
    /// Group heartbeat: touch every interest of `service` on the same
    /// (bot, broadcaster) pair.
    async fn touch_group(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, Error>;
    async fn touch_all(&self, service_account_id: Uuid, now: DateTime<Utc>) -> Result<u64, Error>;
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Interest>, Error>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get_by_key(&self, key: &InterestKey) -> Result<Option<UpstreamSubscription>, Error>;
    async fn get_by_twitch_id(
        &self,
        twitch_subscription_id: &str,
    ) -> Result<Option<UpstreamSubscription>, Error>;
    async fn insert(&self, sub: &UpstreamSubscription) -> Result<(), Error>;
    async fn delete(&self, id: Uuid) -> Result<(), Error>;
    async fn update_status(
        &self,
        twitch_subscription_id: &str,
        status: &UpstreamStatus,
    ) -> Result<(), Error>;
    async fn list_all(&self) -> Result<Vec<UpstreamSubscription>, Error>;
    async fn list_by_event_types(
        &self,
        event_types: &[&str],
    ) -> Result<Vec<UpstreamSubscription>, Error>;
    /// Atomically replace the whole mirror with the reconciled snapshot.
    async fn replace_all(&self, subs: &[UpstreamSubscription]) -> Result<(), Error>;
}

#[async_trait]
pub trait BotAccountRepository: Send + Sync {
    async fn get(&self, bot_account_id: Uuid) -> Result<Option<BotAccount>, Error>;
    async fn get_by_twitch_user_id(&self, twitch_user_id: &str)
        -> Result<Option<BotAccount>, Error>;
    async fn update_tokens(
        &self,
        bot_account_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error>;
    /// Disable the bot and wipe its tokens (user.authorization.revoke).
    async fn disable(&self, bot_account_id: Uuid) -> Result<(), Error>;
    async fn list_enabled(&self) -> Result<Vec<BotAccount>, Error>;
}

#[async_trait]
pub trait ServiceAccountRepository: Send + Sync {
    async fn get(&self, service_account_id: Uuid) -> Result<Option<ServiceAccount>, Error>;
    async fn get_by_client_id(&self, client_id: &str) -> Result<Option<ServiceAccount>, Error>;
}

#[async_trait]
pub trait ChannelStateRepository: Send + Sync {
    async fn get(
        &self,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
    ) -> Result<Option<ChannelState>, Error>;
    async fn upsert(&self, state: &ChannelState) -> Result<(), Error>;
}

#[async_trait]
pub trait RuntimeStatsRepository: Send + Sync {
    async fn record_ws_connect(&self, service_account_id: Uuid) -> Result<(), Error>;
    async fn record_ws_disconnect(&self, service_account_id: Uuid) -> Result<(), Error>;
    async fn record_ws_event(&self, service_account_id: Uuid) -> Result<(), Error>;
    async fn record_webhook_event(&self, service_account_id: Uuid) -> Result<(), Error>;
    async fn record_webhook_failure(&self, service_account_id: Uuid) -> Result<(), Error>;
    async fn record_api_request(&self, service_account_id: Uuid) -> Result<(), Error>;
    /// Connection counters survive restarts; zero them at boot.
    async fn reset_connection_counts(&self) -> Result<(), Error>;
}
