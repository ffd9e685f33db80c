// src/repositories/postgres/subscriptions.rs

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::models::{InterestKey, UpstreamStatus, UpstreamSubscription};
use crate::repositories::SubscriptionRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: Pool<Postgres>,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    subscription_id,
    bot_account_id,
    event_type,
    broadcaster_user_id,
    twitch_subscription_id,
    status,
    upstream_transport,
    session_id,
    cost,
    last_seen_at,
    created_at
"#;

fn row_to_subscription(r: &PgRow) -> Result<UpstreamSubscription, Error> {
    let status: String = r.try_get("status")?;
    Ok(UpstreamSubscription {
        id: r.try_get("subscription_id")?,
        bot_account_id: r.try_get("bot_account_id")?,
        event_type: r.try_get("event_type")?,
        broadcaster_user_id: r.try_get("broadcaster_user_id")?,
        twitch_subscription_id: r.try_get("twitch_subscription_id")?,
        status: UpstreamStatus::parse(&status),
        upstream_transport: r.try_get("upstream_transport")?,
        session_id: r.try_get("session_id")?,
        cost: r.try_get("cost")?,
        last_seen_at: r.try_get("last_seen_at")?,
        created_at: r.try_get("created_at")?,
    })
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn get_by_key(&self, key: &InterestKey) -> Result<Option<UpstreamSubscription>, Error> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM twitch_subscriptions
            WHERE bot_account_id = $1
              AND event_type = $2
              AND broadcaster_user_id = $3
            "#
        ))
        .bind(key.bot_account_id)
        .bind(&key.event_type)
        .bind(&key.broadcaster_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn get_by_twitch_id(
        &self,
        twitch_subscription_id: &str,
    ) -> Result<Option<UpstreamSubscription>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM twitch_subscriptions WHERE twitch_subscription_id = $1"
        ))
        .bind(twitch_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn insert(&self, sub: &UpstreamSubscription) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO twitch_subscriptions (
                subscription_id,
                bot_account_id,
                event_type,
                broadcaster_user_id,
                twitch_subscription_id,
                status,
                upstream_transport,
                session_id,
                cost,
                last_seen_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (bot_account_id, event_type, broadcaster_user_id) DO UPDATE
               SET
                 twitch_subscription_id = EXCLUDED.twitch_subscription_id,
                 status                 = EXCLUDED.status,
                 upstream_transport     = EXCLUDED.upstream_transport,
                 session_id             = EXCLUDED.session_id,
                 cost                   = EXCLUDED.cost,
                 last_seen_at           = EXCLUDED.last_seen_at
            "#,
        )
        .bind(sub.id)
        .bind(sub.bot_account_id)
        .bind(&sub.event_type)
        .bind(&sub.broadcaster_user_id)
        .bind(&sub.twitch_subscription_id)
        .bind(sub.status.as_str())
        .bind(&sub.upstream_transport)
        .bind(&sub.session_id)
        .bind(sub.cost)
        .bind(sub.last_seen_at)
        .bind(sub.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), Error> {
        sqlx::query("DELETE FROM twitch_subscriptions WHERE subscription_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        twitch_subscription_id: &str,
        status: &UpstreamStatus,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE twitch_subscriptions SET status = $1 WHERE twitch_subscription_id = $2",
        )
        .bind(status.as_str())
        .bind(twitch_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<UpstreamSubscription>, Error> {
        let rows = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM twitch_subscriptions"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn list_by_event_types(
        &self,
        event_types: &[&str],
    ) -> Result<Vec<UpstreamSubscription>, Error> {
        let types: Vec<String> = event_types.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM twitch_subscriptions WHERE event_type = ANY($1)"
        ))
        .bind(&types)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn replace_all(&self, subs: &[UpstreamSubscription]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM twitch_subscriptions")
            .execute(&mut *tx)
            .await?;
        for sub in subs {
            sqlx::query(
                r#"
                INSERT INTO twitch_subscriptions (
                    subscription_id,
                    bot_account_id,
                    event_type,
                    broadcaster_user_id,
                    twitch_subscription_id,
                    status,
                    upstream_transport,
                    session_id,
                    cost,
                    last_seen_at,
                    created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(sub.id)
            .bind(sub.bot_account_id)
            .bind(&sub.event_type)
            .bind(&sub.broadcaster_user_id)
            .bind(&sub.twitch_subscription_id)
            .bind(sub.status.as_str())
            .bind(&sub.upstream_transport)
            .bind(&sub.session_id)
            .bind(sub.cost)
            .bind(sub.last_seen_at)
            .bind(sub.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
