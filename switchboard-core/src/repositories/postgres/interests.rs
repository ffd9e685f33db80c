// src/repositories/postgres/interests.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::models::{DeliveryRoute, Interest};
use crate::repositories::InterestRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresInterestRepository {
    pool: Pool<Postgres>,
}

impl PostgresInterestRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_interest(r: &PgRow) -> Result<Interest, Error> {
    let transport: String = r.try_get("transport")?;
    let webhook_url: Option<String> = r.try_get("webhook_url")?;
    Ok(Interest {
        id: r.try_get("interest_id")?,
        service_account_id: r.try_get("service_account_id")?,
        bot_account_id: r.try_get("bot_account_id")?,
        event_type: r.try_get("event_type")?,
        broadcaster_user_id: r.try_get("broadcaster_user_id")?,
        route: DeliveryRoute::from_columns(&transport, webhook_url)?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        last_heartbeat_at: r.try_get("last_heartbeat_at")?,
    })
}

const SELECT_COLUMNS: &str = r#"
    interest_id,
    service_account_id,
    bot_account_id,
    event_type,
    broadcaster_user_id,
    transport,
    webhook_url,
    created_at,
    updated_at,
    last_heartbeat_at
"#;

#[async_trait]
impl InterestRepository for PostgresInterestRepository {
    async fn insert(&self, interest: &Interest) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO service_interests (
                interest_id,
                service_account_id,
                bot_account_id,
                event_type,
                broadcaster_user_id,
                transport,
                webhook_url,
                created_at,
                updated_at,
                last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(interest.id)
        .bind(interest.service_account_id)
        .bind(interest.bot_account_id)
        .bind(&interest.event_type)
        .bind(&interest.broadcaster_user_id)
        .bind(interest.route.kind())
        .bind(interest.route.webhook_url())
        .bind(interest.created_at)
        .bind(interest.updated_at)
        .bind(interest.last_heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, interest_id: Uuid) -> Result<Option<Interest>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM service_interests WHERE interest_id = $1"
        ))
        .bind(interest_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_interest).transpose()
    }

    async fn find_unique(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        event_type: &str,
        broadcaster_user_id: &str,
        transport: &str,
        webhook_url: Option<&str>,
    ) -> Result<Option<Interest>, Error> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM service_interests
            WHERE service_account_id = $1
              AND bot_account_id = $2
              AND event_type = $3
              AND broadcaster_user_id = $4
              AND transport = $5
              AND webhook_url IS NOT DISTINCT FROM $6
            "#
        ))
        .bind(service_account_id)
        .bind(bot_account_id)
        .bind(event_type)
        .bind(broadcaster_user_id)
        .bind(transport)
        .bind(webhook_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_interest).transpose()
    }

    async fn list_all(&self) -> Result<Vec<Interest>, Error> {
        let rows = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM service_interests"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_interest).collect()
    }

    async fn list_for_service(&self, service_account_id: Uuid) -> Result<Vec<Interest>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM service_interests WHERE service_account_id = $1"
        ))
        .bind(service_account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_interest).collect()
    }

    async fn delete(&self, interest_id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM service_interests WHERE interest_id = $1")
            .bind(interest_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_group(
        &self,
        service_account_id: Uuid,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE service_interests
            SET updated_at = $1, last_heartbeat_at = $1
            WHERE service_account_id = $2
              AND bot_account_id = $3
              AND broadcaster_user_id = $4
            "#,
        )
        .bind(now)
        .bind(service_account_id)
        .bind(bot_account_id)
        .bind(broadcaster_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn touch_all(&self, service_account_id: Uuid, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE service_interests
            SET updated_at = $1, last_heartbeat_at = $1
            WHERE service_account_id = $2
            "#,
        )
        .bind(now)
        .bind(service_account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Interest>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM service_interests WHERE last_heartbeat_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_interest).collect()
    }
}
