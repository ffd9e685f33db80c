// src/repositories/postgres/bot_accounts.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::models::BotAccount;
use crate::repositories::BotAccountRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresBotAccountRepository {
    pool: Pool<Postgres>,
}

impl PostgresBotAccountRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    bot_account_id,
    name,
    twitch_user_id,
    twitch_login,
    access_token,
    refresh_token,
    token_expires_at,
    enabled
"#;

fn row_to_bot(r: &PgRow) -> Result<BotAccount, Error> {
    Ok(BotAccount {
        id: r.try_get("bot_account_id")?,
        name: r.try_get("name")?,
        twitch_user_id: r.try_get("twitch_user_id")?,
        twitch_login: r.try_get("twitch_login")?,
        access_token: r.try_get("access_token")?,
        refresh_token: r.try_get("refresh_token")?,
        token_expires_at: r.try_get("token_expires_at")?,
        enabled: r.try_get("enabled")?,
    })
}

#[async_trait]
impl BotAccountRepository for PostgresBotAccountRepository {
    async fn get(&self, bot_account_id: Uuid) -> Result<Option<BotAccount>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bot_accounts WHERE bot_account_id = $1"
        ))
        .bind(bot_account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_bot).transpose()
    }

    async fn get_by_twitch_user_id(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<BotAccount>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bot_accounts WHERE twitch_user_id = $1"
        ))
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_bot).transpose()
    }

    async fn update_tokens(
        &self,
        bot_account_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE bot_accounts
            SET access_token = $1, refresh_token = $2, token_expires_at = $3, updated_at = NOW()
            WHERE bot_account_id = $4
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(bot_account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disable(&self, bot_account_id: Uuid) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE bot_accounts
            SET enabled = FALSE, access_token = '', refresh_token = '', updated_at = NOW()
            WHERE bot_account_id = $1
            "#,
        )
        .bind(bot_account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<BotAccount>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bot_accounts WHERE enabled = TRUE"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_bot).collect()
    }
}
