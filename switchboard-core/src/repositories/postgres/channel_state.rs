// src/repositories/postgres/channel_state.rs

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::models::ChannelState;
use crate::repositories::ChannelStateRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresChannelStateRepository {
    pool: Pool<Postgres>,
}

impl PostgresChannelStateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_state(r: &PgRow) -> Result<ChannelState, Error> {
    Ok(ChannelState {
        bot_account_id: r.try_get("bot_account_id")?,
        broadcaster_user_id: r.try_get("broadcaster_user_id")?,
        is_live: r.try_get("is_live")?,
        title: r.try_get("title")?,
        game_name: r.try_get("game_name")?,
        started_at: r.try_get("started_at")?,
        last_event_at: r.try_get("last_event_at")?,
        last_checked_at: r.try_get("last_checked_at")?,
    })
}

#[async_trait]
impl ChannelStateRepository for PostgresChannelStateRepository {
    async fn get(
        &self,
        bot_account_id: Uuid,
        broadcaster_user_id: &str,
    ) -> Result<Option<ChannelState>, Error> {
        let row = sqlx::query(
            r#"
            SELECT
                bot_account_id, broadcaster_user_id, is_live, title, game_name,
                started_at, last_event_at, last_checked_at
            FROM channel_states
            WHERE bot_account_id = $1 AND broadcaster_user_id = $2
            "#,
        )
        .bind(bot_account_id)
        .bind(broadcaster_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    async fn upsert(&self, state: &ChannelState) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO channel_states (
                bot_account_id,
                broadcaster_user_id,
                is_live,
                title,
                game_name,
                started_at,
                last_event_at,
                last_checked_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (bot_account_id, broadcaster_user_id) DO UPDATE
               SET
                 is_live         = EXCLUDED.is_live,
                 title           = EXCLUDED.title,
                 game_name       = EXCLUDED.game_name,
                 started_at      = EXCLUDED.started_at,
                 last_event_at   = EXCLUDED.last_event_at,
                 last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(state.bot_account_id)
        .bind(&state.broadcaster_user_id)
        .bind(state.is_live)
        .bind(&state.title)
        .bind(&state.game_name)
        .bind(state.started_at)
        .bind(state.last_event_at)
        .bind(state.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
