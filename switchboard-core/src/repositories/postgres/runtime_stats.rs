// src/repositories/postgres/runtime_stats.rs

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::repositories::RuntimeStatsRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresRuntimeStatsRepository {
    pool: Pool<Postgres>,
}

impl PostgresRuntimeStatsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn bump(&self, service_account_id: Uuid, set_clause: &str) -> Result<(), Error> {
        // Every counter update goes through the same upsert so a service's
        // first event creates its stats row.
        sqlx::query(
            r#"
            INSERT INTO service_runtime_stats (service_account_id)
            VALUES ($1)
            ON CONFLICT (service_account_id) DO NOTHING
            "#,
        )
        .bind(service_account_id)
        .execute(&self.pool)
        .await?;
        let sql =
            format!("UPDATE service_runtime_stats SET {set_clause} WHERE service_account_id = $1");
        sqlx::query(&sql)
            .bind(service_account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RuntimeStatsRepository for PostgresRuntimeStatsRepository {
    async fn record_ws_connect(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "active_ws_connections = active_ws_connections + 1, \
             total_ws_connects = total_ws_connects + 1, \
             last_connected_at = NOW()",
        )
        .await
    }

    async fn record_ws_disconnect(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "active_ws_connections = GREATEST(active_ws_connections - 1, 0), \
             last_disconnected_at = NOW()",
        )
        .await
    }

    async fn record_ws_event(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "total_events_sent_ws = total_events_sent_ws + 1, last_event_sent_at = NOW()",
        )
        .await
    }

    async fn record_webhook_event(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "total_events_sent_webhook = total_events_sent_webhook + 1, \
             last_event_sent_at = NOW()",
        )
        .await
    }

    async fn record_webhook_failure(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "total_webhook_failures = total_webhook_failures + 1",
        )
        .await
    }

    async fn record_api_request(&self, service_account_id: Uuid) -> Result<(), Error> {
        self.bump(
            service_account_id,
            "total_api_requests = total_api_requests + 1, last_api_request_at = NOW()",
        )
        .await
    }

    async fn reset_connection_counts(&self) -> Result<(), Error> {
        sqlx::query("UPDATE service_runtime_stats SET active_ws_connections = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
