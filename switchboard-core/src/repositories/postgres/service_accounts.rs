// src/repositories/postgres/service_accounts.rs

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::models::ServiceAccount;
use crate::repositories::ServiceAccountRepository;
use crate::Error;

#[derive(Clone)]
pub struct PostgresServiceAccountRepository {
    pool: Pool<Postgres>,
}

impl PostgresServiceAccountRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_service(r: &PgRow) -> Result<ServiceAccount, Error> {
    Ok(ServiceAccount {
        id: r.try_get("service_account_id")?,
        name: r.try_get("name")?,
        client_id: r.try_get("client_id")?,
        client_secret_hash: r.try_get("client_secret_hash")?,
        enabled: r.try_get("enabled")?,
    })
}

const SELECT_COLUMNS: &str =
    "service_account_id, name, client_id, client_secret_hash, enabled";

#[async_trait]
impl ServiceAccountRepository for PostgresServiceAccountRepository {
    async fn get(&self, service_account_id: Uuid) -> Result<Option<ServiceAccount>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM service_accounts WHERE service_account_id = $1"
        ))
        .bind(service_account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_service).transpose()
    }

    async fn get_by_client_id(&self, client_id: &str) -> Result<Option<ServiceAccount>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM service_accounts WHERE client_id = $1"
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_service).transpose()
    }
}
