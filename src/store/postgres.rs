//! Postgres-backed definition store.
//!
//! Endpoints live in one table keyed by `(fanout_name, endpoint_name)`
//! with the HTTP descriptor as a JSON document. Mutators run in a single
//! transaction and re-check the primary-count and endpoint-cap
//! invariants with `COUNT(*)` queries before committing.

use super::{FanoutStore, FanoutUpdate, Result, StoreError, MAX_ENDPOINTS};
use crate::model::{validate_name, Destination, Endpoint, HttpEndpoint};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};

/// Definition store over a Postgres connection pool
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given DSN.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().connect(dsn).await?;
        Ok(Self::new(pool))
    }

    async fn insert_endpoint(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fanout: &str,
        endpoint: &Endpoint,
    ) -> Result<()> {
        validate_name(&endpoint.name)?;
        let document = encode_destination(endpoint)?;
        sqlx::query(
            "INSERT INTO endpoints \
               (fanout_name, endpoint_name, is_primary, http_endpoint, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, NOW(), NOW())",
        )
        .bind(fanout)
        .bind(&endpoint.name)
        .bind(endpoint.primary)
        .bind(document)
        .execute(&mut **tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateEndpoint(endpoint.name.clone())
            }
            other => StoreError::Database(other),
        })?;
        Ok(())
    }

    async fn update_endpoint(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fanout: &str,
        endpoint: &Endpoint,
    ) -> Result<()> {
        let document = encode_destination(endpoint)?;
        sqlx::query(
            "UPDATE endpoints \
             SET is_primary = $1, http_endpoint = $2, updated_at = NOW() \
             WHERE fanout_name = $3 AND endpoint_name = $4",
        )
        .bind(endpoint.primary)
        .bind(document)
        .bind(fanout)
        .bind(&endpoint.name)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Re-check the write invariants inside the transaction.
    async fn validate_fanout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fanout: &str,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM endpoints \
             WHERE fanout_name = $1 AND is_primary = TRUE",
        )
        .bind(fanout)
        .fetch_one(&mut **tx)
        .await?;
        let primaries: i64 = row.try_get(0)?;
        if primaries != 1 {
            return Err(StoreError::PrimaryCount(primaries));
        }

        let row = sqlx::query("SELECT COUNT(*) FROM endpoints WHERE fanout_name = $1")
            .bind(fanout)
            .fetch_one(&mut **tx)
            .await?;
        let total: i64 = row.try_get(0)?;
        if total as usize > MAX_ENDPOINTS {
            return Err(StoreError::TooManyEndpoints(total as usize));
        }
        Ok(())
    }
}

#[async_trait]
impl FanoutStore for PostgresStore {
    async fn get_fanout(&self, name: &str) -> Result<Vec<Endpoint>> {
        let rows = sqlx::query(
            "SELECT endpoint_name, is_primary, http_endpoint \
             FROM endpoints \
             WHERE fanout_name = $1 \
             ORDER BY is_primary DESC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut endpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let endpoint_name: String = row.try_get(0)?;
            let primary: bool = row.try_get(1)?;
            let document: String = row.try_get(2)?;
            let http: HttpEndpoint = serde_json::from_str(&document)
                .map_err(|e| StoreError::MalformedRecord(endpoint_name.clone(), e.to_string()))?;
            endpoints.push(Endpoint {
                name: endpoint_name,
                primary,
                destination: Destination::Http(http),
            });
        }
        Ok(endpoints)
    }

    async fn create_fanout(&self, name: &str, endpoints: &[Endpoint]) -> Result<()> {
        validate_name(name)?;
        if endpoints.len() > MAX_ENDPOINTS {
            return Err(StoreError::TooManyEndpoints(endpoints.len()));
        }

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        for endpoint in endpoints {
            self.insert_endpoint(&mut tx, name, endpoint).await?;
        }
        self.validate_fanout(&mut tx, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_fanout(&self, name: &str, update: FanoutUpdate) -> Result<()> {
        validate_name(name)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        for endpoint_name in &update.delete {
            sqlx::query("DELETE FROM endpoints WHERE fanout_name = $1 AND endpoint_name = $2")
                .bind(name)
                .bind(endpoint_name)
                .execute(&mut *tx)
                .await?;
        }
        for endpoint in &update.insert {
            self.insert_endpoint(&mut tx, name, endpoint).await?;
        }
        for endpoint in &update.update {
            self.update_endpoint(&mut tx, name, endpoint).await?;
        }

        self.validate_fanout(&mut tx, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_fanout(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM endpoints WHERE fanout_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_destination(endpoint: &Endpoint) -> Result<String> {
    serde_json::to_string(endpoint.http())
        .map_err(|e| StoreError::MalformedRecord(endpoint.name.clone(), e.to_string()))
}
