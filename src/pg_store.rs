use std::str::FromStr;

use anyhow::Result;
use axum::async_trait;
use sqlx::{Pool, Postgres, Row};

use crate::store::{KeyValueStore, ReadOptions, StoreError};

refinery::embed_migrations!("migrations");

/// A durable `KeyValueStore` implementation keeping one row per key in postgres.
///
/// The freshness hint is not interpreted here; wrap the store in an
/// `EdgeCachedStore` to honor it.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(anyhow::Error::from(e))
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str, _options: ReadOptions) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = $1")
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => {
                let value: String = row.try_get(0).map_err(|_|StoreError::InvalidValue(key.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()"
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

/// Brings the `kv_entries` schema up to date over a dedicated connection.
async fn migrate_db(url: &str) -> Result<()> {
    let mut pg_config = tokio_postgres::Config::from_str(url)?;
    pg_config.application_name("edgekv-migrations");
    let (mut client, connection) = pg_config.connect(tokio_postgres::NoTls).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("migration connection failed: {e}");
        }
    });

    let report = migrations::runner().run_async(&mut client).await;
    drop(client);
    let _ = driver.await;

    let applied = report?.applied_migrations().iter().map(ToString::to_string).collect::<Vec<_>>();
    if applied.is_empty() {
        log::debug!("kv_entries schema is current");
    } else {
        log::info!("kv_entries migrations applied: {}", applied.join(", "));
    }
    Ok(())
}

/// Migrates the database at `url` and returns a pool connected to it.
pub async fn connect_db(url: &str) -> Result<Pool<Postgres>> {
    migrate_db(url).await?;

    Ok(Pool::connect(url).await?)
}
