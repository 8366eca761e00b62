use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{info, instrument, warn};

use super::{collect_keys, AddressSource, LocationCache, PendingQuery};
use crate::address::{AddressKey, CacheEntry, Coordinates};
use crate::config::DatabaseConfig;
use crate::errors::{AppError, AppResult};

// `COLLATE "C"` gives byte-wise ordering regardless of the database locale.
const PENDING_SQL: &str = r#"
    WITH ranked AS (
        SELECT
            UPPER(BTRIM(address, E' \t\r\n')) COLLATE "C" AS address_key,
            DENSE_RANK() OVER (PARTITION BY source_name ORDER BY filename_date DESC) AS rnk
        FROM marts.unified_listings_vw
        WHERE address IS NOT NULL
          AND BTRIM(address, E' \t\r\n') <> ''
    )
    SELECT DISTINCT ranked.address_key
    FROM ranked
    WHERE (NOT $1::boolean OR ranked.rnk = 1)
      AND NOT EXISTS (
          SELECT 1
          FROM public.locations_cache cache
          WHERE UPPER(BTRIM(cache.address_key, E' \t\r\n')) = ranked.address_key
      )
    ORDER BY ranked.address_key
    LIMIT $2
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO public.locations_cache (address_key, latitude, longitude, updated_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (address_key) DO UPDATE
    SET latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        updated_at = EXCLUDED.updated_at
"#;

const SELECT_ENTRY_SQL: &str = r#"
    SELECT latitude, longitude, updated_at
    FROM public.locations_cache
    WHERE address_key = $1
"#;

/// Reporting warehouse backend. Holds a single pooled connection for the run.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // Never record the connection settings in spans; they carry credentials.
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        info!("connected to reporting database");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("reporting database connection closed");
    }
}

fn connect_options(config: &DatabaseConfig) -> AppResult<PgConnectOptions> {
    let options = match config {
        DatabaseConfig::PostgresUri(uri) => PgConnectOptions::from_str(uri.expose_secret())?,
        DatabaseConfig::PostgresParts(parts) => {
            let mut options = PgConnectOptions::new()
                .host(&parts.host)
                .port(parts.port)
                .username(&parts.user)
                .database(&parts.database);
            if let Some(password) = &parts.password {
                options = options.password(password.expose_secret());
            }
            options
        }
        DatabaseConfig::Sqlite(path) => {
            return Err(AppError::Config(format!(
                "{} is a sqlite database, not a postgres connection",
                path.display()
            )))
        }
    };
    // Transaction-mode poolers (Supabase, PgBouncer) reject named prepared statements.
    Ok(options.statement_cache_capacity(0))
}

#[async_trait]
impl AddressSource for PgStore {
    async fn fetch_pending(&self, query: &PendingQuery) -> AppResult<Vec<AddressKey>> {
        let rows: Vec<String> = sqlx::query_scalar(PENDING_SQL)
            .bind(query.latest_only)
            .bind(query.limit.map(i64::from))
            .fetch_all(&self.pool)
            .await?;
        Ok(collect_keys(rows))
    }
}

#[async_trait]
impl LocationCache for PgStore {
    async fn upsert(&self, entry: &CacheEntry) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let written = sqlx::query(UPSERT_SQL)
            .bind(entry.address_key.as_str())
            .bind(entry.coordinates.latitude)
            .bind(entry.coordinates.longitude)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await;

        match written {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        address = %entry.address_key,
                        error = %rollback_err,
                        "rollback after failed cache write also failed"
                    );
                }
                Err(AppError::from(err))
            }
        }
    }

    async fn get(&self, key: &AddressKey) -> AppResult<Option<CacheEntry>> {
        let row = sqlx::query(SELECT_ENTRY_SQL)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let latitude: f64 = row.try_get("latitude")?;
        let longitude: f64 = row.try_get("longitude")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(Some(CacheEntry::new(
            key.clone(),
            Coordinates::new(latitude, longitude)?,
            updated_at,
        )))
    }
}
