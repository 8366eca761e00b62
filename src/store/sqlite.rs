use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use super::{collect_keys, AddressSource, LocationCache, PendingQuery};
use crate::address::{AddressKey, CacheEntry, Coordinates};
use crate::errors::{AppError, AppResult};

// Character set kept in step with `address::TRIM_CHARS`.
const PENDING_SQL: &str = r#"
    WITH ranked AS (
        SELECT
            UPPER(TRIM(address, ' ' || char(9) || char(10) || char(13))) AS address_key,
            DENSE_RANK() OVER (PARTITION BY source_name ORDER BY filename_date DESC) AS rnk
        FROM unified_listings_vw
        WHERE address IS NOT NULL
          AND TRIM(address, ' ' || char(9) || char(10) || char(13)) <> ''
    )
    SELECT DISTINCT ranked.address_key
    FROM ranked
    WHERE (?1 = 0 OR ranked.rnk = 1)
      AND NOT EXISTS (
          SELECT 1
          FROM locations_cache cache
          WHERE UPPER(TRIM(cache.address_key, ' ' || char(9) || char(10) || char(13)))
                = ranked.address_key
      )
    ORDER BY ranked.address_key
    LIMIT ?2
"#;

const UPSERT_SQL: &str = "INSERT INTO locations_cache (address_key, latitude, longitude, updated_at)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(address_key) DO UPDATE SET
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        updated_at = excluded.updated_at";

/// Local listing database with the same table conventions as the reporting warehouse.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let connection = Connection::open(path)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        ensure_cache_table(&connection)?;
        info!(
            target: "database_bootstrap",
            path = %path.display(),
            "sqlite listing store opened"
        );
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        ensure_cache_table(&connection)?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs arbitrary statements against the underlying connection.
    pub fn execute_batch(&self, sql: &str) -> AppResult<()> {
        self.db.lock().execute_batch(sql)?;
        Ok(())
    }

    pub fn close(self) {
        let Ok(mutex) = Arc::try_unwrap(self.db) else {
            // Another handle still owns the connection; it closes on its last drop.
            return;
        };
        if let Err((_, err)) = mutex.into_inner().close() {
            warn!(error = %err, "failed to close sqlite listing store");
        }
    }
}

fn ensure_cache_table(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS locations_cache (
            address_key TEXT NOT NULL PRIMARY KEY,
            latitude REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
            longitude REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl AddressSource for SqliteStore {
    async fn fetch_pending(&self, query: &PendingQuery) -> AppResult<Vec<AddressKey>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(PENDING_SQL)?;
        let limit = query.limit.map(i64::from).unwrap_or(-1);
        let rows = stmt
            .query_map((query.latest_only, limit), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collect_keys(rows))
    }
}

#[async_trait]
impl LocationCache for SqliteStore {
    async fn upsert(&self, entry: &CacheEntry) -> AppResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let written = tx.execute(
            UPSERT_SQL,
            (
                entry.address_key.as_str(),
                entry.coordinates.latitude,
                entry.coordinates.longitude,
                entry.updated_at.to_rfc3339(),
            ),
        );
        match written {
            Ok(_) => {
                tx.commit()?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
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
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT latitude, longitude, updated_at FROM locations_cache WHERE address_key = ?1",
                [key.as_str()],
                |row| {
                    let latitude: f64 = row.get(0)?;
                    let longitude: f64 = row.get(1)?;
                    let updated_at: String = row.get(2)?;
                    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                        .map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err))
                        })?
                        .with_timezone(&Utc);
                    Ok((latitude, longitude, updated_at))
                },
            )
            .optional()?;

        let Some((latitude, longitude, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(CacheEntry::new(
            key.clone(),
            Coordinates::new(latitude, longitude)?,
            updated_at,
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const LISTINGS_DDL: &str = r#"
        CREATE TABLE unified_listings_vw (
            address TEXT,
            source_name TEXT NOT NULL,
            filename_date TEXT NOT NULL
        );
    "#;

    fn store_with_listings(rows: &[(Option<&str>, &str, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.execute_batch(LISTINGS_DDL).unwrap();
        {
            let conn = store.db.lock();
            for (address, source, date) in rows {
                conn.execute(
                    "INSERT INTO unified_listings_vw (address, source_name, filename_date) VALUES (?1, ?2, ?3)",
                    (address, source, date),
                )
                .unwrap();
            }
        }
        store
    }

    fn entry(key: &str, lat: f64, lng: f64) -> CacheEntry {
        CacheEntry::new(
            AddressKey::parse(key).unwrap(),
            Coordinates::new(lat, lng).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
    }

    fn all_batches() -> PendingQuery {
        PendingQuery {
            latest_only: false,
            limit: None,
        }
    }

    fn keys(found: Vec<AddressKey>) -> Vec<String> {
        found.into_iter().map(AddressKey::into_inner).collect()
    }

    #[tokio::test]
    async fn empty_cache_makes_every_address_pending() {
        let store = store_with_listings(&[
            (Some("2 Oak Ave"), "streeteasy", "2024-05-01"),
            (Some("1 Elm St"), "streeteasy", "2024-05-01"),
        ]);
        let pending = store.fetch_pending(&all_batches()).await.unwrap();
        assert_eq!(keys(pending), vec!["1 ELM ST", "2 OAK AVE"]);
    }

    #[tokio::test]
    async fn cached_keys_are_not_selected_again() {
        let store = store_with_listings(&[
            (Some("1 Elm St"), "streeteasy", "2024-05-01"),
            (Some("2 Oak Ave"), "streeteasy", "2024-05-01"),
        ]);
        store.upsert(&entry("1 ELM ST", 40.0, -73.9)).await.unwrap();

        let pending = store.fetch_pending(&all_batches()).await.unwrap();
        assert_eq!(keys(pending), vec!["2 OAK AVE"]);
    }

    #[tokio::test]
    async fn case_and_whitespace_variants_collapse_to_one_key() {
        let store = store_with_listings(&[
            (Some("123 Main St"), "a", "2024-05-01"),
            (Some(" 123 main st "), "a", "2024-05-01"),
            (Some("123 MAIN ST\t"), "b", "2024-05-01"),
        ]);
        let pending = store.fetch_pending(&all_batches()).await.unwrap();
        assert_eq!(keys(pending), vec!["123 MAIN ST"]);
    }

    #[tokio::test]
    async fn raw_legacy_cache_keys_still_count_as_hits() {
        let store = store_with_listings(&[(Some("123 Main St"), "a", "2024-05-01")]);
        store
            .execute_batch(
                "INSERT INTO locations_cache VALUES (' 123 main st', 40.0, -73.9, '2024-01-01T00:00:00+00:00')",
            )
            .unwrap();
        let pending = store.fetch_pending(&all_batches()).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn blank_and_null_addresses_are_never_pending() {
        let store = store_with_listings(&[
            (None, "a", "2024-05-01"),
            (Some(""), "a", "2024-05-01"),
            (Some("   "), "a", "2024-05-01"),
            (Some("\t\r\n"), "a", "2024-05-01"),
            (Some("9 Pine Rd"), "a", "2024-05-01"),
        ]);
        let pending = store.fetch_pending(&all_batches()).await.unwrap();
        assert_eq!(keys(pending), vec!["9 PINE RD"]);
    }

    #[tokio::test]
    async fn latest_only_keeps_newest_file_per_source() {
        let store = store_with_listings(&[
            (Some("Old Listing"), "streeteasy", "2024-04-01"),
            (Some("New Listing"), "streeteasy", "2024-05-01"),
            (Some("Other Source"), "zillow", "2024-03-15"),
        ]);
        let latest = store
            .fetch_pending(&PendingQuery {
                latest_only: true,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(keys(latest), vec!["NEW LISTING", "OTHER SOURCE"]);

        let everything = store.fetch_pending(&all_batches()).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn limit_caps_sorted_results() {
        let store = store_with_listings(&[
            (Some("c st"), "a", "2024-05-01"),
            (Some("a st"), "a", "2024-05-01"),
            (Some("b st"), "a", "2024-05-01"),
        ]);
        let pending = store
            .fetch_pending(&PendingQuery {
                latest_only: false,
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(keys(pending), vec!["A ST", "B ST"]);
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("1 ELM ST", 40.0, -73.9)).await.unwrap();
        let mut newer = entry("1 ELM ST", 40.5, -73.5);
        newer.updated_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store.upsert(&newer).await.unwrap();

        let count: i64 = store
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM locations_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let stored = store
            .get(&AddressKey::parse("1 elm st").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, newer);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_keeps_connection_usable() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute_batch(
                r#"
                CREATE TRIGGER reject_oak BEFORE INSERT ON locations_cache
                WHEN NEW.address_key = '2 OAK AVE'
                BEGIN
                    SELECT RAISE(ABORT, 'rejected by trigger');
                END;
                "#,
            )
            .unwrap();

        let err = store.upsert(&entry("2 OAK AVE", 40.1, -73.8)).await.unwrap_err();
        assert!(matches!(err, AppError::Sqlite(_)));
        assert!(err.to_string().contains("rejected by trigger"));
        assert!(store.db.lock().is_autocommit());

        store.upsert(&entry("1 ELM ST", 40.0, -73.9)).await.unwrap();
        assert!(store
            .get(&AddressKey::parse("2 Oak Ave").unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get(&AddressKey::parse("1 Elm St").unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn corrupt_cache_timestamp_is_a_storage_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "INSERT INTO locations_cache VALUES ('1 ELM ST', 40.0, -73.9, 'yesterday');",
            )
            .unwrap();

        let err = store
            .get(&AddressKey::parse("1 Elm St").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Sqlite(rusqlite::Error::FromSqlConversionFailure(2, Type::Text, _))
        ));
    }

    #[tokio::test]
    async fn missing_listing_view_surfaces_as_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.fetch_pending(&all_batches()).await.unwrap_err();
        assert!(matches!(err, AppError::Sqlite(_)));
    }

    #[test]
    fn opens_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("listings.db")).unwrap();
        assert!(store.path().unwrap().ends_with("listings.db"));
        store.close();
    }
}
