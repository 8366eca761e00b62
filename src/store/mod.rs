mod postgres;
mod sqlite;

use async_trait::async_trait;

use crate::address::{AddressKey, CacheEntry};
use crate::config::{BatchSettings, DatabaseConfig};
use crate::errors::AppResult;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Selection applied when resolving cache misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    /// Only consider the most recent file per listing source.
    pub latest_only: bool,
    pub limit: Option<u32>,
}

impl PendingQuery {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            latest_only: settings.latest_only,
            limit: settings.limit,
        }
    }
}

impl Default for PendingQuery {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Distinct normalized listing addresses with no cache entry, ascending.
    async fn fetch_pending(&self, query: &PendingQuery) -> AppResult<Vec<AddressKey>>;
}

#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Insert or overwrite the entry for its key in a single statement.
    async fn upsert(&self, entry: &CacheEntry) -> AppResult<()>;

    async fn get(&self, key: &AddressKey) -> AppResult<Option<CacheEntry>>;
}

/// Backend chosen from [`DatabaseConfig`].
pub enum Store {
    Postgres(PgStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        match config {
            DatabaseConfig::Sqlite(path) => Ok(Store::Sqlite(SqliteStore::open(path)?)),
            other => Ok(Store::Postgres(PgStore::connect(other).await?)),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Store::Postgres(_) => "postgres",
            Store::Sqlite(_) => "sqlite",
        }
    }

    pub async fn close(self) {
        match self {
            Store::Postgres(store) => store.close().await,
            Store::Sqlite(store) => store.close(),
        }
    }
}

#[async_trait]
impl AddressSource for Store {
    async fn fetch_pending(&self, query: &PendingQuery) -> AppResult<Vec<AddressKey>> {
        match self {
            Store::Postgres(store) => store.fetch_pending(query).await,
            Store::Sqlite(store) => store.fetch_pending(query).await,
        }
    }
}

#[async_trait]
impl LocationCache for Store {
    async fn upsert(&self, entry: &CacheEntry) -> AppResult<()> {
        match self {
            Store::Postgres(store) => store.upsert(entry).await,
            Store::Sqlite(store) => store.upsert(entry).await,
        }
    }

    async fn get(&self, key: &AddressKey) -> AppResult<Option<CacheEntry>> {
        match self {
            Store::Postgres(store) => store.get(key).await,
            Store::Sqlite(store) => store.get(key).await,
        }
    }
}

/// Keeps keys the way the database produced them, dropping any that normalize to blank.
fn collect_keys<I>(raw: I) -> Vec<AddressKey>
where
    I: IntoIterator<Item = String>,
{
    raw.into_iter()
        .filter_map(|value| AddressKey::parse(&value))
        .collect()
}
