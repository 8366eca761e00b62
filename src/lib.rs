pub mod address;
pub mod config;
pub mod enrich;
pub mod errors;
pub mod geocode;
pub mod report;
pub mod store;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::{AddressKey, CacheEntry, Coordinates};
pub use crate::config::{AppConfig, BatchSettings, DatabaseConfig, GeocodingSettings};
pub use crate::enrich::{
    BatchOptions, BatchSummary, FailedAddress, FailureStage, GeocodeBatch, ProgressReporter,
    TracingReporter,
};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocode::{Geocoder, GeocodingService, GoogleGeocoder};
pub use crate::report::RunReport;
pub use crate::store::{AddressSource, LocationCache, PendingQuery, PgStore, SqliteStore, Store};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,listing_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

/// Full job: build the provider client, open the store, run one batch, release the store.
///
/// Errors returned here are startup failures. Once the store is open the run always
/// yields a summary, and the store is closed before returning.
pub async fn run(config: &AppConfig, options: BatchOptions) -> AppResult<BatchSummary> {
    let geocoder = GeocodingService::new(&config.geocoding)?;
    let store = Store::connect(&config.database).await?;
    let backend = store.backend();
    info!(backend, "starting geocoding run");

    let summary = run_batch(&store, &store, &geocoder, &TracingReporter, options).await;
    store.close().await;

    if let Some(path) = &config.run_report_path {
        let report = RunReport::new(path);
        if let Err(err) = report.append(backend, &summary) {
            warn!(error = %err, path = %report.path().display(), "failed to append run report");
        }
    }
    Ok(summary)
}

pub async fn run_batch(
    source: &dyn AddressSource,
    cache: &dyn LocationCache,
    geocoder: &GeocodingService,
    reporter: &dyn ProgressReporter,
    options: BatchOptions,
) -> BatchSummary {
    GeocodeBatch::new(source, cache, geocoder, reporter, options)
        .run()
        .await
}
