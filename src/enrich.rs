use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::address::{AddressKey, CacheEntry, Coordinates};
use crate::config::BatchSettings;
use crate::errors::AppError;
use crate::geocode::GeocodingService;
use crate::store::{AddressSource, LocationCache, PendingQuery};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub query: PendingQuery,
    pub request_delay: Duration,
    /// Resolve and report pending addresses without calling the provider.
    pub dry_run: bool,
}

impl BatchOptions {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            query: PendingQuery::from_settings(settings),
            request_delay: settings.request_delay,
            dry_run: false,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    NotFound,
    Lookup,
    Upsert,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::NotFound => "not_found",
            FailureStage::Lookup => "lookup",
            FailureStage::Upsert => "upsert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAddress {
    pub address: AddressKey,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dry_run: bool,
    /// Keys a dry run would have geocoded, in processing order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_addresses: Vec<AddressKey>,
    pub failures: Vec<FailedAddress>,
}

impl BatchSummary {
    fn with_pending(pending: usize, dry_run: bool) -> Self {
        Self {
            pending,
            dry_run,
            ..Self::default()
        }
    }

    fn record_failure(&mut self, address: AddressKey, stage: FailureStage, reason: String) {
        self.failed += 1;
        self.failures.push(FailedAddress {
            address,
            stage,
            reason,
        });
    }
}

/// Receives batch progress. Kept separate from the driver so output format is pluggable.
pub trait ProgressReporter {
    fn resolved(&self, pending: &[AddressKey]);
    fn resolution_failed(&self, err: &AppError);
    fn processing(&self, position: usize, total: usize, address: &AddressKey);
    fn would_geocode(&self, position: usize, total: usize, address: &AddressKey);
    fn cached(&self, address: &AddressKey, coordinates: Coordinates);
    fn failed(&self, failure: &FailedAddress);
    fn finished(&self, summary: &BatchSummary);
}

/// Emits progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn resolved(&self, pending: &[AddressKey]) {
        if pending.is_empty() {
            info!("all active listings are already geocoded");
        } else {
            info!(pending = pending.len(), "found addresses to geocode");
        }
    }

    fn resolution_failed(&self, err: &AppError) {
        error!(error = %err, "failed to fetch addresses missing from the cache");
    }

    fn processing(&self, position: usize, total: usize, address: &AddressKey) {
        debug!(position, total, address = %address, "processing address");
    }

    fn would_geocode(&self, position: usize, total: usize, address: &AddressKey) {
        info!(position, total, address = %address, "dry run: address pending");
    }

    fn cached(&self, address: &AddressKey, coordinates: Coordinates) {
        info!(
            address = %address,
            latitude = coordinates.latitude,
            longitude = coordinates.longitude,
            "cached coordinates"
        );
    }

    fn failed(&self, failure: &FailedAddress) {
        warn!(
            address = %failure.address,
            stage = failure.stage.as_str(),
            error = %failure.reason,
            "address not cached"
        );
    }

    fn finished(&self, summary: &BatchSummary) {
        info!(
            pending = summary.pending,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dry_run = summary.dry_run,
            "geocoding complete"
        );
    }
}

/// Fixed pause between provider calls, independent of how long each call took.
/// The first call never waits.
struct RequestPacer {
    interval: Duration,
    started: bool,
}

impl RequestPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: false,
        }
    }

    async fn wait(&mut self) {
        if self.started && !self.interval.is_zero() {
            sleep(self.interval).await;
        }
        self.started = true;
    }
}

/// One forward pass: resolve cache misses, geocode each, upsert each.
pub struct GeocodeBatch<'a> {
    source: &'a dyn AddressSource,
    cache: &'a dyn LocationCache,
    geocoder: &'a GeocodingService,
    reporter: &'a dyn ProgressReporter,
    options: BatchOptions,
}

impl<'a> GeocodeBatch<'a> {
    pub fn new(
        source: &'a dyn AddressSource,
        cache: &'a dyn LocationCache,
        geocoder: &'a GeocodingService,
        reporter: &'a dyn ProgressReporter,
        options: BatchOptions,
    ) -> Self {
        Self {
            source,
            cache,
            geocoder,
            reporter,
            options,
        }
    }

    /// Never fails: every per-address problem is folded into the summary.
    pub async fn run(&self) -> BatchSummary {
        let pending = match self.source.fetch_pending(&self.options.query).await {
            Ok(pending) => pending,
            Err(err) => {
                self.reporter.resolution_failed(&err);
                Vec::new()
            }
        };
        self.reporter.resolved(&pending);

        let total = pending.len();
        let mut summary = BatchSummary::with_pending(total, self.options.dry_run);
        if self.options.dry_run {
            for (index, address) in pending.iter().enumerate() {
                self.reporter.would_geocode(index + 1, total, address);
            }
            summary.pending_addresses = pending;
            self.reporter.finished(&summary);
            return summary;
        }
        if total == 0 {
            self.reporter.finished(&summary);
            return summary;
        }

        let mut pacer = RequestPacer::new(self.options.request_delay);
        for (index, address) in pending.into_iter().enumerate() {
            self.reporter.processing(index + 1, total, &address);
            pacer.wait().await;

            match self.process(&address).await {
                Ok(coordinates) => {
                    summary.succeeded += 1;
                    self.reporter.cached(&address, coordinates);
                }
                Err((stage, reason)) => {
                    summary.record_failure(address, stage, reason);
                    if let Some(failure) = summary.failures.last() {
                        self.reporter.failed(failure);
                    }
                }
            }
        }

        self.reporter.finished(&summary);
        summary
    }

    async fn process(&self, address: &AddressKey) -> Result<Coordinates, (FailureStage, String)> {
        let coordinates = match self.geocoder.locate(address).await {
            Ok(Some(coordinates)) => coordinates,
            Ok(None) => {
                return Err((
                    FailureStage::NotFound,
                    format!("no results for {}", self.geocoder.query_for(address)),
                ))
            }
            Err(err) => return Err((FailureStage::Lookup, err.to_string())),
        };

        let entry = CacheEntry::new(address.clone(), coordinates, Utc::now());
        self.cache
            .upsert(&entry)
            .await
            .map_err(|err| (FailureStage::Upsert, err.to_string()))?;
        Ok(coordinates)
    }
}
