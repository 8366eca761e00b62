use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::trace;

use crate::address::{AddressKey, Coordinates};
use crate::config::GeocodingSettings;
use crate::errors::{AppError, AppResult};

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the provider found no candidate for the query.
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>>;
}

/// Geocoder plus the locality suffix appended to every cache key.
#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
    locality: String,
}

impl GeocodingService {
    pub fn new(settings: &GeocodingSettings) -> AppResult<Self> {
        let client = GoogleGeocoder::new(settings)?;
        Ok(Self {
            inner: Arc::new(client),
            locality: settings.locality.clone(),
        })
    }

    pub fn from_geocoder(geocoder: Arc<dyn Geocoder>, locality: impl Into<String>) -> Self {
        Self {
            inner: geocoder,
            locality: locality.into(),
        }
    }

    pub fn query_for(&self, key: &AddressKey) -> String {
        if self.locality.trim().is_empty() {
            key.to_string()
        } else {
            format!("{key}, {}", self.locality)
        }
    }

    pub async fn locate(&self, key: &AddressKey) -> AppResult<Option<Coordinates>> {
        let query = self.query_for(key);
        self.inner.geocode(&query).await
    }
}

/// Google Geocoding API client.
pub struct GoogleGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl GoogleGeocoder {
    pub fn new(settings: &GeocodingSettings) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("address", query), ("key", self.api_key.expose_secret())])
            .send()
            .await?
            .error_for_status()?;

        let parsed: GeocodeResponse = response.json().await?;
        trace!(status = %parsed.status, candidates = parsed.results.len(), "geocoding response");
        match parsed.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            _ => {
                return Err(AppError::Geocoding {
                    status: parsed.status,
                    message: parsed
                        .error_message
                        .unwrap_or_else(|| "no error message".into()),
                })
            }
        }

        let Some(first) = parsed.results.into_iter().next() else {
            return Ok(None);
        };
        let location = first.geometry.location;
        Coordinates::new(location.lat, location.lng).map(Some)
    }
}
