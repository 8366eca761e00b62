use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Characters stripped from both ends of an address before keying.
///
/// Matches the character set the SQL side passes to `TRIM`/`BTRIM`, so a key
/// produced by the database is already normalized here.
pub const TRIM_CHARS: [char; 4] = [' ', '\t', '\r', '\n'];

/// Canonical cache key for a listing address: trimmed, then upper-cased.
///
/// Upper-casing is ASCII-only. The database's `UPPER` is authoritative for keys
/// it produces and ASCII folding leaves its output unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AddressKey(String);

impl AddressKey {
    /// Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim_matches(&TRIM_CHARS[..]);
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> AppResult<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(AppError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// One row of the location cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub address_key: AddressKey,
    pub coordinates: Coordinates,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(address_key: AddressKey, coordinates: Coordinates, updated_at: DateTime<Utc>) -> Self {
        Self {
            address_key,
            coordinates,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_and_whitespace_variants_share_a_key() {
        let keys = ["123 Main St", " 123 main st ", "123 MAIN ST", "\t123 Main st\r\n"]
            .iter()
            .map(|raw| AddressKey::parse(raw).unwrap())
            .collect::<Vec<_>>();
        assert!(keys.iter().all(|key| key.as_str() == "123 MAIN ST"));
    }

    #[test]
    fn blank_addresses_have_no_key() {
        assert!(AddressKey::parse("").is_none());
        assert!(AddressKey::parse("   ").is_none());
        assert!(AddressKey::parse(" \t\r\n ").is_none());
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = AddressKey::parse("  2 Oak Ave ").unwrap();
        let twice = AddressKey::parse(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn keeps_interior_spacing_and_non_ascii_letters() {
        let key = AddressKey::parse(" 10  Rue de l'Église ").unwrap();
        assert_eq!(key.as_str(), "10  RUE DE L'ÉGLISE");
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinates::new(40.0, -73.9).is_ok());
        assert!(Coordinates::new(90.0, 180.0).is_ok());
        assert!(matches!(
            Coordinates::new(90.5, 0.0),
            Err(AppError::InvalidCoordinates { .. })
        ));
        assert!(Coordinates::new(0.0, -180.01).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
    }
}
