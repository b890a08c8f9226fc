//! Core types for the location subsystem.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A raw address as supplied by a caller, with optional hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub text: String,
    /// City or locality hint (e.g. "Mountain View")
    pub locality: Option<String>,
    /// Country hint, either ISO 3166-1 alpha-2 ("US") or a country name
    pub country: Option<String>,
}

impl Address {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
}

impl From<&str> for Address {
    fn from(text: &str) -> Self {
        Address::new(text)
    }
}

/// Canonical identity of an address. Sole cache and coalescing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedKey {
    text: String,
    locality: Option<String>,
    country: Option<String>,
}

impl NormalizedKey {
    /// Built only by the normalizer, which guarantees folded components.
    pub(crate) fn from_parts(text: String, locality: Option<String>, country: Option<String>) -> Self {
        Self { text, locality, country }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn locality(&self) -> Option<&str> {
        self.locality.as_deref()
    }

    /// Lowercase ISO country code, or the folded country text when unknown.
    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    /// Free-text query for providers: text followed by the locality hint.
    pub fn query_text(&self) -> String {
        match &self.locality {
            Some(locality) => format!("{}, {}", self.text, locality),
            None => self.text.clone(),
        }
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.text,
            self.locality.as_deref().unwrap_or(""),
            self.country.as_deref().unwrap_or("")
        )
    }
}

/// How precisely a coordinate pins down the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Rooftop,
    Street,
    Locality,
    Region,
    Country,
    Approximate,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rooftop => write!(f, "rooftop"),
            Self::Street => write!(f, "street"),
            Self::Locality => write!(f, "locality"),
            Self::Region => write!(f, "region"),
            Self::Country => write!(f, "country"),
            Self::Approximate => write!(f, "approximate"),
        }
    }
}

/// A point on the globe with the provider's precision and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    pub precision: Precision,
    /// Provider confidence score (0.0 to 1.0)
    pub confidence: f64,
}

impl Coordinate {
    /// Validated coordinate with approximate precision and full confidence.
    pub fn new(lat: f64, lon: f64) -> Result<Self, GeocodeError> {
        let coordinate = Self {
            lat,
            lon,
            precision: Precision::Approximate,
            confidence: 1.0,
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    pub fn with_precision(self, precision: Precision, confidence: f64) -> Self {
        Self {
            precision,
            confidence: confidence.clamp(0.0, 1.0),
            ..self
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn validate(&self) -> Result<(), GeocodeError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(GeocodeError::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }
}

/// Provenance reported alongside a coordinate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub provider: String,
    /// Full display name from provider (e.g. "Googleplex, Mountain View, California, United States")
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub place_type: Option<String>,
    /// ISO 3166-1 alpha-2 country code (e.g. "US")
    #[serde(default)]
    pub country_code: Option<String>,
}

/// A successful provider lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Geocoded {
    pub coordinate: Coordinate,
    pub metadata: ProviderMetadata,
}

/// A cached resolution. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEntry {
    pub key: NormalizedKey,
    pub coordinate: Coordinate,
    pub resolved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: ProviderMetadata,
}

impl ResolutionEntry {
    pub fn new(key: NormalizedKey, geocoded: Geocoded, resolved_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key,
            coordinate: geocoded.coordinate,
            resolved_at,
            expires_at: resolved_at + ttl,
            metadata: geocoded.metadata,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Classified failure of a single provider round-trip.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider found no location")]
    NotFound,
    #[error("provider throttled the request (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("provider rejected the request: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout(_)
        )
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeocodeError {
    #[error("invalid address input: {0}")]
    InvalidInput(String),
    #[error("location not found: '{0}'")]
    NotFound(String),
    #[error("rate limiter wait exceeded {waited:?}")]
    RateLimitTimeout { waited: std::time::Duration },
    #[error("resolution failed after {attempts} attempt(s): {last}")]
    ResolutionFailed { attempts: u32, last: ProviderError },
    #[error("fatal provider error: {0}")]
    Fatal(String),
    #[error("invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("in-flight lookup ended without a result")]
    LookupAborted,
}

impl GeocodeError {
    /// Stable machine-readable code for request boundaries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::RateLimitTimeout { .. } => "rate_limit_timeout",
            Self::ResolutionFailed { .. } => "resolution_failed",
            Self::Fatal(_) => "fatal",
            Self::InvalidCoordinate { .. } => "invalid_coordinate",
            Self::LookupAborted => "lookup_aborted",
        }
    }

    /// Whether the error is the caller's fault rather than the provider's.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::InvalidCoordinate { .. })
    }
}
