//! Geocoding providers: Nominatim over HTTP, and a static gazetteer.
//!
//! A provider performs exactly one round-trip per `lookup` and classifies
//! every failure; retries belong to the caller.

use super::types::{Coordinate, Geocoded, NormalizedKey, Precision, ProviderError, ProviderMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// An external geocoding API.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, key: &NormalizedKey) -> Result<Geocoded, ProviderError>;
}

// ─── Nominatim ───────────────────────────────────────────────────

pub const NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: String,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default, rename = "type")]
    place_type: Option<String>,
    #[serde(default, rename = "category", alias = "class")]
    place_class: Option<String>,
    #[serde(default)]
    addresstype: Option<String>,
    #[serde(default)]
    address: Option<NominatimAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    #[serde(default)]
    country_code: Option<String>,
}

/// OpenStreetMap Nominatim (or any API speaking its search protocol).
pub struct NominatimProvider {
    agent: ureq::Agent,
    endpoint: String,
    user_agent: String,
    api_key: Option<String>,
}

impl NominatimProvider {
    pub fn new(endpoint: impl Into<String>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.into(),
            user_agent: user_agent.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    async fn lookup(&self, key: &NormalizedKey) -> Result<Geocoded, ProviderError> {
        let mut request = self
            .agent
            .get(&self.endpoint)
            .set("User-Agent", &self.user_agent)
            .query("q", &key.query_text())
            .query("format", "jsonv2")
            .query("addressdetails", "1")
            .query("limit", "5");
        if let Some(cc) = key.country().filter(|c| c.len() == 2) {
            request = request.query("countrycodes", cc);
        }
        if let Some(api_key) = &self.api_key {
            request = request.query("key", api_key);
        }

        let places = tokio::task::spawn_blocking(move || -> Result<Vec<NominatimPlace>, ProviderError> {
            let response = request.call().map_err(classify)?;
            response
                .into_json()
                .map_err(|e| ProviderError::Transient(format!("invalid response body: {}", e)))
        })
        .await
        .map_err(|e| ProviderError::Transient(format!("lookup task failed: {}", e)))??;

        let geocoded = best_place(self.name(), places)?;
        tracing::debug!(%key, lat = geocoded.coordinate.lat, lon = geocoded.coordinate.lon, "nominatim hit");
        Ok(geocoded)
    }
}

/// Map a ureq failure onto the provider error classes.
fn classify(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(429, response) => ProviderError::RateLimited {
            retry_after: response.header("Retry-After").and_then(parse_retry_after),
        },
        ureq::Error::Status(code, _) if code == 408 || code >= 500 => {
            ProviderError::Transient(format!("HTTP {}", code))
        }
        ureq::Error::Status(code @ (401 | 403), _) => {
            ProviderError::Fatal(format!("HTTP {}: credentials rejected", code))
        }
        ureq::Error::Status(code, _) => ProviderError::Fatal(format!("HTTP {}: request rejected", code)),
        ureq::Error::Transport(t) => ProviderError::Transient(t.to_string()),
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn precision_for(place_class: &str, place_type: &str, addresstype: Option<&str>) -> Precision {
    match (place_class, place_type) {
        ("building", _) | (_, "house") => return Precision::Rooftop,
        ("highway", _) => return Precision::Street,
        _ => {}
    }
    match addresstype.unwrap_or(place_type) {
        "house" | "building" => Precision::Rooftop,
        "road" | "street" => Precision::Street,
        "city" | "town" | "village" | "hamlet" | "suburb" | "neighbourhood" | "postcode" => {
            Precision::Locality
        }
        "state" | "county" | "region" | "province" => Precision::Region,
        "country" => Precision::Country,
        _ => Precision::Approximate,
    }
}

fn best_place(provider: &str, places: Vec<NominatimPlace>) -> Result<Geocoded, ProviderError> {
    let best = places
        .into_iter()
        .max_by(|a, b| {
            a.importance
                .unwrap_or(0.0)
                .partial_cmp(&b.importance.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .ok_or(ProviderError::NotFound)?;

    let lat: f64 = best
        .lat
        .parse()
        .map_err(|_| ProviderError::Transient(format!("unparseable latitude '{}'", best.lat)))?;
    let lon: f64 = best
        .lon
        .parse()
        .map_err(|_| ProviderError::Transient(format!("unparseable longitude '{}'", best.lon)))?;

    let place_class = best.place_class.as_deref().unwrap_or("unknown");
    let place_type = best.place_type.as_deref().unwrap_or("unknown");
    let precision = precision_for(place_class, place_type, best.addresstype.as_deref());

    let coordinate = Coordinate::new(lat, lon)
        .map_err(|e| ProviderError::Transient(e.to_string()))?
        .with_precision(precision, best.importance.unwrap_or(0.5));

    Ok(Geocoded {
        coordinate,
        metadata: ProviderMetadata {
            provider: provider.to_string(),
            display_name: Some(best.display_name),
            place_type: Some(format!("{}/{}", place_class, place_type)),
            country_code: best
                .address
                .and_then(|a| a.country_code)
                .map(|cc| cc.to_uppercase()),
        },
    })
}

// ─── Static gazetteer ───────────────────────────────────────────

/// One gazetteer row, keyed by normalized address text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GazetteerEntry {
    pub address: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    #[serde(default)]
    pub country_code: Option<String>,
}

fn default_precision() -> Precision {
    Precision::Approximate
}

/// Offline provider answering from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    places: HashMap<String, GazetteerEntry>,
}

impl StaticProvider {
    /// Rows must be keyed by already-normalized text (see `AddressNormalizer`).
    pub fn new(entries: impl IntoIterator<Item = GazetteerEntry>) -> Self {
        Self {
            places: entries
                .into_iter()
                .map(|e| (e.address.clone(), e))
                .collect(),
        }
    }

    /// Load a JSON array of gazetteer rows.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<GazetteerEntry> = serde_json::from_str(&data)?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }
}

#[async_trait]
impl GeocodeProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn lookup(&self, key: &NormalizedKey) -> Result<Geocoded, ProviderError> {
        let entry = self
            .places
            .get(&key.query_text())
            .or_else(|| self.places.get(key.text()))
            .ok_or(ProviderError::NotFound)?;

        if let (Some(want), Some(have)) = (key.country(), entry.country_code.as_deref()) {
            if !want.eq_ignore_ascii_case(have) {
                return Err(ProviderError::NotFound);
            }
        }

        let coordinate = Coordinate::new(entry.lat, entry.lon)
            .map_err(|e| ProviderError::Fatal(format!("gazetteer row '{}': {}", entry.address, e)))?
            .with_precision(entry.precision, 1.0);

        Ok(Geocoded {
            coordinate,
            metadata: ProviderMetadata {
                provider: self.name().to_string(),
                display_name: Some(entry.address.clone()),
                place_type: None,
                country_code: entry.country_code.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::normalize::AddressNormalizer;
    use crate::location::types::Address;
    use tempfile::TempDir;

    fn place(lat: &str, lon: &str, importance: f64, class: &str, ptype: &str) -> NominatimPlace {
        NominatimPlace {
            lat: lat.into(),
            lon: lon.into(),
            display_name: format!("{} {}", class, ptype),
            importance: Some(importance),
            place_type: Some(ptype.into()),
            place_class: Some(class.into()),
            addresstype: None,
            address: None,
        }
    }

    #[test]
    fn test_best_place_by_importance() {
        let g = best_place(
            "nominatim",
            vec![
                place("37.42", "-122.08", 0.3, "place", "village"),
                place("37.4220", "-122.0841", 0.9, "building", "yes"),
            ],
        )
        .unwrap();
        assert!((g.coordinate.lat - 37.4220).abs() < 1e-9);
        assert_eq!(g.coordinate.precision, Precision::Rooftop);
        assert!((g.coordinate.confidence - 0.9).abs() < 1e-9);
        assert_eq!(g.metadata.place_type.as_deref(), Some("building/yes"));
    }

    #[test]
    fn test_empty_results_not_found() {
        assert_eq!(best_place("nominatim", vec![]), Err(ProviderError::NotFound));
    }

    #[test]
    fn test_malformed_coordinates_transient() {
        let bad = place("north", "-122.0", 0.5, "place", "city");
        assert!(matches!(
            best_place("nominatim", vec![bad]),
            Err(ProviderError::Transient(_))
        ));
        let out_of_range = place("95.0", "0.0", 0.5, "place", "city");
        assert!(matches!(
            best_place("nominatim", vec![out_of_range]),
            Err(ProviderError::Transient(_))
        ));
    }

    #[test]
    fn test_parse_response_json() {
        let body = r#"[{
            "lat": "48.8588897",
            "lon": "2.3200410",
            "display_name": "Paris, Île-de-France, France",
            "importance": 0.88,
            "category": "boundary",
            "type": "administrative",
            "addresstype": "city",
            "address": {"country_code": "fr"}
        }]"#;
        let places: Vec<NominatimPlace> = serde_json::from_str(body).unwrap();
        let g = best_place("nominatim", places).unwrap();
        assert_eq!(g.coordinate.precision, Precision::Locality);
        assert_eq!(g.metadata.country_code.as_deref(), Some("FR"));
    }

    #[test]
    fn test_precision_mapping() {
        assert_eq!(precision_for("highway", "residential", None), Precision::Street);
        assert_eq!(precision_for("place", "city", None), Precision::Locality);
        assert_eq!(precision_for("boundary", "administrative", Some("state")), Precision::Region);
        assert_eq!(precision_for("boundary", "administrative", Some("country")), Precision::Country);
        assert_eq!(precision_for("amenity", "cafe", None), Precision::Approximate);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    fn gazetteer() -> StaticProvider {
        StaticProvider::new(vec![
            GazetteerEntry {
                address: "1600 amphitheatre parkway, mountain view, ca".into(),
                lat: 37.4220,
                lon: -122.0841,
                precision: Precision::Rooftop,
                country_code: Some("US".into()),
            },
            GazetteerEntry {
                address: "stockholm".into(),
                lat: 59.3293,
                lon: 18.0686,
                precision: Precision::Locality,
                country_code: Some("SE".into()),
            },
        ])
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let n = AddressNormalizer::new();
        let provider = gazetteer();
        let key = n
            .normalize(&Address::new("1600 Amphitheatre Parkway,  Mountain View, CA"))
            .unwrap();
        let g = provider.lookup(&key).await.unwrap();
        assert_eq!(g.coordinate.precision, Precision::Rooftop);
        assert_eq!(g.metadata.provider, "static");

        let missing = n.normalize(&Address::new("Nowhere Lane")).unwrap();
        assert_eq!(provider.lookup(&missing).await, Err(ProviderError::NotFound));
    }

    #[tokio::test]
    async fn test_static_country_filter() {
        let n = AddressNormalizer::new();
        let provider = gazetteer();
        let se = n.normalize(&Address::new("Stockholm").with_country("SE")).unwrap();
        assert!(provider.lookup(&se).await.is_ok());
        let us = n.normalize(&Address::new("Stockholm").with_country("US")).unwrap();
        assert_eq!(provider.lookup(&us).await, Err(ProviderError::NotFound));
    }

    #[test]
    fn test_static_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gazetteer.json");
        std::fs::write(
            &path,
            r#"[{"address": "oslo", "lat": 59.9139, "lon": 10.7522, "precision": "locality"}]"#,
        )
        .unwrap();
        let provider = StaticProvider::from_file(&path).unwrap();
        assert_eq!(provider.len(), 1);
    }
}
