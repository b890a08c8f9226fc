//! Address normalization into stable cache keys.
//!
//! Folding is limited to whitespace and ASCII case unless an abbreviation
//! table is configured. Country hints are mapped to ISO alpha-2 codes when
//! they name a known country.

use super::types::{Address, GeocodeError, NormalizedKey};
use std::collections::HashMap;

/// Longest accepted address text, in characters.
pub const MAX_ADDRESS_LEN: usize = 512;

/// Token-level abbreviation folding ("st." -> "street").
#[derive(Debug, Clone, Default)]
pub struct AbbreviationTable {
    map: HashMap<String, String>,
}

impl AbbreviationTable {
    /// Builds a table; keys are matched case-insensitively with any trailing dot ignored.
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (token_stem(k.as_ref()), v.as_ref().trim().to_ascii_lowercase()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn fold<'a>(&'a self, token: &'a str) -> &'a str {
        self.map
            .get(&token_stem(token))
            .map(String::as_str)
            .unwrap_or(token)
    }
}

fn token_stem(token: &str) -> String {
    token.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Pure, deterministic address canonicalizer.
#[derive(Debug, Clone, Default)]
pub struct AddressNormalizer {
    abbreviations: Option<AbbreviationTable>,
}

impl AddressNormalizer {
    /// Whitespace and case folding only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abbreviations(table: AbbreviationTable) -> Self {
        Self {
            abbreviations: (!table.is_empty()).then_some(table),
        }
    }

    pub fn normalize(&self, raw: &Address) -> Result<NormalizedKey, GeocodeError> {
        let text = self.fold_text(&raw.text)?;
        if text.is_empty() {
            return Err(GeocodeError::InvalidInput("address text is empty".into()));
        }

        let locality = match raw.locality.as_deref() {
            Some(l) => Some(self.fold_text(l)?).filter(|l| !l.is_empty()),
            None => None,
        };
        let country = match raw.country.as_deref() {
            Some(c) => fold_country(c)?,
            None => None,
        };

        Ok(NormalizedKey::from_parts(text, locality, country))
    }

    /// Whether `key` is exactly what this normalizer derives from its own parts.
    pub fn is_canonical(&self, key: &NormalizedKey) -> bool {
        let address = Address {
            text: key.text().to_string(),
            locality: key.locality().map(str::to_string),
            country: key.country().map(str::to_string),
        };
        self.normalize(&address).map_or(false, |derived| &derived == key)
    }

    fn fold_text(&self, raw: &str) -> Result<String, GeocodeError> {
        check_textual(raw)?;

        let components: Vec<String> = raw
            .split(',')
            .map(|component| {
                component
                    .split_whitespace()
                    .map(|token| {
                        let lower = token.to_ascii_lowercase();
                        match &self.abbreviations {
                            Some(table) => table.fold(&lower).to_string(),
                            None => lower,
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|component| !component.is_empty())
            .collect();

        Ok(components.join(", "))
    }
}

fn check_textual(raw: &str) -> Result<(), GeocodeError> {
    if raw.chars().count() > MAX_ADDRESS_LEN {
        return Err(GeocodeError::InvalidInput(format!(
            "address longer than {} characters",
            MAX_ADDRESS_LEN
        )));
    }
    if raw.chars().any(|c| c.is_control() && !c.is_whitespace()) {
        return Err(GeocodeError::InvalidInput(
            "address contains control characters".into(),
        ));
    }
    Ok(())
}

fn fold_country(raw: &str) -> Result<Option<String>, GeocodeError> {
    check_textual(raw)?;
    let folded = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.is_empty() {
        return Ok(None);
    }
    // Names first: "UK" is a common alias, not an ISO code
    if let Some(code) = country_name_to_code(&folded) {
        return Ok(Some(code.to_string()));
    }
    Ok(Some(folded.to_lowercase()))
}

/// Map common country names to lowercase ISO 3166-1 alpha-2 codes.
pub fn country_name_to_code(name: &str) -> Option<&'static str> {
    let code = match name.trim().to_lowercase().as_str() {
        "united states" | "united states of america" | "usa" => "us",
        "united kingdom" | "uk" | "great britain" | "england" => "gb",
        "canada" => "ca",
        "mexico" | "méxico" => "mx",
        "brazil" | "brasil" => "br",
        "argentina" => "ar",
        "france" => "fr",
        "germany" | "deutschland" => "de",
        "italy" | "italia" => "it",
        "spain" | "españa" => "es",
        "portugal" => "pt",
        "netherlands" | "nederland" => "nl",
        "belgium" | "belgique" | "belgië" => "be",
        "switzerland" | "schweiz" | "suisse" => "ch",
        "austria" | "österreich" => "at",
        "sweden" | "sverige" => "se",
        "norway" | "norge" => "no",
        "denmark" | "danmark" => "dk",
        "finland" | "suomi" => "fi",
        "poland" | "polska" => "pl",
        "russia" | "russian federation" => "ru",
        "turkey" | "türkiye" => "tr",
        "egypt" => "eg",
        "saudi arabia" => "sa",
        "united arab emirates" | "uae" => "ae",
        "india" => "in",
        "china" | "people's republic of china" => "cn",
        "japan" => "jp",
        "south korea" | "korea, republic of" => "kr",
        "indonesia" => "id",
        "australia" => "au",
        "new zealand" => "nz",
        "south africa" => "za",
        "nigeria" => "ng",
        "kenya" => "ke",
        _ => return None,
    };
    Some(code)
}
