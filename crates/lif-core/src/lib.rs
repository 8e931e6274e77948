//! Core domain model and postcode logic for LIF.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lif-core";

/// Statute-mile Earth radius used for all geodesic math.
pub const EARTH_RADIUS_MILES: f64 = 3959.0;

/// Listing status tiers. Zero and below are invisible to searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Delisted,
    Suspended,
    Disabled,
    Pending,
    Active,
}

impl ProviderStatus {
    /// Smallest status code that searches treat as live.
    pub const ACTIVE_FLOOR: i16 = 1;

    pub fn code(self) -> i16 {
        match self {
            ProviderStatus::Delisted => -3,
            ProviderStatus::Suspended => -2,
            ProviderStatus::Disabled => -1,
            ProviderStatus::Pending => 0,
            ProviderStatus::Active => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::all().into_iter().find(|status| status.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            ProviderStatus::Delisted => "Delisted",
            ProviderStatus::Suspended => "Suspended",
            ProviderStatus::Disabled => "Disabled",
            ProviderStatus::Pending => "Pending",
            ProviderStatus::Active => "Active",
        }
    }

    pub fn all() -> [ProviderStatus; 5] {
        [
            ProviderStatus::Delisted,
            ProviderStatus::Suspended,
            ProviderStatus::Disabled,
            ProviderStatus::Pending,
            ProviderStatus::Active,
        ]
    }

    pub fn is_active(self) -> bool {
        self.code() >= Self::ACTIVE_FLOOR
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Search sub-scope, passed explicitly into every ranking call rather than
/// accumulated on shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderScope {
    #[default]
    All,
    Tutors,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoverageError {
    #[error("coverage token is empty")]
    EmptyToken,
    #[error("coverage token {0:?} is not alpha-prefixed")]
    NotAlphaPrefixed(String),
}

/// An area token is usable for coverage matching only when it leads with a
/// letter. Purely numeric fragments must never match anything.
pub fn valid_area_token(token: &str) -> bool {
    token
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
}

/// Comma-delimited area-code set with guaranteed wrapping delimiters.
///
/// Stored as `,SW1A,NW3,` so that substring containment on `,TOKEN,` can
/// never match a token that is the suffix of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverageList(String);

impl CoverageList {
    pub fn empty() -> Self {
        CoverageList(String::new())
    }

    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, CoverageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stored = String::from(",");
        let mut seen = Vec::new();
        for token in tokens {
            let token = token.as_ref().trim().to_uppercase();
            if token.is_empty() {
                return Err(CoverageError::EmptyToken);
            }
            if !valid_area_token(&token) {
                return Err(CoverageError::NotAlphaPrefixed(token));
            }
            if seen.contains(&token) {
                continue;
            }
            stored.push_str(&token);
            stored.push(',');
            seen.push(token);
        }
        if seen.is_empty() {
            return Ok(Self::empty());
        }
        Ok(CoverageList(stored))
    }

    /// Parse a display-form list such as `"SW1A, NW3"`.
    pub fn parse_display(text: &str) -> Result<Self, CoverageError> {
        Self::from_tokens(text.split(',').map(str::trim).filter(|t| !t.is_empty()))
    }

    /// Rehydrate a stored column value, restoring the wrapping delimiters if a
    /// migration ever stripped them.
    pub fn from_stored(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches(',');
        if trimmed.is_empty() {
            return Self::empty();
        }
        CoverageList(format!(",{trimmed},"))
    }

    pub fn as_stored(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, area: &str) -> bool {
        let area = area.trim().to_uppercase();
        if !valid_area_token(&area) {
            return false;
        }
        self.0.contains(&format!(",{area},"))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(',').filter(|t| !t.is_empty())
    }

    /// Human-readable form: wrapping delimiters stripped, `", "` separated.
    pub fn display(&self) -> String {
        self.tokens().collect::<Vec<_>>().join(", ")
    }
}

const SHIFTED_DIGITS: [(char, char); 10] = [
    ('!', '1'),
    ('"', '2'),
    ('£', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
];

/// Strip data-entry noise from a postcode: shifted-key punctuation becomes
/// the digit beneath it on the keyboard and whitespace is removed.
pub fn clean_postcode(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                None
            } else if let Some((_, digit)) = SHIFTED_DIGITS.iter().find(|(key, _)| *key == c) {
                Some(*digit)
            } else {
                Some(c)
            }
        })
        .collect()
}

/// First part of a UK-style postcode ("SW1A" from "SW1A 1AA"), upper-cased.
///
/// Inputs shorter than five characters after cleanup are assumed to already
/// be an outward code and pass through unchanged; callers must not
/// double-normalize.
pub fn outward_code(raw: &str) -> String {
    let cleaned = clean_postcode(raw);
    let len = cleaned.chars().count();
    let kept: String = if len >= 5 {
        cleaned.chars().take(len - 3).collect()
    } else {
        cleaned
    };
    kept.to_uppercase()
}

/// Outward code with every non-letter removed, for pattern tests.
pub fn outward_code_alpha(raw: &str) -> String {
    outward_code(raw)
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect()
}

static DISTRICT_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Whether a normalized outward code has the district shape of a full
/// postcode: one uppercase letter, one non-space character, an optional
/// digit, then a final digit.
pub fn looks_like_full_postcode(outward: &str) -> bool {
    let pattern = DISTRICT_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Z]\S\d?\d$").expect("district pattern compiles"));
    pattern.is_match(outward)
}

/// Great-circle distance between two points in statute miles.
pub fn haversine_miles(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_MILES * c
}

/// Everything before the first space of a full name.
pub fn first_name(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or(name)
}

fn default_schema_version() -> u32 {
    1
}

/// Promotional offer payload, stored serialized in a text column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub headline: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Lesson pricing payload, stored serialized in a text column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRates {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub hourly: Option<f64>,
    #[serde(default)]
    pub two_hours: Option<f64>,
    #[serde(default)]
    pub block_of_ten: Option<f64>,
    #[serde(default)]
    pub weekly: Option<f64>,
    #[serde(default)]
    pub semi_intensive: Option<f64>,
    #[serde(default)]
    pub residential: Option<f64>,
}

/// Social profile links payload, stored serialized in a text column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialLinks {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub facebook: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub instagram: Option<String>,
    #[serde(default)]
    pub youtube: Option<String>,
}

/// Decode a serialized sub-field column. Absent or blank columns are `None`;
/// a malformed payload is an error the caller decides how to surface.
pub fn decode_payload<T: serde::de::DeserializeOwned>(
    column: Option<&str>,
) -> Result<Option<T>, serde_json::Error> {
    match column {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(text).map(Some),
        _ => Ok(None),
    }
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

/// Raw provider row as persisted, credential columns included. Catalog
/// post-processing strips credentials before anything leaves the crate
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub website: Option<String>,
    pub about: Option<String>,
    pub status: i16,
    pub coverage: CoverageList,
    pub main_area: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub priority: bool,
    pub priority_started_at: Option<DateTime<Utc>>,
    pub offer: Option<String>,
    pub lessons: Option<String>,
    pub social: Option<String>,
    pub tutor: bool,
    pub cache_stale: bool,
    pub password_hash: Option<String>,
    pub recovery_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn status_tier(&self) -> Option<ProviderStatus> {
        ProviderStatus::from_code(self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status >= ProviderStatus::ACTIVE_FLOOR
    }

    pub fn has_offer(&self) -> bool {
        self.offer.as_deref().map(|o| !o.trim().is_empty()).unwrap_or(false)
    }
}

/// Input contract for catalog `add`. The id arrives as free text from the
/// outer surface and is validated there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProvider {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub coverage: Vec<String>,
    #[serde(default)]
    pub main_area: Option<String>,
    #[serde(default)]
    pub tutor: bool,
    #[serde(default)]
    pub offer: Option<OfferPayload>,
    #[serde(default)]
    pub lessons: Option<LessonRates>,
    #[serde(default)]
    pub social: Option<SocialLinks>,
}

/// Partial update; `None` leaves a column untouched. Blank `about` / `offer`
/// values are normalized to NULL by the catalog before they reach the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub website: Option<String>,
    pub about: Option<String>,
    pub status: Option<i16>,
    pub coverage: Option<CoverageList>,
    pub main_area: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub priority: Option<bool>,
    pub priority_started_at: Option<DateTime<Utc>>,
    pub offer: Option<String>,
    pub lessons: Option<String>,
    pub social: Option<String>,
    pub tutor: Option<bool>,
    pub cache_stale: Option<bool>,
}

impl ProviderChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A customer quote shown alongside a provider profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testimonial {
    pub id: i64,
    pub provider_id: i64,
    pub author: String,
    pub quote: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outward_code_keeps_all_but_inward_part() {
        assert_eq!(outward_code("SW1A 1AA"), "SW1A");
        assert_eq!(outward_code("gu16 7er"), "GU16");
        assert_eq!(outward_code("m25 0ab"), "M25");
    }

    #[test]
    fn outward_code_property_for_long_inputs() {
        for raw in ["SW1A 1AA", "EC2V6DB", "b90 4ay", "LL65 2NP"] {
            let cleaned = clean_postcode(raw);
            assert!(cleaned.chars().count() >= 5);
            let outward = outward_code(raw);
            assert_eq!(outward.chars().count(), cleaned.chars().count() - 3);
            assert_eq!(outward, outward.to_uppercase());
        }
    }

    #[test]
    fn short_inputs_pass_through_unchanged() {
        assert_eq!(outward_code("n1"), "N1");
        assert_eq!(outward_code("GU16"), "GU16");
        assert_eq!(outward_code(""), "");
    }

    #[test]
    fn shifted_punctuation_maps_to_digits() {
        assert_eq!(clean_postcode("N!"), "N1");
        assert_eq!(clean_postcode("SW!A "), "SW1A");
        assert_eq!(clean_postcode("B£ )QQ"), "B30QQ");
        assert_eq!(outward_code("GU!^ &ER"), "GU16");
    }

    #[test]
    fn alpha_mode_strips_non_letters() {
        assert_eq!(outward_code_alpha("SW1A 1AA"), "SWA");
        assert_eq!(outward_code_alpha("GU16"), "GU");
    }

    #[test]
    fn district_pattern_detects_full_postcodes() {
        assert!(looks_like_full_postcode("GU16"));
        assert!(looks_like_full_postcode("M25"));
        assert!(looks_like_full_postcode("SW12"));
        assert!(!looks_like_full_postcode("N1"));
        assert!(!looks_like_full_postcode("SW1A"));
        assert!(!looks_like_full_postcode(""));
        assert!(!looks_like_full_postcode("sw12"));
    }

    #[test]
    fn coverage_containment_is_delimiter_wrapped() {
        let coverage = CoverageList::from_tokens(["NW3", "sw1a", "GU16"]).unwrap();
        assert_eq!(coverage.as_stored(), ",NW3,SW1A,GU16,");
        assert!(coverage.contains("NW3"));
        assert!(coverage.contains("sw1a "));
        assert!(!coverage.contains("W3"));
        assert!(!coverage.contains("NW"));
    }

    #[test]
    fn coverage_rejects_numeric_and_empty_tokens() {
        assert_eq!(
            CoverageList::from_tokens(["123"]),
            Err(CoverageError::NotAlphaPrefixed("123".into()))
        );
        assert_eq!(CoverageList::from_tokens([" "]), Err(CoverageError::EmptyToken));

        let coverage = CoverageList::from_tokens(["NW3"]).unwrap();
        assert!(!coverage.contains("3"));
        assert!(!coverage.contains(""));
    }

    #[test]
    fn coverage_display_and_reparse_round_trip() {
        let coverage = CoverageList::parse_display("SW1A, NW3,GU16").unwrap();
        assert_eq!(coverage.display(), "SW1A, NW3, GU16");
        assert_eq!(CoverageList::parse_display(&coverage.display()).unwrap(), coverage);
        assert_eq!(CoverageList::from_stored("NW3,GU16").as_stored(), ",NW3,GU16,");
    }

    #[test]
    fn coverage_deduplicates_preserving_order() {
        let coverage = CoverageList::from_tokens(["NW3", "nw3", "GU16"]).unwrap();
        assert_eq!(coverage.as_stored(), ",NW3,GU16,");
    }

    #[test]
    fn haversine_london_to_brighton() {
        let miles = haversine_miles(51.5074, -0.1278, 50.8225, -0.1372);
        assert!(miles > 45.0 && miles < 50.0, "got {miles}");
        assert!(haversine_miles(51.5, -0.1, 51.5, -0.1) < 1e-6);
    }

    #[test]
    fn status_codes_round_trip_and_gate_activity() {
        for status in ProviderStatus::all() {
            assert_eq!(ProviderStatus::from_code(status.code()), Some(status));
        }
        assert!(ProviderStatus::Active.is_active());
        assert!(!ProviderStatus::Pending.is_active());
        assert!(!ProviderStatus::Suspended.is_active());
        assert_eq!(ProviderStatus::from_code(9), None);
    }

    #[test]
    fn payload_decoding_defaults_the_schema_version() {
        let offer: Option<OfferPayload> =
            decode_payload(Some(r#"{"headline":"Ten pounds off"}"#)).unwrap();
        let offer = offer.unwrap();
        assert_eq!(offer.schema_version, 1);
        assert_eq!(offer.headline, "Ten pounds off");

        let none: Option<OfferPayload> = decode_payload(None).unwrap();
        assert!(none.is_none());
        let blank: Option<OfferPayload> = decode_payload(Some("  ")).unwrap();
        assert!(blank.is_none());
        assert!(decode_payload::<OfferPayload>(Some("{not json")).is_err());
    }

    #[test]
    fn first_name_takes_leading_word() {
        assert_eq!(first_name("Avery Dawson"), "Avery");
        assert_eq!(first_name("Cher"), "Cher");
        assert_eq!(first_name("  spaced  out "), "spaced");
    }
}
