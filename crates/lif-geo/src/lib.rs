//! Postcode-resolver boundary for LIF: the resolution contract, an HTTP
//! implementation, and a fixed in-memory implementation for tests and
//! offline use.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

pub const CRATE_NAME: &str = "lif-geo";

/// Outcome of a postcode lookup. An unknown or unparsable postcode is an
/// expected input, not an error: the ranker's fallback branch consumes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Resolved { latitude: f64, longitude: f64 },
    Unresolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

#[async_trait]
pub trait PostcodeResolver: Send + Sync {
    /// Resolve free-text postcode input to coordinates. Never fails upward:
    /// transport errors and not-found results both come back `Unresolved`,
    /// indistinguishable by design.
    async fn resolve(&self, postcode: &str) -> Resolution;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.postcodes.io".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    result: Option<Vec<LookupPoint>>,
}

#[derive(Debug, Deserialize)]
struct LookupPoint {
    latitude: f64,
    longitude: f64,
}

/// Interpret a lookup response body. Status 200 with a non-empty result list
/// is the only success shape; everything else is `Unresolved`.
fn interpret_body(http_status: u16, body: &str) -> Resolution {
    if !(200..300).contains(&http_status) {
        return Resolution::Unresolved;
    }
    let Ok(parsed) = serde_json::from_str::<LookupBody>(body) else {
        return Resolution::Unresolved;
    };
    if parsed.status.unwrap_or(200) != 200 {
        return Resolution::Unresolved;
    }
    match parsed.result.and_then(|points| points.into_iter().next()) {
        Some(point) => Resolution::Resolved {
            latitude: point.latitude,
            longitude: point.longitude,
        },
        None => Resolution::Unresolved,
    }
}

/// Resolver backed by a postcodes.io-style lookup service.
#[derive(Debug)]
pub struct HttpPostcodeResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPostcodeResolver {
    pub fn new(config: ResolverConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building postcode lookup client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn lookup_url(&self, postcode: &str) -> String {
        format!(
            "{}/postcodes/{}",
            self.base_url,
            urlencoding::encode(postcode.trim())
        )
    }
}

#[async_trait]
impl PostcodeResolver for HttpPostcodeResolver {
    async fn resolve(&self, postcode: &str) -> Resolution {
        if postcode.trim().is_empty() {
            return Resolution::Unresolved;
        }
        let url = self.lookup_url(postcode);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, postcode, "postcode lookup transport failure");
                return Resolution::Unresolved;
            }
        };
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, postcode, "postcode lookup body read failure");
                return Resolution::Unresolved;
            }
        };
        interpret_body(status, &body)
    }
}

/// Fixed resolver over an in-memory postcode table. Keys are matched after
/// whitespace removal and upper-casing.
#[derive(Debug, Default)]
pub struct FixedResolver {
    points: HashMap<String, (f64, f64)>,
}

impl FixedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, postcode: &str, latitude: f64, longitude: f64) -> Self {
        self.points
            .insert(normalize_key(postcode), (latitude, longitude));
        self
    }
}

fn normalize_key(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

#[async_trait]
impl PostcodeResolver for FixedResolver {
    async fn resolve(&self, postcode: &str) -> Resolution {
        match self.points.get(&normalize_key(postcode)) {
            Some((latitude, longitude)) => Resolution::Resolved {
                latitude: *latitude,
                longitude: *longitude,
            },
            None => Resolution::Unresolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_body_resolves_first_point() {
        let body = r#"{"status":200,"result":[{"latitude":51.5,"longitude":-0.12},{"latitude":0.0,"longitude":0.0}]}"#;
        assert_eq!(
            interpret_body(200, body),
            Resolution::Resolved {
                latitude: 51.5,
                longitude: -0.12
            }
        );
    }

    #[test]
    fn non_success_shapes_are_unresolved() {
        let ok = r#"{"status":200,"result":[{"latitude":51.5,"longitude":-0.12}]}"#;
        assert_eq!(interpret_body(404, ok), Resolution::Unresolved);
        assert_eq!(interpret_body(500, ok), Resolution::Unresolved);
        assert_eq!(
            interpret_body(200, r#"{"status":404,"result":[]}"#),
            Resolution::Unresolved
        );
        assert_eq!(
            interpret_body(200, r#"{"status":200,"result":[]}"#),
            Resolution::Unresolved
        );
        assert_eq!(interpret_body(200, "not json"), Resolution::Unresolved);
        assert_eq!(interpret_body(200, r#"{"status":200}"#), Resolution::Unresolved);
    }

    #[test]
    fn lookup_url_is_percent_encoded() {
        let resolver = HttpPostcodeResolver::new(ResolverConfig {
            base_url: "https://lookup.test/".to_string(),
            ..ResolverConfig::default()
        })
        .unwrap();
        assert_eq!(
            resolver.lookup_url(" SW1A 1AA "),
            "https://lookup.test/postcodes/SW1A%201AA"
        );
    }

    #[tokio::test]
    async fn fixed_resolver_normalizes_keys() {
        let resolver = FixedResolver::new().with("gu16 7er", 51.29, -0.75);
        assert_eq!(
            resolver.resolve("GU167ER").await,
            Resolution::Resolved {
                latitude: 51.29,
                longitude: -0.75
            }
        );
        assert_eq!(resolver.resolve("ZZ9 9ZZ").await, Resolution::Unresolved);
        assert_eq!(resolver.resolve("").await, Resolution::Unresolved);
    }
}
