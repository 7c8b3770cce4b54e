//! Core types shared by the cache tiers.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Prefix shared by every store this crate creates.
pub const STORE_PREFIX: &str = "_$shadowfiles-";

/// Generation baked into the store names. Bumping it orphans the old stores,
/// which are reclaimed on the next activation.
pub const STORE_VERSION: u32 = 1;

/// One of the two named stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  /// Discarded whenever the background context activates
  #[default]
  Ephemeral,
  /// Never cleared by the system
  Persistent,
}

impl Tier {
  /// Order in which tiers are probed on lookup. First hit wins.
  pub const LOOKUP_ORDER: [Tier; 2] = [Tier::Ephemeral, Tier::Persistent];

  /// Versioned store name backing this tier.
  pub fn store_name(self) -> String {
    match self {
      Tier::Ephemeral => format!("{STORE_PREFIX}store-v{STORE_VERSION}"),
      Tier::Persistent => format!("{STORE_PREFIX}persistent-store-v{STORE_VERSION}"),
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Tier::Ephemeral => "ephemeral",
      Tier::Persistent => "persistent",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Tier {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "ephemeral" => Ok(Tier::Ephemeral),
      "persistent" => Ok(Tier::Persistent),
      other => Err(eyre!("Unknown tier '{}' (expected ephemeral or persistent)", other)),
    }
  }
}

/// Normalized request identity used as the cache key.
///
/// Methods are upper-cased and URL fragments dropped, so `get /a#x` and
/// `GET /a` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url,
    }
  }

  /// Key for a plain `GET` of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Resolve a shadow file path against the sender's origin.
  pub fn resolve(origin: &Url, path: &str) -> Result<Self> {
    let url = origin
      .join(path)
      .map_err(|e| eyre!("Failed to resolve path '{}' against {}: {}", path, origin, e))?;
    Ok(Self::get(&url))
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 digest for stable, fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response as it sits in a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  /// Header names are kept lower-cased
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  /// A `200 OK` response carrying `body` and `headers`.
  pub fn new(body: Vec<u8>, headers: BTreeMap<String, String>) -> Self {
    Self::with_status(200, body, headers)
  }

  pub fn with_status(status: u16, body: Vec<u8>, headers: BTreeMap<String, String>) -> Self {
    let headers = headers
      .into_iter()
      .map(|(name, value)| (name.to_ascii_lowercase(), value))
      .collect();
    Self {
      status,
      headers,
      body,
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn set_header(&mut self, name: &str, value: &str) {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
  }
}

/// A stored response together with when it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: StoredResponse,
  pub stored_at: DateTime<Utc>,
}

/// Result of a tiered lookup.
#[derive(Debug, Clone)]
pub struct TierHit {
  /// Tier that answered the lookup
  pub tier: Tier,
  pub response: StoredResponse,
  pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_names_are_versioned() {
    assert_eq!(Tier::Ephemeral.store_name(), "_$shadowfiles-store-v1");
    assert_eq!(
      Tier::Persistent.store_name(),
      "_$shadowfiles-persistent-store-v1"
    );
  }

  #[test]
  fn test_key_normalizes_method_and_fragment() {
    let url = Url::parse("http://localhost/a.png#frag").unwrap();
    let key = RequestKey::new("get", &url);
    assert_eq!(key.method(), "GET");
    assert_eq!(key.url().as_str(), "http://localhost/a.png");
    assert_eq!(key, RequestKey::get(&Url::parse("http://localhost/a.png").unwrap()));
    assert_eq!(key.hash().len(), 64);
  }

  #[test]
  fn test_resolve_relative_path() {
    let origin = Url::parse("http://localhost:8080").unwrap();
    let key = RequestKey::resolve(&origin, "/img/a.png").unwrap();
    assert_eq!(key.url().as_str(), "http://localhost:8080/img/a.png");

    let key = RequestKey::resolve(&origin, "b.css").unwrap();
    assert_eq!(key.url().as_str(), "http://localhost:8080/b.css");
  }

  #[test]
  fn test_headers_are_case_insensitive() {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "image/png".to_string());
    let mut response = StoredResponse::new(vec![1, 2, 3], headers);
    assert_eq!(response.header("content-type"), Some("image/png"));

    response.set_header("X-Handled-By", "ShadowFiles");
    assert_eq!(response.header("x-handled-by"), Some("ShadowFiles"));
    assert_eq!(response.status, 200);
  }

  #[test]
  fn test_tier_from_str() {
    assert_eq!("Persistent".parse::<Tier>().unwrap(), Tier::Persistent);
    assert!("disk".parse::<Tier>().is_err());
  }
}
