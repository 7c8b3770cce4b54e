//! Per-request substitution decision.

use color_eyre::Result;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use crate::cache::{CacheStorage, RequestKey, StoredResponse, TierManager};

/// Request header that disables interception for a single request.
pub const BYPASS_HEADER: &str = "x-sf-bypass";

/// Response header marking a substituted response.
pub const HANDLED_BY_HEADER: &str = "x-handled-by";
pub const HANDLED_BY_VALUE: &str = "ShadowFiles";

/// An outgoing request observed by the background context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  /// Header names are kept lower-cased
  pub headers: BTreeMap<String, String>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: BTreeMap::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// A present, non-empty bypass header opts the request out.
  pub fn bypasses_shadow(&self) -> bool {
    self
      .header(BYPASS_HEADER)
      .is_some_and(|value| !value.is_empty())
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Decides, per request, whether a shadow response replaces the network.
pub struct Interceptor<S: CacheStorage> {
  tiers: TierManager<S>,
}

impl<S: CacheStorage> Interceptor<S> {
  pub fn new(tiers: TierManager<S>) -> Self {
    Self { tiers }
  }

  /// Returns the substitute response, or `None` to fall through to the
  /// network.
  ///
  /// Bypassed requests return before any storage work. On a hit the response
  /// is tagged with the provenance header.
  pub async fn intercept(&self, request: &Request) -> Result<Option<StoredResponse>> {
    if request.bypasses_shadow() {
      debug!(url = %request.url, "Bypass header set, not intercepting");
      return Ok(None);
    }

    let key = request.key();
    let order = self.tiers.open_lookup_order().await?;

    match self.tiers.lookup(&order, &key).await? {
      Some(hit) => {
        debug!(%key, tier = %hit.tier, stored_at = %hit.stored_at, "Serving shadow file");
        let mut response = hit.response;
        response.set_header(HANDLED_BY_HEADER, HANDLED_BY_VALUE);
        Ok(Some(response))
      }
      None => Ok(None),
    }
  }
}

impl<S: CacheStorage> Clone for Interceptor<S> {
  fn clone(&self) -> Self {
    Self {
      tiers: self.tiers.clone(),
    }
  }
}
