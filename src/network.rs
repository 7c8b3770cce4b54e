//! Real network access for requests the worker passes through.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::BTreeMap;

use crate::cache::StoredResponse;
use crate::interceptor::Request;

/// HTTP client used when no shadow response applies.
#[derive(Clone)]
pub struct Network {
  client: reqwest::Client,
}

impl Network {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shadowfiles/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }

  /// Issue `request` against the network unmodified.
  pub async fn fetch(&self, request: &Request) -> Result<StoredResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(StoredResponse::with_status(status, body.to_vec(), headers))
  }
}
