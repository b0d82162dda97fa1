//! The network primitive used by the controller.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};

use crate::cache::{Request, Response};

/// Issues requests over the network.
///
/// An `Err` means the request never produced a response (no connectivity,
/// DNS failure, connection reset). Any HTTP status, including errors, is `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Fetcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("orbit/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
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

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
