//! Core types for the caching system: requests, response snapshots and lookups.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation (the page itself)
  Navigate,
  /// Subresource request (stylesheets, scripts, images, ...)
  #[default]
  Other,
}

/// An outgoing request observed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url, mode: RequestMode) -> Self {
    Self { method, url, mode }
  }

  /// A plain GET subresource request.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url, RequestMode::Other)
  }

  /// A top-level navigation request.
  pub fn navigate(url: Url) -> Self {
    Self::new(Method::GET, url, RequestMode::Navigate)
  }

  /// Resolve `path` against `origin`. Absolute URLs are kept as-is.
  pub fn resolve(origin: &Url, path: &str) -> Result<Url> {
    origin
      .join(path)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", path, e))
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Whether the request targets the same scheme, host and port as `origin`.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }

  /// Stable key for storage: SHA256 of method and URL.
  ///
  /// The fragment is not part of the key, a `/page.html#crew` request matches
  /// `/page.html`.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A captured response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A 200 response with the given body.
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Only plain 200 responses are stored.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Body as UTF-8, replacing invalid sequences.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// A response found in one of the cache stores.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Name of the store the entry was found in
  pub cache_name: String,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Summary of a stored entry, for inspection.
#[derive(Debug, Clone)]
pub struct EntryInfo {
  pub url: String,
  pub status: u16,
  pub size: usize,
  pub cached_at: DateTime<Utc>,
}
