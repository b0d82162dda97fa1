//! One generation of the offline cache controller.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, Request, Response};
use crate::config::ControllerConfig;
use crate::event::ControlMessage;
use crate::network::Fetcher;

use super::lifecycle::Phase;

/// What the controller answered for an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Not intercepted; the page performs the request itself
  PassThrough,
  /// Served from a cache store
  Cache(Response),
  /// Served from the network (cache miss)
  Network(Response),
  /// Navigation failed offline, fallback page served
  Fallback(Response),
  /// Network failed and nothing could be served
  Failed,
}

impl FetchOutcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Cache(r) | Self::Network(r) | Self::Fallback(r) => Some(r),
      Self::PassThrough | Self::Failed => None,
    }
  }

  /// Short name used in logs and host output.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::PassThrough => "pass-through",
      Self::Cache(_) => "cache",
      Self::Network(_) => "network",
      Self::Fallback(_) => "fallback",
      Self::Failed => "failed",
    }
  }
}

/// Routing decision for one request.
///
/// The outcome is final before any background refresh starts; `revalidate`
/// carries the request to refresh once the outcome has been handed out.
#[derive(Debug)]
pub struct Route {
  pub outcome: FetchOutcome,
  pub revalidate: Option<Request>,
}

impl Route {
  fn done(outcome: FetchOutcome) -> Self {
    Self {
      outcome,
      revalidate: None,
    }
  }
}

/// Offline cache controller for one static generation.
///
/// Owns the static and runtime stores named in its config. Moves through
/// install and activate once, then routes every intercepted request:
/// cache hits are served immediately and refreshed in the background,
/// misses go to the network and are written through to the runtime store.
pub struct CacheController<S: CacheStorage, F: Fetcher> {
  config: ControllerConfig,
  storage: Arc<S>,
  fetcher: Arc<F>,
  phase: Arc<Mutex<Phase>>,
  skip_waiting: AtomicBool,
}

impl<S, F> CacheController<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(config: ControllerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      config,
      storage,
      fetcher,
      phase: Arc::new(Mutex::new(Phase::Parsed)),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &ControllerConfig {
    &self.config
  }

  pub fn phase(&self) -> Phase {
    current_phase(&self.phase)
  }

  fn advance(&self, next: Phase) -> Result<()> {
    let mut phase = self
      .phase
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    phase.advance(next)
  }

  /// Retire this generation. No-op if it is already redundant.
  pub fn mark_redundant(&self) {
    if let Ok(mut phase) = self.phase.lock() {
      let previous = *phase;
      if previous != Phase::Redundant {
        debug!(cache = %self.config.static_cache_name, from = %previous, "Controller is redundant");
        *phase = Phase::Redundant;
      }
    }
  }

  /// Ask to take over without waiting for the current generation's pages.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Populate the static store from the manifest, all or nothing.
  ///
  /// Every manifest entry must come back with status 200. On any failure
  /// nothing is written and the controller becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.advance(Phase::Installing)?;
    info!(cache = %self.config.static_cache_name, "Installing");

    match self.populate_static().await {
      Ok(count) => {
        self.advance(Phase::Installed)?;
        info!(cache = %self.config.static_cache_name, assets = count, "Installation complete");
        if self.config.skip_waiting_on_install {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        warn!(cache = %self.config.static_cache_name, "Installation failed: {}", e);
        self.mark_redundant();
        Err(e)
      }
    }
  }

  async fn populate_static(&self) -> Result<usize> {
    let requests = self
      .config
      .manifest
      .iter()
      .map(|path| Request::resolve(&self.config.origin, path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    info!(count = requests.len(), "Caching static assets");

    let entries = try_join_all(
      requests
        .into_iter()
        .map(|request| self.fetch_static(request)),
    )
    .await?;

    // SQLite writes block, keep them off the runtime threads
    let storage = Arc::clone(&self.storage);
    let cache_name = self.config.static_cache_name.clone();
    tokio::task::spawn_blocking(move || {
      storage
        .put_all(&cache_name, &entries)
        .map(|_| entries.len())
    })
    .await
    .map_err(|e| eyre!("Static cache write task failed: {}", e))?
  }

  async fn fetch_static(&self, request: Request) -> Result<(Request, Response)> {
    let response = self.fetcher.fetch(&request).await?;
    if !response.is_cacheable() {
      return Err(eyre!(
        "Static asset {} returned status {}",
        request.url,
        response.status
      ));
    }
    Ok((request, response))
  }

  /// Purge stores of other generations and start intercepting fetches.
  ///
  /// Cleanup is best effort: failures are logged and never retried.
  pub async fn activate(&self) -> Result<()> {
    self.advance(Phase::Activating)?;
    info!(cache = %self.config.static_cache_name, "Activating");

    match self.storage.keys() {
      Ok(names) => {
        for name in names.iter().filter(|n| !self.config.owns_cache(n)) {
          info!(cache = %name, "Deleting old cache");
          if let Err(e) = self.storage.delete(name) {
            warn!(cache = %name, "Failed to delete old cache: {}", e);
          }
        }
      }
      Err(e) => warn!("Failed to list caches during activation: {}", e),
    }

    if let Err(e) = self.storage.open(&self.config.runtime_cache_name) {
      warn!(cache = %self.config.runtime_cache_name, "Failed to open runtime cache: {}", e);
    }

    self.advance(Phase::Activated)?;
    info!(cache = %self.config.static_cache_name, "Activation complete, claiming clients");
    Ok(())
  }

  /// Route a request and start its background refresh, if any.
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    let route = self.route(request).await;
    if let Some(refresh) = route.revalidate {
      self.spawn_revalidation(refresh);
    }
    route.outcome
  }

  /// Decide how to answer a request, without refreshing anything yet.
  pub async fn route(&self, request: &Request) -> Route {
    if !self.phase().controls_fetches() {
      return Route::done(FetchOutcome::PassThrough);
    }

    if request.method != Method::GET || !request.is_same_origin(&self.config.origin) {
      debug!(method = %request.method, url = %request.url, "Not intercepted");
      return Route::done(FetchOutcome::PassThrough);
    }

    match self.storage.match_any(request) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, cache = %cached.cache_name, "Cache hit");
        return Route {
          outcome: FetchOutcome::Cache(cached.response),
          revalidate: Some(request.clone()),
        };
      }
      Ok(None) => debug!(url = %request.url, "Cache miss"),
      Err(e) => warn!(url = %request.url, "Cache lookup failed, treating as miss: {}", e),
    }

    Route::done(self.fetch_and_store(request).await)
  }

  async fn fetch_and_store(&self, request: &Request) -> FetchOutcome {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          store_runtime(
            &self.phase,
            &*self.storage,
            &self.config.runtime_cache_name,
            request,
            &response,
          );
        }
        FetchOutcome::Network(response)
      }
      Err(e) => {
        debug!(url = %request.url, "Network request failed: {}", e);
        if request.is_navigation() {
          self.fallback_page()
        } else {
          FetchOutcome::Failed
        }
      }
    }
  }

  fn fallback_page(&self) -> FetchOutcome {
    let request = match Request::resolve(&self.config.origin, &self.config.fallback_path) {
      Ok(url) => Request::get(url),
      Err(_) => return FetchOutcome::Failed,
    };

    match self.storage.match_any(&request) {
      Ok(Some(cached)) => FetchOutcome::Fallback(cached.response),
      Ok(None) => FetchOutcome::Failed,
      Err(e) => {
        warn!("Fallback page lookup failed: {}", e);
        FetchOutcome::Failed
      }
    }
  }

  /// Refresh the runtime entry for `request` on a detached task.
  ///
  /// Nobody awaits the task. Failures keep the existing entry, and a
  /// refresh that lands after this generation was replaced is dropped.
  pub fn spawn_revalidation(&self, request: Request) {
    let phase = Arc::clone(&self.phase);
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let cache_name = self.config.runtime_cache_name.clone();

    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) if response.is_cacheable() => {
          store_runtime(&phase, &*storage, &cache_name, &request, &response);
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Revalidation not cacheable, keeping cached copy");
        }
        Err(e) => {
          debug!(url = %request.url, "Revalidation failed, keeping cached copy: {}", e);
        }
      }
    });
  }

  /// Handle a control message posted by a page.
  pub fn handle_message(&self, message: &ControlMessage) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => {
        debug!(cache = %self.config.static_cache_name, "Skip waiting requested");
        self.skip_waiting();
        Ok(())
      }
      ControlMessage::ClearCache => {
        let deleted = self.clear_all()?;
        info!(count = deleted, "Cleared all caches");
        Ok(())
      }
      ControlMessage::Unknown => {
        debug!("Ignoring unknown control message");
        Ok(())
      }
    }
  }

  /// Delete every store, including those of other generations.
  pub fn clear_all(&self) -> Result<usize> {
    self.storage.clear_all()
  }
}

fn current_phase(phase: &Mutex<Phase>) -> Phase {
  phase.lock().map(|p| *p).unwrap_or(Phase::Redundant)
}

/// Write a response to the runtime store of a live generation.
///
/// Redundant generations write nothing, and the store must still exist:
/// a store purged by a newer generation is never brought back.
fn store_runtime<S: CacheStorage>(
  phase: &Mutex<Phase>,
  storage: &S,
  cache_name: &str,
  request: &Request,
  response: &Response,
) {
  if current_phase(phase) == Phase::Redundant {
    debug!(url = %request.url, cache = %cache_name, "Generation is redundant, not caching");
    return;
  }

  match storage.put_existing(cache_name, request, response) {
    Ok(true) => debug!(url = %request.url, cache = %cache_name, "Cached response"),
    Ok(false) => debug!(url = %request.url, cache = %cache_name, "Runtime cache is gone, not caching"),
    Err(e) => warn!(url = %request.url, "Failed to cache response: {}", e),
  }
}
