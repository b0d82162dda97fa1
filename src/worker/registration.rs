//! Host-side bookkeeping of cache generations.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, Request};
use crate::config::ControllerConfig;
use crate::event::ControlMessage;
use crate::network::Fetcher;

use super::controller::{CacheController, FetchOutcome};
use super::lifecycle::Phase;

/// Holds the waiting and active generations of the controller.
///
/// At most one generation is active. A newly installed generation waits
/// until it asks to skip waiting or the host activates it; the generation
/// it replaces becomes redundant. A failed install never touches the
/// active generation.
pub struct Registration<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  waiting: Option<Arc<CacheController<S, F>>>,
  active: Option<Arc<CacheController<S, F>>>,
}

impl<S, F> Registration<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      waiting: None,
      active: None,
    }
  }

  /// Create a controller sharing this registration's storage and network.
  pub fn controller(&self, config: ControllerConfig) -> Arc<CacheController<S, F>> {
    Arc::new(CacheController::new(
      config,
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
    ))
  }

  pub fn active(&self) -> Option<Arc<CacheController<S, F>>> {
    self.active.clone()
  }

  pub fn waiting(&self) -> Option<Arc<CacheController<S, F>>> {
    self.waiting.clone()
  }

  /// Install a new generation and return the phase it ended up in.
  pub async fn install(&mut self, controller: Arc<CacheController<S, F>>) -> Result<Phase> {
    controller.install().await?;
    self.installed(controller).await
  }

  /// Take over a generation whose install already succeeded.
  ///
  /// It becomes the waiting generation, replacing any previous one, and is
  /// activated right away if it asked to skip waiting.
  pub async fn installed(&mut self, controller: Arc<CacheController<S, F>>) -> Result<Phase> {
    if let Some(previous) = self.waiting.replace(Arc::clone(&controller)) {
      debug!(cache = %previous.config().static_cache_name, "Replacing waiting generation");
      previous.mark_redundant();
    }

    if controller.wants_skip_waiting() {
      self.activate_waiting().await?;
    } else {
      info!(cache = %controller.config().static_cache_name, "Installed, waiting to activate");
    }

    Ok(controller.phase())
  }

  /// Promote the waiting generation. Returns false if nothing was waiting.
  pub async fn activate_waiting(&mut self) -> Result<bool> {
    let controller = match self.waiting.take() {
      Some(c) => c,
      None => return Ok(false),
    };

    if let Err(e) = controller.activate().await {
      controller.mark_redundant();
      return Err(e);
    }

    if let Some(previous) = self.active.replace(controller) {
      previous.mark_redundant();
    }

    Ok(true)
  }

  /// Dispatch a request to the active generation.
  pub async fn fetch(&self, request: &Request) -> FetchOutcome {
    match &self.active {
      Some(controller) => controller.handle_fetch(request).await,
      None => FetchOutcome::PassThrough,
    }
  }

  /// Deliver a control message posted by a page.
  ///
  /// `SKIP_WAITING` targets the waiting generation and activates it.
  /// Everything else goes to the active generation, or the waiting one if
  /// nothing is active yet.
  pub async fn post_message(&mut self, message: &ControlMessage) -> Result<()> {
    if *message == ControlMessage::SkipWaiting {
      if let Some(waiting) = &self.waiting {
        waiting.handle_message(message)?;
        self.activate_waiting().await?;
      } else {
        debug!("No waiting generation, ignoring skip waiting");
      }
      return Ok(());
    }

    match self.active.as_ref().or(self.waiting.as_ref()) {
      Some(controller) => controller.handle_message(message),
      None => {
        debug!("No controller to receive message");
        Ok(())
      }
    }
  }

  /// Names of all cache stores.
  pub fn caches(&self) -> Result<Vec<String>> {
    self.storage.keys()
  }
}
