use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::{CacheStorage, Request};
use crate::config::Config;
use crate::network::Fetcher;
use crate::worker::{CacheController, FetchOutcome, Phase, Registration};

/// Control messages posted by pages, e.g. `{ "type": "CLEAR_CACHE" }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting generation now
  SkipWaiting,
  /// Delete every cache store
  ClearCache,
  /// Anything else; ignored
  #[serde(other)]
  Unknown,
}

impl ControlMessage {
  /// Interpret arbitrary message data. Data without a known `type` is `Unknown`.
  pub fn from_value(data: &serde_json::Value) -> Self {
    Self::deserialize(data).unwrap_or(Self::Unknown)
  }
}

/// Lifecycle events dispatched to the controller
#[derive(Debug)]
pub enum WorkerEvent {
  /// Install a generation; `version` overrides the configured tag
  Install {
    version: Option<String>,
    reply: oneshot::Sender<Result<Phase>>,
  },
  /// Activate the waiting generation
  Activate { reply: oneshot::Sender<Result<bool>> },
  /// An intercepted request
  Fetch {
    request: Request,
    reply: oneshot::Sender<FetchOutcome>,
  },
  /// A message posted by a page
  Message {
    message: ControlMessage,
    reply: oneshot::Sender<Result<()>>,
  },
  /// List cache store names
  Caches {
    reply: oneshot::Sender<Result<Vec<String>>>,
  },
}

/// Sending half of the controller inbox
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
  async fn request<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
  ) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(build(reply))
      .map_err(|_| eyre!("Event loop has stopped"))?;
    rx.await.map_err(|_| eyre!("Event loop dropped the reply"))
  }

  pub async fn install(&self, version: Option<String>) -> Result<Phase> {
    self
      .request(|reply| WorkerEvent::Install { version, reply })
      .await?
  }

  pub async fn activate(&self) -> Result<bool> {
    self.request(|reply| WorkerEvent::Activate { reply }).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    self
      .request(|reply| WorkerEvent::Fetch { request, reply })
      .await
  }

  pub async fn post_message(&self, message: ControlMessage) -> Result<()> {
    self
      .request(|reply| WorkerEvent::Message { message, reply })
      .await?
  }

  pub async fn caches(&self) -> Result<Vec<String>> {
    self.request(|reply| WorkerEvent::Caches { reply }).await?
  }
}

/// A generation whose install task has finished, posted back to the loop.
struct Installed<S: CacheStorage, F: Fetcher> {
  controller: Arc<CacheController<S, F>>,
  result: Result<()>,
  reply: oneshot::Sender<Result<Phase>>,
}

/// Receives worker events and dispatches them to the registration.
///
/// Registration changes (install bookkeeping, activate, messages) happen on
/// the loop one at a time. Populating a new generation's static store and
/// every fetch run on their own tasks, so the active generation keeps
/// answering while a successor installs.
pub struct EventLoop<S: CacheStorage, F: Fetcher> {
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
  installed_tx: mpsc::UnboundedSender<Installed<S, F>>,
  installed_rx: mpsc::UnboundedReceiver<Installed<S, F>>,
  pending_installs: usize,
  config: Config,
  registration: Registration<S, F>,
}

impl<S, F> EventLoop<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  /// Create the loop and the sender that feeds it.
  pub fn new(config: Config, storage: Arc<S>, fetcher: Arc<F>) -> (EventSender, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (installed_tx, installed_rx) = mpsc::unbounded_channel();
    let event_loop = Self {
      rx,
      installed_tx,
      installed_rx,
      pending_installs: 0,
      config,
      registration: Registration::new(storage, fetcher),
    };
    (EventSender { tx }, event_loop)
  }

  /// Process events until every sender is dropped and no install is
  /// still running.
  pub async fn run(mut self) {
    let mut inbox_open = true;
    while inbox_open || self.pending_installs > 0 {
      tokio::select! {
        event = self.rx.recv(), if inbox_open => match event {
          Some(event) => self.dispatch(event).await,
          None => inbox_open = false,
        },
        Some(installed) = self.installed_rx.recv() => {
          self.pending_installs -= 1;
          self.finish_install(installed).await;
        }
      }
    }
    debug!("Event loop finished");
  }

  async fn dispatch(&mut self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install { version, reply } => self.install(version.as_deref(), reply),
      WorkerEvent::Activate { reply } => {
        let _ = reply.send(self.registration.activate_waiting().await);
      }
      WorkerEvent::Fetch { request, reply } => self.fetch(request, reply),
      WorkerEvent::Message { message, reply } => {
        let result = self.registration.post_message(&message).await;
        if let Err(e) = &result {
          warn!("Failed to handle {:?}: {}", message, e);
        }
        let _ = reply.send(result);
      }
      WorkerEvent::Caches { reply } => {
        let _ = reply.send(self.registration.caches());
      }
    }
  }

  /// Start installing a generation on its own task.
  fn install(&mut self, version: Option<&str>, reply: oneshot::Sender<Result<Phase>>) {
    let config = match self.config.controller_config(version) {
      Ok(config) => config,
      Err(e) => {
        let _ = reply.send(Err(e));
        return;
      }
    };
    let controller = self.registration.controller(config);
    let installed_tx = self.installed_tx.clone();
    self.pending_installs += 1;

    tokio::spawn(async move {
      let result = controller.install().await;
      let _ = installed_tx.send(Installed {
        controller,
        result,
        reply,
      });
    });
  }

  async fn finish_install(&mut self, installed: Installed<S, F>) {
    let Installed {
      controller,
      result,
      reply,
    } = installed;

    let result = match result {
      Ok(()) => self.registration.installed(controller).await,
      Err(e) => Err(e),
    };
    let _ = reply.send(result);
  }

  fn fetch(&self, request: Request, reply: oneshot::Sender<FetchOutcome>) {
    let controller = match self.registration.active() {
      Some(c) => c,
      None => {
        let _ = reply.send(FetchOutcome::PassThrough);
        return;
      }
    };

    tokio::spawn(async move {
      let route = controller.route(&request).await;
      // The page gets its answer before the refresh starts
      let _ = reply.send(route.outcome);
      if let Some(refresh) = route.revalidate {
        controller.spawn_revalidation(refresh);
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Response, SqliteStorage};
  use crate::network::testing::{Reply, ScriptedFetcher};
  use serde_json::json;
  use std::time::Duration;

  #[test]
  fn test_parse_control_messages() {
    assert_eq!(
      ControlMessage::from_value(&json!({ "type": "SKIP_WAITING" })),
      ControlMessage::SkipWaiting
    );
    assert_eq!(
      ControlMessage::from_value(&json!({ "type": "CLEAR_CACHE" })),
      ControlMessage::ClearCache
    );
    assert_eq!(
      ControlMessage::from_value(&json!({ "type": "SYNC_BOOKINGS" })),
      ControlMessage::Unknown
    );
    assert_eq!(
      ControlMessage::from_value(&json!("CLEAR_CACHE")),
      ControlMessage::Unknown
    );
    assert_eq!(
      ControlMessage::from_value(&serde_json::Value::Null),
      ControlMessage::Unknown
    );
  }

  fn site() -> Config {
    let mut config = Config {
      origin: "https://space-tourism.test".to_string(),
      ..Config::default()
    };
    config.cache.manifest = vec!["/index.html".to_string()];
    config
  }

  fn spawn_loop(fetcher: ScriptedFetcher) -> (Arc<SqliteStorage>, EventSender) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sender, event_loop) = EventLoop::new(site(), storage.clone(), Arc::new(fetcher));
    tokio::spawn(event_loop.run());
    (storage, sender)
  }

  fn request(path: &str) -> Request {
    let origin = url::Url::parse("https://space-tourism.test").unwrap();
    Request::get(Request::resolve(&origin, path).unwrap())
  }

  #[tokio::test]
  async fn test_fetch_before_install_passes_through() {
    let (_, sender) = spawn_loop(ScriptedFetcher::new());
    let outcome = sender.fetch(request("/index.html")).await.unwrap();
    assert_eq!(outcome, FetchOutcome::PassThrough);
  }

  #[tokio::test]
  async fn test_lifecycle_through_inbox() {
    let fetcher = ScriptedFetcher::new()
      .respond("/index.html", 200, "home")
      .respond("/404.html", 200, "lost")
      .respond("/crew.html", 200, "crew");
    let (storage, sender) = spawn_loop(fetcher);

    assert_eq!(sender.install(None).await.unwrap(), Phase::Activated);
    assert_eq!(
      sender.fetch(request("/index.html")).await.unwrap(),
      FetchOutcome::Cache(Response::ok("home"))
    );
    assert_eq!(
      sender.fetch(request("/crew.html")).await.unwrap(),
      FetchOutcome::Network(Response::ok("crew"))
    );
    assert!(storage
      .match_request("space-tourism-runtime-v1", &request("/crew.html"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_concurrent_fetches() {
    let fetcher = ScriptedFetcher::new()
      .respond("/index.html", 200, "home")
      .respond("/404.html", 200, "lost");
    for i in 0..20 {
      fetcher.set(
        &format!("/planet-{}.html", i),
        Reply::Slow(
          Duration::from_millis(20),
          Response::ok(format!("planet {}", i)),
        ),
      );
    }
    let (_, sender) = spawn_loop(fetcher);
    sender.install(None).await.unwrap();

    let fetches = (0..20).map(|i| {
      let sender = sender.clone();
      async move { sender.fetch(request(&format!("/planet-{}.html", i))).await }
    });
    let outcomes = futures::future::try_join_all(fetches).await.unwrap();

    for (i, outcome) in outcomes.iter().enumerate() {
      assert_eq!(outcome.response().unwrap().text(), format!("planet {}", i));
    }
  }

  #[tokio::test]
  async fn test_fetch_during_slow_install() {
    let fetcher = ScriptedFetcher::new()
      .respond("/index.html", 200, "home")
      .respond("/404.html", 200, "lost")
      .respond("/crew.html", 200, "crew");
    let fetcher = Arc::new(fetcher);
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sender, event_loop) = EventLoop::new(site(), storage, fetcher.clone());
    tokio::spawn(event_loop.run());
    assert_eq!(sender.install(None).await.unwrap(), Phase::Activated);

    // v2's manifest takes far longer than any fetch may wait
    fetcher.set(
      "/index.html",
      Reply::Slow(Duration::from_secs(5), Response::ok("home v2")),
    );
    let installing = {
      let sender = sender.clone();
      tokio::spawn(async move { sender.install(Some("v2".to_string())).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = tokio::time::timeout(
      Duration::from_secs(1),
      sender.fetch(request("/crew.html")),
    )
    .await
    .expect("fetch must not wait for the install")
    .unwrap();
    assert_eq!(outcome, FetchOutcome::Network(Response::ok("crew")));

    let index = tokio::time::timeout(
      Duration::from_secs(1),
      sender.fetch(request("/index.html")),
    )
    .await
    .expect("fetch must not wait for the install")
    .unwrap();
    assert_eq!(index, FetchOutcome::Cache(Response::ok("home")));

    installing.abort();
  }

  #[tokio::test]
  async fn test_unawaited_install_still_lands() {
    let fetcher = ScriptedFetcher::new().respond("/404.html", 200, "lost");
    fetcher.set(
      "/index.html",
      Reply::Slow(Duration::from_millis(50), Response::ok("home")),
    );
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sender, event_loop) = EventLoop::new(site(), storage.clone(), Arc::new(fetcher));
    let running = tokio::spawn(event_loop.run());

    let installing = tokio::spawn(async move { sender.install(None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Nobody waits for the reply and the last sender is gone
    installing.abort();

    tokio::time::timeout(Duration::from_secs(1), running)
      .await
      .expect("loop stops once the install has landed")
      .unwrap();
    let mut names = storage.keys().unwrap();
    names.sort();
    assert_eq!(names, vec!["space-tourism-runtime-v1", "space-tourism-v1"]);
  }

  #[tokio::test]
  async fn test_clear_cache_message_empties_storage() {
    let fetcher = ScriptedFetcher::new()
      .respond("/index.html", 200, "home")
      .respond("/404.html", 200, "lost");
    let (_, sender) = spawn_loop(fetcher);
    sender.install(None).await.unwrap();
    assert_eq!(sender.caches().await.unwrap().len(), 2);

    sender
      .post_message(ControlMessage::ClearCache)
      .await
      .unwrap();

    assert!(sender.caches().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_install_reports_error() {
    let (storage, sender) = spawn_loop(ScriptedFetcher::new());

    assert!(sender.install(None).await.is_err());
    assert!(storage.keys().unwrap().is_empty());
    // No waiting generation to activate
    assert!(!sender.activate().await.unwrap());
  }
}
