use crate::cache::{CacheStorage, Request, RequestMode, SqliteStorage};
use crate::config::Config;
use crate::event::{ControlMessage, EventLoop, EventSender};
use crate::network::HttpFetcher;
use crate::worker::FetchOutcome;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use url::Url;

/// Events the host feeds in, one JSON object per line.
///
/// ```text
/// {"event": "install"}
/// {"event": "install", "version": "v2"}
/// {"event": "activate"}
/// {"event": "fetch", "url": "/crew.html", "mode": "navigate"}
/// {"event": "fetch", "url": "/booking", "method": "POST"}
/// {"event": "message", "data": {"type": "CLEAR_CACHE"}}
/// {"event": "caches"}
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum HostEvent {
  Install {
    #[serde(default)]
    version: Option<String>,
  },
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    mode: Option<String>,
  },
  Message {
    #[serde(default)]
    data: Value,
  },
  Caches,
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Site origin, parsed once
  origin: Url,

  /// Cache database shared with the controller
  storage: Arc<SqliteStorage>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let origin =
      Url::parse(&config.origin).map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    let storage = SqliteStorage::open_path(&config.database_path()?)?;

    Ok(Self {
      config,
      origin,
      storage: Arc::new(storage),
    })
  }

  /// Drive the controller from host events on stdin until EOF.
  pub async fn run(&self) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::new()?);
    let (sender, event_loop) =
      EventLoop::new(self.config.clone(), Arc::clone(&self.storage), fetcher);
    let worker = tokio::spawn(event_loop.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let reply = self.handle_line(&sender, line).await;
      println!("{}", reply);
    }

    // Closing the inbox lets the event loop finish
    drop(sender);
    worker.await?;
    Ok(())
  }

  async fn handle_line(&self, sender: &EventSender, line: &str) -> Value {
    let event: HostEvent = match serde_json::from_str(line) {
      Ok(event) => event,
      Err(e) => return json!({ "error": format!("Invalid event: {}", e) }),
    };
    debug!(?event, "Host event");

    match self.handle_event(sender, event).await {
      Ok(reply) => reply,
      Err(e) => json!({ "error": e.to_string() }),
    }
  }

  async fn handle_event(&self, sender: &EventSender, event: HostEvent) -> Result<Value> {
    let reply = match event {
      HostEvent::Install { version } => {
        let phase = sender.install(version).await?;
        json!({ "event": "install", "phase": phase.to_string() })
      }
      HostEvent::Activate => {
        let activated = sender.activate().await?;
        json!({ "event": "activate", "activated": activated })
      }
      HostEvent::Fetch { url, method, mode } => {
        let request = self.request(&url, method.as_deref(), mode.as_deref())?;
        let outcome = sender.fetch(request).await?;
        outcome_json(&url, &outcome)
      }
      HostEvent::Message { data } => {
        sender.post_message(ControlMessage::from_value(&data)).await?;
        json!({ "event": "message", "ok": true })
      }
      HostEvent::Caches => {
        let caches = sender.caches().await?;
        json!({ "event": "caches", "caches": caches })
      }
    };
    Ok(reply)
  }

  fn request(&self, url: &str, method: Option<&str>, mode: Option<&str>) -> Result<Request> {
    let url = Request::resolve(&self.origin, url)?;
    let method = match method {
      Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", m, e))?,
      None => Method::GET,
    };
    let mode = match mode {
      Some("navigate") => RequestMode::Navigate,
      _ => RequestMode::Other,
    };
    Ok(Request::new(method, url, mode))
  }

  /// Print every store with its entry count.
  pub fn list_caches(&self) -> Result<()> {
    let names = self.storage.keys()?;
    if names.is_empty() {
      println!("No caches");
      return Ok(());
    }
    for name in names {
      let count = self.storage.entries(&name)?.len();
      println!("{:<40} {:>5} entries", name, count);
    }
    Ok(())
  }

  /// Print the entries of one store.
  pub fn list_entries(&self, store: &str) -> Result<()> {
    if !self.storage.has(store)? {
      return Err(eyre!("Cache not found: {}", store));
    }
    for entry in self.storage.entries(store)? {
      println!(
        "{} {:>3} {:>8}B  {}",
        entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
        entry.status,
        entry.size,
        entry.url
      );
    }
    Ok(())
  }

  /// Delete every store, same as posting `CLEAR_CACHE`.
  pub fn clear(&self) -> Result<()> {
    let deleted = self.storage.clear_all()?;
    println!("Deleted {} caches", deleted);
    Ok(())
  }
}

fn outcome_json(url: &str, outcome: &FetchOutcome) -> Value {
  match outcome.response() {
    Some(response) => json!({
      "event": "fetch",
      "url": url,
      "outcome": outcome.kind(),
      "status": response.status,
      "size": response.body.len(),
      "body": response.text(),
    }),
    None => json!({
      "event": "fetch",
      "url": url,
      "outcome": outcome.kind(),
    }),
  }
}
