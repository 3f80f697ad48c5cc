//! Request interception: one long-lived worker per process that answers
//! requests from the network or the cache and queues writes while offline.

mod lifecycle;
mod message;
mod strategy;

pub use lifecycle::LifecycleState;
pub use message::{ClientMessage, VersionReply};
pub use strategy::Route;

use color_eyre::{eyre::eyre, Result as AppResult};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheGeneration, CacheKey, CacheTier, Fetched, ResponseCache, ResponseSource};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::event::Trigger;
use crate::net::{Request, Response, Transport};
use crate::queue::WriteQueue;
use crate::store::KeyedStore;
use crate::sync::Broadcaster;
use crate::tracker::SyncTracker;
use lifecycle::Lifecycle;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
  /// Path prefix of the remote API, e.g. "/api/"
  pub api_prefix: String,
  /// Upper bound for every network call made by the worker
  pub timeout: Duration,
  pub cache_version: String,
  /// Served to navigations that fail while offline
  pub app_shell: Url,
  pub precache: Vec<Url>,
}

impl WorkerOptions {
  pub fn from_config(config: &Config) -> AppResult<Self> {
    let origin = config.remote.base()?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))
    };

    Ok(Self {
      api_prefix: config.remote.api_prefix.clone(),
      timeout: config.remote.timeout(),
      cache_version: config.cache.version.clone(),
      app_shell: resolve(&config.cache.app_shell)?,
      precache: config
        .cache
        .precache
        .iter()
        .map(|p| resolve(p))
        .collect::<AppResult<Vec<_>>>()?,
    })
  }
}

pub struct Worker<S: KeyedStore> {
  options: WorkerOptions,
  generation: CacheGeneration,
  cache: Arc<dyn ResponseCache>,
  transport: Arc<dyn Transport>,
  tracker: SyncTracker<S>,
  queue: WriteQueue<S>,
  /// Attached clients; also used to hold activation while any are present
  clients: Broadcaster,
  lifecycle: Mutex<Lifecycle>,
  triggers: Option<mpsc::UnboundedSender<Trigger>>,
}

impl<S: KeyedStore> Worker<S> {
  pub fn new(
    options: WorkerOptions,
    cache: Arc<dyn ResponseCache>,
    transport: Arc<dyn Transport>,
    tracker: SyncTracker<S>,
    queue: WriteQueue<S>,
    clients: Broadcaster,
  ) -> Self {
    Self {
      generation: CacheGeneration::new(options.cache_version.clone()),
      options,
      cache,
      transport,
      tracker,
      queue,
      clients,
      lifecycle: Mutex::new(Lifecycle::default()),
      triggers: None,
    }
  }

  /// Where to send `BackgroundSync` after queuing a write.
  pub fn with_triggers(mut self, triggers: mpsc::UnboundedSender<Trigger>) -> Self {
    self.triggers = Some(triggers);
    self
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle().state()
  }

  pub fn version(&self) -> &str {
    self.generation.version()
  }

  /// Bring the worker up for this process.
  ///
  /// A generation that was already activated resumes straight to `Active`.
  /// Otherwise the worker installs, then activates right away unless clients
  /// are attached, in which case it stays `Waiting` for `SKIP_WAITING`.
  pub async fn start(&self) -> Result<LifecycleState> {
    if self.cache.active_generation()?.as_deref() == Some(self.version()) {
      self.advance(LifecycleState::Active)?;
      info!(version = %self.version(), "Worker resumed");
      return Ok(LifecycleState::Active);
    }

    self.install().await?;
    if self.clients.client_count() == 0 {
      self.activate()?;
    } else {
      info!(clients = self.clients.client_count(), "Worker waiting for clients to detach");
    }
    Ok(self.state())
  }

  pub async fn install(&self) -> Result<()> {
    self.advance(LifecycleState::Installing)?;

    if let Err(e) = self.on_install().await {
      warn!(version = %self.version(), error = %e, "Install failed");
      self.advance(LifecycleState::Redundant)?;
      return Err(e);
    }

    self.advance(LifecycleState::Waiting)?;
    info!(version = %self.version(), "Worker installed");
    Ok(())
  }

  pub fn activate(&self) -> Result<()> {
    if self.try_activate()? {
      return Ok(());
    }
    Err(SyncError::InvalidTransition {
      from: self.state().to_string(),
      to: LifecycleState::Active.to_string(),
    })
  }

  /// Activate if `Waiting`; false when the worker is in any other state.
  /// The lifecycle stays locked from the check until the new state is set.
  fn try_activate(&self) -> Result<bool> {
    let mut lifecycle = self.lifecycle();
    if lifecycle.state() != LifecycleState::Waiting {
      return Ok(false);
    }
    self.on_activate()?;
    lifecycle.advance(LifecycleState::Active)?;
    info!(version = %self.version(), "Worker activated");
    Ok(true)
  }

  /// Precache the shell into the static tier of this generation.
  async fn on_install(&self) -> Result<()> {
    let static_cache = self.generation.cache_name(CacheTier::Static);
    self.cache.open_cache(&static_cache)?;

    for url in &self.options.precache {
      let request = Request::get(url.clone());
      let response = self.send(&request).await?;
      if !response.is_success() {
        return Err(SyncError::RemoteTransientFailure(format!(
          "precache {} returned {}",
          url, response.status
        )));
      }
      self
        .cache
        .store(&static_cache, &CacheKey::for_request(&request), &response)?;
    }
    debug!(assets = self.options.precache.len(), "Precache complete");
    Ok(())
  }

  /// Drop every cache this generation does not own.
  fn on_activate(&self) -> Result<()> {
    let current = self.generation.names();
    for name in self.cache.cache_names()? {
      if !current.contains(&name) {
        self.cache.delete_cache(&name)?;
        info!(cache = %name, "Deleted stale cache");
      }
    }
    self.cache.open_cache(&self.generation.cache_name(CacheTier::Api))?;
    self.cache.set_active_generation(self.version())
  }

  /// Answer one request the way the application would see it.
  pub async fn fetch(&self, request: Request) -> Result<Fetched> {
    match Route::for_request(&request, &self.options.api_prefix) {
      Route::Passthrough => {
        let response = self.send(&request).await?;
        Ok(Fetched::new(response, ResponseSource::Passthrough))
      }
      _ if self.state() != LifecycleState::Active => Ok(self.direct(&request).await),
      Route::NetworkFirst => self.network_first(request).await,
      Route::CacheFirst => self.cache_first(request).await,
    }
  }

  pub fn handle_message(&self, message: ClientMessage) -> Result<Option<VersionReply>> {
    match message {
      ClientMessage::SkipWaiting => {
        if !self.try_activate()? {
          debug!(state = %self.state(), "SKIP_WAITING ignored");
        }
        Ok(None)
      }
      ClientMessage::GetVersion => Ok(Some(VersionReply {
        version: self.version().to_string(),
      })),
    }
  }

  /// Not intercepting: network only, failure becomes a plain 503.
  async fn direct(&self, request: &Request) -> Fetched {
    match self.send(request).await {
      Ok(response) => Fetched::new(response, ResponseSource::Passthrough),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Direct request failed");
        Fetched::new(strategy::service_unavailable(), ResponseSource::Offline)
      }
    }
  }

  async fn send(&self, request: &Request) -> Result<Response> {
    match tokio::time::timeout(self.options.timeout, self.transport.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::NetworkUnreachable(format!(
        "{} {} timed out after {}ms",
        request.method,
        request.url,
        self.options.timeout.as_millis()
      ))),
    }
  }

  fn request_sync(&self) {
    if let Some(tx) = &self.triggers {
      if tx.send(Trigger::BackgroundSync).is_err() {
        debug!("Trigger loop not running; write stays queued");
      }
    }
  }

  fn advance(&self, next: LifecycleState) -> Result<()> {
    self.lifecycle().advance(next)
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
  }
}
