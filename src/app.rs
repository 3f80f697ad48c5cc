use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{Fetched, ResponseCache, SqliteResponseCache};
use crate::config::Config;
use crate::db::Database;
use crate::event::{EventHandler, Trigger};
use crate::net::{HttpTransport, Method, Request, Transport};
use crate::queue::WriteQueue;
use crate::store::SqliteStore;
use crate::sync::{Broadcaster, InFlight, SyncCoordinator, SyncSummary};
use crate::tracker::{DurableRecord, EntityRef, SyncTracker, TrackedRecord};
use crate::worker::{ClientMessage, LifecycleState, VersionReply, Worker, WorkerOptions};

/// How a conflicting entity should be settled
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// Push the local copy again, optionally replacing its payload first
  KeepLocal(Option<Value>),
  /// Drop the local copy and its queued writes
  DiscardLocal,
}

/// Snapshot for the `status` command
#[derive(Debug)]
pub struct Status {
  pub pending: Vec<TrackedRecord>,
  pub conflicts: Vec<TrackedRecord>,
  pub queued: usize,
  pub active_generation: Option<String>,
}

/// Everything one process needs, wired over a single database.
pub struct App {
  config: Config,
  db: Arc<Database>,
  cache: Arc<SqliteResponseCache>,
  transport: Arc<dyn Transport>,
  tracker: SyncTracker<SqliteStore>,
  queue: WriteQueue<SqliteStore>,
  worker: Worker<SqliteStore>,
  coordinator: SyncCoordinator<SqliteStore>,
  events: EventHandler,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::new(config.store_path()?));
    let transport = Arc::new(HttpTransport::new(config.remote.timeout())?);
    Self::with_parts(config, db, transport)
  }

  pub(crate) fn with_parts(
    config: Config,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
    let cache = Arc::new(SqliteResponseCache::new(Arc::clone(&db)));
    let inflight = Arc::new(InFlight::default());
    let clients = Broadcaster::default();
    let events = EventHandler::new();

    let tracker = SyncTracker::new(Arc::clone(&store), Arc::clone(&inflight));
    let queue = WriteQueue::new(Arc::clone(&store));

    let worker = Worker::new(
      WorkerOptions::from_config(&config)?,
      cache.clone(),
      Arc::clone(&transport),
      tracker.clone(),
      queue.clone(),
      clients.clone(),
    )
    .with_triggers(events.sender());

    let coordinator = SyncCoordinator::new(
      tracker.clone(),
      queue.clone(),
      Arc::clone(&transport),
      config.remote.api_base()?,
      inflight,
      clients,
    )
    .with_concurrency(config.sync.concurrency);

    Ok(Self {
      config,
      db,
      cache,
      transport,
      tracker,
      queue,
      worker,
      coordinator,
      events,
    })
  }

  pub fn database_path(&self) -> Option<&Path> {
    self.db.path()
  }

  /// Bring the worker up. A failed install leaves it redundant, so requests
  /// still go to the network; that is logged rather than fatal.
  pub async fn start_worker(&self) -> LifecycleState {
    if self.worker.state() != LifecycleState::Created {
      return self.worker.state();
    }
    match self.worker.start().await {
      Ok(state) => state,
      Err(e) => {
        warn!(error = %e, "Worker failed to start; requests will not be intercepted");
        self.worker.state()
      }
    }
  }

  /// Serve until Ctrl-C: every trigger spawns one coordinator pass.
  ///
  /// This is the sync daemon. It brings the worker up so the cache
  /// generation is installed and activated, but takes no requests itself;
  /// requests reach the worker through `fetch` and `message`, each CLI
  /// invocation being one short-lived client. Embedders that keep clients
  /// attached drive `Worker` directly, which is where `Waiting` applies.
  pub async fn run(&mut self) -> Result<()> {
    let state = self.start_worker().await;
    info!(state = %state, version = %self.worker.version(), "Worker started");

    self.events.spawn_periodic(self.config.sync.interval());
    self.events.spawn_probe(
      Arc::clone(&self.transport),
      self.config.remote.api_base()?,
      self.config.sync.probe_interval(),
    );

    // Drain whatever an earlier run left behind.
    self.spawn_sync(Trigger::Manual);

    loop {
      let trigger = tokio::select! {
        trigger = self.events.next() => trigger,
        _ = tokio::signal::ctrl_c() => {
          info!("Shutting down");
          None
        }
      };
      let Some(trigger) = trigger else {
        break;
      };
      self.spawn_sync(trigger);
    }

    self.db.close()?;
    Ok(())
  }

  fn spawn_sync(&self, trigger: Trigger) {
    let coordinator = self.coordinator.clone();
    tokio::spawn(async move {
      info!(?trigger, "Sync triggered");
      if let Err(e) = coordinator.run_once().await {
        error!(?trigger, error = %e, "Sync pass failed");
      }
    });
  }

  pub async fn fetch(&self, request: Request) -> Result<Fetched> {
    self.start_worker().await;
    Ok(self.worker.fetch(request).await?)
  }

  pub async fn message(&self, message: ClientMessage) -> Result<Option<VersionReply>> {
    self.start_worker().await;
    Ok(self.worker.handle_message(message)?)
  }

  pub fn save(&self, entity: &EntityRef, payload: Value) -> Result<DurableRecord> {
    Ok(self.tracker.save_local(entity, payload)?)
  }

  pub async fn sync(&self) -> Result<SyncSummary> {
    Ok(self.coordinator.run_once().await?)
  }

  pub fn resolve(&self, entity: &EntityRef, resolution: Resolution) -> Result<()> {
    let Some(record) = self.tracker.get(entity)? else {
      return Err(eyre!("No local record for {}", entity));
    };
    info!(entity = %entity, status = %record.sync_status, ?resolution, "Resolving");

    match resolution {
      Resolution::KeepLocal(payload) => {
        self.coordinator.keep_local(entity, payload)?;
      }
      Resolution::DiscardLocal => {
        self.coordinator.discard_local(entity)?;
      }
    }
    Ok(())
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      pending: self.tracker.list_pending()?,
      conflicts: self.tracker.list_conflicts()?,
      queued: self.queue.len()?,
      active_generation: self.cache.active_generation()?,
    })
  }
}

/// Resolve a CLI URL argument: absolute, or a path on the configured origin.
pub fn request_url(config: &Config, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => config
      .remote
      .base()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e)),
    Err(e) => Err(eyre!("Invalid URL {}: {}", target, e)),
  }
}

/// Build the request for the `fetch` command. A navigation is always a GET.
pub fn build_request(
  config: &Config,
  method: Method,
  target: &str,
  body: Option<Value>,
  navigate: bool,
) -> Result<Request> {
  let url = request_url(config, target)?;
  let mut request = if navigate {
    if method != Method::Get {
      return Err(eyre!("--navigate only applies to GET, not {}", method));
    }
    Request::navigate(url)
  } else {
    Request::new(method, url)
  };
  if let Some(body) = body {
    request = request.with_json(&body);
  }
  Ok(request)
}
