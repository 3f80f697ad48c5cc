//! Replays locally made changes against the remote API.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::inflight::InFlight;
use super::notify::{Broadcaster, SyncEvent};
use crate::error::{Result, SyncError};
use crate::net::{Method, Response, Transport};
use crate::queue::{QueuedWriteRequest, WriteQueue};
use crate::store::KeyedStore;
use crate::tracker::{payload_id, DurableRecord, EntityRef, SyncStatus, SyncTracker};

/// Counts from one coordinator pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
  /// Lanes fully applied on the server
  pub synced: usize,
  /// Lanes the server refused; now awaiting manual resolution
  pub conflicts: usize,
  /// Lanes left pending after a transient failure
  pub deferred: usize,
  /// Lanes replayed elsewhere or blocked by an open conflict
  pub skipped: usize,
}

impl SyncSummary {
  fn record(&mut self, outcome: LaneOutcome) {
    match outcome {
      LaneOutcome::Synced => self.synced += 1,
      LaneOutcome::Conflict => self.conflicts += 1,
      LaneOutcome::Deferred => self.deferred += 1,
      LaneOutcome::Skipped => self.skipped += 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneOutcome {
  Synced,
  Conflict,
  Deferred,
  Skipped,
}

/// Writes that must be replayed in order: everything queued for one entity,
/// or a single request with no entity.
struct Lane {
  key: String,
  entity: Option<EntityRef>,
  entries: Vec<QueuedWriteRequest>,
  /// False for upserts synthesized from a pending record
  persisted: bool,
}

pub struct SyncCoordinator<S: KeyedStore> {
  tracker: SyncTracker<S>,
  queue: WriteQueue<S>,
  transport: Arc<dyn Transport>,
  api_base: Url,
  inflight: Arc<InFlight>,
  notifier: Broadcaster,
  concurrency: usize,
}

impl<S: KeyedStore> Clone for SyncCoordinator<S> {
  fn clone(&self) -> Self {
    Self {
      tracker: self.tracker.clone(),
      queue: self.queue.clone(),
      transport: Arc::clone(&self.transport),
      api_base: self.api_base.clone(),
      inflight: Arc::clone(&self.inflight),
      notifier: self.notifier.clone(),
      concurrency: self.concurrency,
    }
  }
}

impl<S: KeyedStore> SyncCoordinator<S> {
  /// `api_base` is the URL upserts for pending records are built from,
  /// e.g. "https://ops.example.org/api/". `inflight` must be the registry the
  /// tracker was built with.
  pub fn new(
    tracker: SyncTracker<S>,
    queue: WriteQueue<S>,
    transport: Arc<dyn Transport>,
    api_base: Url,
    inflight: Arc<InFlight>,
    notifier: Broadcaster,
  ) -> Self {
    Self {
      tracker,
      queue,
      transport,
      api_base,
      inflight,
      notifier,
      concurrency: 4,
    }
  }

  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// One full pass over the queue and the pending records.
  ///
  /// Safe to call concurrently: each lane is replayed under a per-entity
  /// claim and entries are re-checked under that claim before replay.
  pub async fn run_once(&self) -> Result<SyncSummary> {
    self.notifier.publish(SyncEvent::SyncStart);

    let (summary, failure) = self.drain().await;

    self.notifier.publish(SyncEvent::SyncComplete {
      synced: summary.synced,
      conflicts: summary.conflicts,
    });
    info!(
      synced = summary.synced,
      conflicts = summary.conflicts,
      deferred = summary.deferred,
      skipped = summary.skipped,
      "Sync pass finished"
    );

    match failure {
      Some(e) => Err(e),
      None => Ok(summary),
    }
  }

  async fn drain(&self) -> (SyncSummary, Option<SyncError>) {
    let mut summary = SyncSummary::default();

    let lanes = match self.plan() {
      Ok(lanes) => lanes,
      Err(e) => {
        error!(error = %e, "Could not read pending writes");
        return (summary, Some(e));
      }
    };

    let outcomes: Vec<Result<LaneOutcome>> = stream::iter(lanes)
      .map(|lane| self.replay_lane(lane))
      .buffer_unordered(self.concurrency)
      .collect()
      .await;

    let mut failure = None;
    for outcome in outcomes {
      match outcome {
        Ok(outcome) => summary.record(outcome),
        Err(e) => {
          error!(error = %e, "Replay aborted");
          failure.get_or_insert(e);
        }
      }
    }
    (summary, failure)
  }

  fn plan(&self) -> Result<Vec<Lane>> {
    let mut lanes: Vec<Lane> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for entry in self.queue.list()? {
      let key = entry.lane();
      match by_key.get(&key) {
        Some(&i) => lanes[i].entries.push(entry),
        None => {
          by_key.insert(key.clone(), lanes.len());
          lanes.push(Lane {
            key,
            entity: entry.entity.clone(),
            entries: vec![entry],
            persisted: true,
          });
        }
      }
    }

    // Edits saved without going through a request still need pushing.
    for tracked in self.tracker.list_pending()? {
      let entity = tracked.entity();
      let key = entity.to_string();
      if by_key.contains_key(&key) {
        continue;
      }
      let entry = QueuedWriteRequest::upsert(&self.api_base, &entity, &tracked.record)?;
      lanes.push(Lane {
        key,
        entity: Some(entity),
        entries: vec![entry],
        persisted: false,
      });
    }

    debug!(lanes = lanes.len(), "Sync plan built");
    Ok(lanes)
  }

  async fn replay_lane(&self, lane: Lane) -> Result<LaneOutcome> {
    let Some(_claim) = self.inflight.try_claim(&lane.key) else {
      debug!(lane = %lane.key, "Lane already replaying");
      return Ok(LaneOutcome::Skipped);
    };

    let mut entity = lane.entity.clone();
    let mut expected_last_modified = None;
    if let Some(e) = &entity {
      match self.tracker.get(e)? {
        Some(record) if record.sync_status == SyncStatus::Conflict => {
          debug!(entity = %e, "Entity awaiting conflict resolution");
          return Ok(LaneOutcome::Skipped);
        }
        Some(record) => expected_last_modified = Some(record.last_modified),
        None => {}
      }
    }

    let mut last_response: Option<Response> = None;
    let mut deleted = false;

    for mut entry in lane.entries {
      if lane.persisted && !self.queue.contains(&entry.id)? {
        // Consumed by a pass that finished before we got the claim.
        continue;
      }
      let moved = match (&entity, &entry.entity) {
        (Some(current), Some(original)) if current.id != original.id => {
          Some((original.id.clone(), current.id.clone()))
        }
        _ => None,
      };
      if let Some((old_id, new_id)) = moved {
        entry.retarget(&old_id, &new_id);
      }

      match self.replay(&entry).await {
        Ok(response) => {
          if lane.persisted {
            self.queue.remove(&entry.id)?;
          }
          deleted = entry.method == Method::Delete;

          if let Some(e) = entity.clone() {
            if deleted {
              self.tracker.remove(&e)?;
            } else if let Some(new_id) = response
              .json_body()
              .as_ref()
              .and_then(payload_id)
              .filter(|id| *id != e.id)
            {
              // Later writes in this lane (and the record) follow the new id.
              self.tracker.rekey(&e, &new_id)?;
              self.queue.retarget_entity(&e, &new_id)?;
              entity = Some(e.with_id(new_id));
            }
          }
          last_response = Some(response);
        }
        Err(SyncError::RemoteConflict { status }) => {
          warn!(lane = %lane.key, request = %entry.id, status, "Server refused replay");
          if lane.persisted {
            self.queue.remove(&entry.id)?;
          }
          if let Some(e) = &entity {
            self.tracker.mark_conflict(e)?;
          }
          return Ok(LaneOutcome::Conflict);
        }
        Err(e) if e.is_transient() => {
          info!(lane = %lane.key, error = %e, "Replay deferred");
          return Ok(LaneOutcome::Deferred);
        }
        Err(e) => return Err(e),
      }
    }

    let Some(response) = last_response else {
      return Ok(LaneOutcome::Skipped);
    };

    if let (Some(e), false) = (&entity, deleted) {
      let canonical = response.json_body().filter(Value::is_object);
      if !self.tracker.apply_remote(e, canonical, expected_last_modified)? {
        debug!(entity = %e, "Record changed during replay; left pending");
      }
    }
    Ok(LaneOutcome::Synced)
  }

  /// Send one queued write and classify the answer.
  ///
  /// 2xx (and 404 for a DELETE) is success; 408, 429 and 5xx are transient;
  /// any other 4xx means the server will never accept this write.
  pub async fn replay(&self, entry: &QueuedWriteRequest) -> Result<Response> {
    let request = entry.to_request()?;
    let response = self.transport.send(&request).await?;

    match response.status {
      200..=299 => Ok(response),
      404 if entry.method == Method::Delete => Ok(response),
      408 | 429 | 500..=599 => Err(SyncError::RemoteTransientFailure(format!(
        "{} {} returned {}",
        entry.method, entry.target, response.status
      ))),
      400..=499 => Err(SyncError::RemoteConflict {
        status: response.status,
      }),
      status => Err(SyncError::RemoteTransientFailure(format!(
        "{} {} returned unexpected status {}",
        entry.method, entry.target, status
      ))),
    }
  }

  /// Resolve a conflict in favour of the local copy (optionally edited).
  /// Writes still queued for the entity were made against the refused state,
  /// so they are dropped; the record goes back to `pending` and the next pass
  /// pushes it whole.
  pub fn keep_local(&self, entity: &EntityRef, payload: Option<Value>) -> Result<Option<DurableRecord>> {
    let dropped = self.drop_queued(entity)?;
    info!(entity = %entity, dropped, "Keeping local copy");

    match payload {
      Some(payload) => Ok(Some(self.tracker.save_local(entity, payload)?)),
      None => {
        self.tracker.touch_pending(entity)?;
        self.tracker.get(entity)
      }
    }
  }

  /// Resolve a conflict by dropping the local copy and its queued writes.
  pub fn discard_local(&self, entity: &EntityRef) -> Result<usize> {
    let dropped = self.drop_queued(entity)?;
    self.tracker.remove(entity)?;

    info!(entity = %entity, dropped, "Local changes discarded");
    Ok(dropped)
  }

  fn drop_queued(&self, entity: &EntityRef) -> Result<usize> {
    let entries = self.queue.for_entity(entity)?;
    for entry in &entries {
      self.queue.remove(&entry.id)?;
    }
    Ok(entries.len())
  }
}
