//! Sync lifecycle broadcasts to every attached client.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Events sent to clients, serialized as `{"type": "SYNC_START"}` and
/// `{"type": "SYNC_COMPLETE", "synced": n, "conflicts": m}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEvent {
  SyncStart,
  SyncComplete { synced: usize, conflicts: usize },
}

/// Fire-and-forget fan-out. A client that is gone or lagging simply misses
/// events; it can read current sync status from the store instead.
#[derive(Debug, Clone)]
pub struct Broadcaster {
  tx: broadcast::Sender<SyncEvent>,
}

impl Default for Broadcaster {
  fn default() -> Self {
    Self::new(64)
  }
}

impl Broadcaster {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Attach a client.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }

  pub fn publish(&self, event: SyncEvent) {
    let delivered = self.tx.send(event.clone()).unwrap_or(0);
    trace!(?event, delivered, "Sync event published");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    assert_eq!(
      serde_json::to_value(SyncEvent::SyncStart).unwrap(),
      json!({"type": "SYNC_START"})
    );
    assert_eq!(
      serde_json::to_value(SyncEvent::SyncComplete {
        synced: 3,
        conflicts: 1
      })
      .unwrap(),
      json!({"type": "SYNC_COMPLETE", "synced": 3, "conflicts": 1})
    );
  }

  #[tokio::test]
  async fn test_every_client_receives_events() {
    let broadcaster = Broadcaster::default();
    let mut tab_a = broadcaster.subscribe();
    let mut tab_b = broadcaster.subscribe();
    assert_eq!(broadcaster.client_count(), 2);

    broadcaster.publish(SyncEvent::SyncStart);

    assert_eq!(tab_a.recv().await.unwrap(), SyncEvent::SyncStart);
    assert_eq!(tab_b.recv().await.unwrap(), SyncEvent::SyncStart);
  }

  #[test]
  fn test_publish_without_clients_is_fine() {
    let broadcaster = Broadcaster::default();
    broadcaster.publish(SyncEvent::SyncComplete {
      synced: 0,
      conflicts: 0,
    });
    assert_eq!(broadcaster.client_count(), 0);
  }
}
