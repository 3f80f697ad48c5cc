use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::net::{Method, Request, Transport};

/// Reasons to run a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// The remote answered again after being unreachable
  ConnectivityRestored,
  /// Periodic timer
  Periodic,
  /// The worker queued a write while offline
  BackgroundSync,
  /// Explicit retry from the user
  Manual,
}

/// Reachability as last observed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
  Online,
  Offline,
}

/// Remembers the last probe result so only an offline→online edge fires.
#[derive(Debug)]
pub struct ConnectivityProbe {
  state: NetworkState,
}

impl Default for ConnectivityProbe {
  fn default() -> Self {
    Self {
      state: NetworkState::Online,
    }
  }
}

impl ConnectivityProbe {
  pub fn state(&self) -> NetworkState {
    self.state
  }

  /// Record a probe result. Returns true when connectivity just came back.
  pub fn observe(&mut self, reachable: bool) -> bool {
    let next = if reachable {
      NetworkState::Online
    } else {
      NetworkState::Offline
    };
    let restored = self.state == NetworkState::Offline && next == NetworkState::Online;
    if self.state != next {
      info!(state = ?next, "Connectivity changed");
    }
    self.state = next;
    restored
  }
}

/// Collects sync triggers from the timer, the probe and the worker
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Trigger>,
  rx: mpsc::UnboundedReceiver<Trigger>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender for anything that wants to request a sync pass
  pub fn sender(&self) -> mpsc::UnboundedSender<Trigger> {
    self.tx.clone()
  }

  /// Emit `Periodic` every `period`, first one after a full period.
  pub fn spawn_periodic(&self, period: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        ticker.tick().await;
        if tx.send(Trigger::Periodic).is_err() {
          break;
        }
      }
    });
  }

  /// HEAD `target` every `period`; any HTTP answer counts as reachable.
  pub fn spawn_probe(&self, transport: Arc<dyn Transport>, target: Url, period: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut probe = ConnectivityProbe::default();
      let request = Request::new(Method::Head, target);
      loop {
        let reachable = match tokio::time::timeout(period, transport.send(&request)).await {
          Ok(Ok(_)) => true,
          Ok(Err(e)) => {
            debug!(error = %e, "Probe failed");
            false
          }
          Err(_) => false,
        };
        if probe.observe(reachable) && tx.send(Trigger::ConnectivityRestored).is_err() {
          break;
        }
        if tx.is_closed() {
          break;
        }
        tokio::time::sleep(period).await;
      }
    });
  }

  /// Receive the next trigger
  pub async fn next(&mut self) -> Option<Trigger> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::fake::FakeRemote;

  #[test]
  fn test_only_offline_to_online_fires() {
    let mut probe = ConnectivityProbe::default();
    assert!(!probe.observe(true));
    assert!(!probe.observe(false));
    assert_eq!(probe.state(), NetworkState::Offline);
    assert!(!probe.observe(false));
    assert!(probe.observe(true));
    assert!(!probe.observe(true));
  }

  #[tokio::test]
  async fn test_worker_sender_reaches_handler() {
    let mut events = EventHandler::new();
    events.sender().send(Trigger::BackgroundSync).unwrap();
    assert_eq!(events.next().await, Some(Trigger::BackgroundSync));
  }

  #[tokio::test]
  async fn test_periodic_ticks() {
    let mut events = EventHandler::new();
    events.spawn_periodic(Duration::from_millis(10));

    let next = tokio::time::timeout(Duration::from_secs(2), events.next()).await;
    assert_eq!(next.unwrap(), Some(Trigger::Periodic));
  }

  #[tokio::test]
  async fn test_probe_reports_reconnect() {
    let remote = Arc::new(FakeRemote::new());
    remote.set_online(false);

    let mut events = EventHandler::new();
    events.spawn_probe(
      remote.clone(),
      Url::parse("https://ops.example.org/api/").unwrap(),
      Duration::from_millis(10),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.set_online(true);

    let next = tokio::time::timeout(Duration::from_secs(2), events.next()).await;
    assert_eq!(next.unwrap(), Some(Trigger::ConnectivityRestored));
  }
}
