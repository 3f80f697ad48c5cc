use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ids currently being replayed by a coordinator in this process.
///
/// Claims are released when the returned [`Claim`] is dropped. This only
/// covers one process; replays racing from another process are made safe by
/// idempotency keys instead.
#[derive(Debug, Default)]
pub struct InFlight {
  ids: Mutex<HashSet<String>>,
}

impl InFlight {
  /// Claim `id`, or `None` if someone else holds it.
  pub fn try_claim(self: &Arc<Self>, id: &str) -> Option<Claim> {
    if !self.ids().insert(id.to_string()) {
      return None;
    }
    Some(Claim {
      owner: Arc::clone(self),
      id: id.to_string(),
    })
  }

  pub fn contains(&self, id: &str) -> bool {
    self.ids().contains(id)
  }

  fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
    // A panic while holding the lock cannot leave the set half-updated.
    self.ids.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[derive(Debug)]
pub struct Claim {
  owner: Arc<InFlight>,
  id: String,
}

impl Drop for Claim {
  fn drop(&mut self) {
    self.owner.ids().remove(&self.id);
  }
}
