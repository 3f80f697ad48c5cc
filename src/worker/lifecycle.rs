use std::fmt;
use tracing::debug;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Created,
  Installing,
  /// Installed, but an older generation still serves attached clients
  Waiting,
  Active,
  /// Failed install or replaced; never intercepts again
  Redundant,
}

impl LifecycleState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Created => "created",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }

  fn can_become(self, next: Self) -> bool {
    use LifecycleState::*;
    match (self, next) {
      (Redundant, _) => false,
      (_, Redundant) => true,
      // Resuming a generation that was already activated
      (Created, Active) => true,
      (Created, Installing) | (Installing, Waiting) | (Waiting, Active) => true,
      _ => false,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug)]
pub struct Lifecycle {
  state: LifecycleState,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self {
      state: LifecycleState::Created,
    }
  }
}

impl Lifecycle {
  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn advance(&mut self, next: LifecycleState) -> Result<()> {
    if !self.state.can_become(next) {
      return Err(SyncError::InvalidTransition {
        from: self.state.to_string(),
        to: next.to_string(),
      });
    }
    debug!(from = %self.state, to = %next, "Worker lifecycle");
    self.state = next;
    Ok(())
  }
}
