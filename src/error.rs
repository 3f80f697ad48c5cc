//! Error taxonomy for the sync core.
//!
//! The binary layer (config, CLI) reports through `color_eyre`; everything
//! below it returns [`SyncError`] so callers can tell a recoverable network
//! failure from a storage failure that has to reach the user.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Transport-level failure (connection refused, DNS, timeout).
  #[error("network unreachable: {0}")]
  NetworkUnreachable(String),

  /// The local durable store cannot be read or written.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The server refused to apply a replayed write.
  #[error("remote rejected write with status {status}")]
  RemoteConflict { status: u16 },

  /// 5xx, 408 or 429 from the server.
  #[error("remote transient failure: {0}")]
  RemoteTransientFailure(String),

  #[error("invalid lifecycle transition from {from} to {to}")]
  InvalidTransition { from: String, to: String },
}

impl SyncError {
  /// Whether the failure should leave work pending for a later attempt.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::NetworkUnreachable(_) | Self::RemoteTransientFailure(_)
    )
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::StorageUnavailable(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;
