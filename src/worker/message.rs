//! Messages clients post to the worker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate a waiting worker without waiting for clients to detach
  SkipWaiting,
  GetVersion,
}

/// Reply to `GET_VERSION`: `{"version": "<cache version>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
  pub version: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    let msg: ClientMessage = serde_json::from_value(json!({"type": "SKIP_WAITING"})).unwrap();
    assert_eq!(msg, ClientMessage::SkipWaiting);
    assert_eq!(
      serde_json::to_value(ClientMessage::GetVersion).unwrap(),
      json!({"type": "GET_VERSION"})
    );
    assert_eq!(
      serde_json::to_value(VersionReply {
        version: "v3".into()
      })
      .unwrap(),
      json!({"version": "v3"})
    );
  }

  #[test]
  fn test_unknown_message_rejected() {
    assert!(serde_json::from_value::<ClientMessage>(json!({"type": "CLAIM"})).is_err());
  }
}
