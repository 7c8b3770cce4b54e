//! Page/worker message protocol.
//!
//! Every message carries the `_libSource` marker so it can share a transport
//! with unrelated traffic. Page messages are commands; worker messages are
//! single replies correlated by `id`.

use base64::Engine as _;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::cache::Tier;

/// Marker identifying this protocol's messages.
pub const LIB_SOURCE: &str = "#libShadowFiles";

/// Which side of the transport a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Page,
  Sw,
}

impl Role {
  pub fn as_str(self) -> &'static str {
    match self {
      Role::Page => "page",
      Role::Sw => "sw",
    }
  }
}

/// Outcome carried by a worker reply.
///
/// For `exists`, `Success` means found and `Fail` means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Success,
  Fail,
}

/// A page-originated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
  /// Remove `path` from `tier`, or from every tier when unset.
  Delete {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tier: Option<Tier>,
  },
  /// Create or replace the shadow file at `path`.
  Update {
    path: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    body: Vec<u8>,
    /// Target tier; the controller's configured tier when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tier: Option<Tier>,
  },
  /// Ask whether `path` is shadowed in any tier.
  Exists { path: String },
}

impl Command {
  pub fn path(&self) -> &str {
    match self {
      Command::Delete { path, .. } | Command::Update { path, .. } | Command::Exists { path } => {
        path
      }
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Command::Delete { .. } => "delete",
      Command::Update { .. } => "update",
      Command::Exists { .. } => "exists",
    }
  }
}

/// Page -> worker message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMessage {
  #[serde(rename = "_libSource")]
  pub lib_source: String,
  pub id: String,
  pub source: Role,
  #[serde(flatten)]
  pub command: Command,
}

impl PageMessage {
  pub fn new(id: impl Into<String>, command: Command) -> Self {
    Self {
      lib_source: LIB_SOURCE.to_string(),
      id: id.into(),
      source: Role::Page,
      command,
    }
  }
}

/// Worker -> page reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMessage {
  #[serde(rename = "_libSource")]
  pub lib_source: String,
  pub id: String,
  pub source: Role,
  pub status: Status,
}

impl WorkerMessage {
  pub fn new(id: impl Into<String>, status: Status) -> Self {
    Self {
      lib_source: LIB_SOURCE.to_string(),
      id: id.into(),
      source: Role::Sw,
      status,
    }
  }
}

/// Why an inbound message was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
  #[error("message is not an object")]
  NotAnObject,
  #[error("message lacks the #libShadowFiles marker")]
  MissingMarker,
  #[error("message does not come from the expected role")]
  WrongRole,
  #[error("malformed message: {0}")]
  Malformed(String),
}

impl Rejection {
  /// Foreign messages belong to someone else on the transport and must keep
  /// propagating. Malformed ones carry our marker and stop here.
  pub fn is_foreign(&self) -> bool {
    !matches!(self, Rejection::Malformed(_))
  }
}

/// Validate and decode a message sent by the page.
pub fn accept_page_message(data: &Value) -> Result<PageMessage, Rejection> {
  check_envelope(data, Role::Page)?;
  serde_json::from_value(data.clone()).map_err(|e| Rejection::Malformed(e.to_string()))
}

/// Validate and decode a reply sent by the worker.
pub fn accept_worker_message(data: &Value) -> Result<WorkerMessage, Rejection> {
  check_envelope(data, Role::Sw)?;
  serde_json::from_value(data.clone()).map_err(|e| Rejection::Malformed(e.to_string()))
}

fn check_envelope(data: &Value, expected: Role) -> Result<(), Rejection> {
  let object = data.as_object().ok_or(Rejection::NotAnObject)?;

  if object.get("_libSource").and_then(Value::as_str) != Some(LIB_SOURCE) {
    return Err(Rejection::MissingMarker);
  }
  if object.get("source").and_then(Value::as_str) != Some(expected.as_str()) {
    return Err(Rejection::WrongRole);
  }
  Ok(())
}

/// Receiving end of a targeted message, e.g. the page that sent a command.
pub trait ReplyTarget: Send + Sync {
  fn post_message(&self, message: Value) -> Result<()>;
}

/// Send a correctly shaped worker reply to `origin`.
pub fn reply(origin: &dyn ReplyTarget, id: &str, status: Status) -> Result<()> {
  let message = serde_json::to_value(WorkerMessage::new(id, status))
    .map_err(|e| eyre!("Failed to encode reply {}: {}", id, e))?;
  origin.post_message(message)
}

/// Whether other listeners on the transport still get to see a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
  Continue,
  Stop,
}

mod base64_body {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine as _;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}

/// Encode raw bytes the way `update` bodies travel on the wire.
pub fn encode_body(body: &[u8]) -> String {
  base64::engine::general_purpose::STANDARD.encode(body)
}
