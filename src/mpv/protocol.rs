//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-supervisor request id sequence. Starts at 0 and never resets.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
  pub fn new() -> Self {
    Self(AtomicU64::new(0))
  }

  /// Take the current value and advance the counter.
  pub fn next(&self) -> u64 {
    self.0.fetch_add(1, Ordering::SeqCst)
  }

  /// Value the next request will be stamped with.
  pub fn peek(&self) -> u64 {
    self.0.load(Ordering::SeqCst)
  }
}

/// Argument list of an mpv command, e.g. `["loadfile", url]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PlayerCommand(pub Vec<Value>);

impl PlayerCommand {
  /// Load a file or URL for playback.
  pub fn loadfile(url: &str) -> Self {
    Self(vec!["loadfile".into(), url.into()])
  }

  /// Set a property to an arbitrary JSON value.
  pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
    Self(vec!["set_property".into(), name.into(), value.into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self(vec!["get_property".into(), name.into()])
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self(vec!["cycle".into(), property.into()])
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self(vec!["quit".into()])
  }
}

impl From<Vec<Value>> for PlayerCommand {
  fn from(args: Vec<Value>) -> Self {
    Self(args)
  }
}

/// Command stamped with its request id, as written to the socket.
#[derive(Debug, Clone, Serialize)]
pub struct MpvRequest {
  pub command: PlayerCommand,
  pub request_id: u64,
}

impl MpvRequest {
  pub fn new(command: PlayerCommand, request_id: u64) -> Self {
    Self {
      command,
      request_id,
    }
  }

  /// Serialize as a single newline-terminated line.
  pub fn to_line(&self) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(self)?;
    line.push('\n');
    Ok(line)
  }
}

/// Reply from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<Value>,
  /// Matching request ID.
  #[serde(default)]
  pub request_id: u64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file", "file-loaded").
  pub event: String,
  /// Observer ID for property-change events.
  pub id: Option<i64>,
  /// Property name for property-change events.
  pub name: Option<String>,
  /// Event data.
  pub data: Option<Value>,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub reason: Option<String>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
  /// Valid JSON of a shape we don't model.
  Other(Value),
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    Self::from_value(value)
  }

  fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    let Some(obj) = value.as_object() else {
      return Ok(MpvMessage::Other(value));
    };
    if obj.contains_key("event") {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    } else if obj.get("error").is_some_and(Value::is_string) {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Other(value))
    }
  }
}

/// Pull a failure out of an inbound line, if it carries one.
///
/// Anything that isn't a JSON object with a non-"success" `error` field yields
/// `None`, malformed JSON included.
pub fn inspect_error(line: &str) -> Option<String> {
  let value: Value = serde_json::from_str(line).ok()?;
  match value.get("error")? {
    Value::String(s) if s == "success" => None,
    Value::String(s) => Some(s.clone()),
    other => Some(other.to_string()),
  }
}
