use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The kind of event source a trigger represents.
///
/// `Manual` never appears on a stored trigger. It marks runs started by an
/// operator (CLI or API) rather than by a trigger handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TriggerKind {
  Cron,
  Http,
  Pubsub,
  Email,
  Manual,
}

impl TriggerKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      TriggerKind::Cron => "CRON",
      TriggerKind::Http => "HTTP",
      TriggerKind::Pubsub => "PUBSUB",
      TriggerKind::Email => "EMAIL",
      TriggerKind::Manual => "MANUAL",
    }
  }
}

impl fmt::Display for TriggerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Returned when a trigger kind string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown trigger kind: {0}")]
pub struct UnknownTriggerKind(pub String);

impl FromStr for TriggerKind {
  type Err = UnknownTriggerKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "CRON" => Ok(TriggerKind::Cron),
      "HTTP" => Ok(TriggerKind::Http),
      "PUBSUB" => Ok(TriggerKind::Pubsub),
      "EMAIL" => Ok(TriggerKind::Email),
      "MANUAL" => Ok(TriggerKind::Manual),
      other => Err(UnknownTriggerKind(other.to_string())),
    }
  }
}

/// A declared event source attached to a runnable.
///
/// The meaning of `val1`..`val3` depends on `kind`:
/// - CRON: `val1` is the cron expression
/// - HTTP: `val1` is the path regex
/// - PUBSUB: `val1` is the topic, `val2` the credentials file path
/// - EMAIL: `val1` is the recipient local part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Trigger {
  pub uid: i64,
  pub parent_uid: i64,
  pub owner_uid: i64,
  pub name: String,
  pub kind: TriggerKind,
  pub val1: String,
  #[serde(default)]
  pub val2: String,
  #[serde(default)]
  pub val3: String,
}

/// A user-owned script together with its triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runnable {
  pub uid: i64,
  pub owner_uid: i64,
  pub name: String,
  pub content: String,
  #[serde(default)]
  pub triggers: Vec<Trigger>,
}

/// Account record used to describe the owner of a runnable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
  pub uid: i64,
  pub username: String,
  pub display_name: String,
  pub admin: bool,
  pub created_at: DateTime<Utc>,
}

/// A login session, identified by the `sid` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Session {
  pub sid: String,
  pub uid: i64,
  pub created_at: DateTime<Utc>,
  pub revoked: bool,
  pub can_access_web: bool,
  pub can_access_sys_api: bool,
  /// How the session was authenticated, e.g. `PASS` or `2FASC`.
  pub authed_via: String,
}

/// Category of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LogKind {
  /// Console output written by the script.
  Log,
  /// Lifecycle messages written by the runtime.
  Control,
  /// Structured data such as start/end info and traces.
  Data,
  Json,
}

impl LogKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      LogKind::Log => "log",
      LogKind::Control => "control",
      LogKind::Data => "data",
      LogKind::Json => "json",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum LogLevel {
  Info = 0,
  Warning = 1,
  Error = 2,
}

/// Shape of the value carried by a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Datatype {
  Unstructured = 0,
  String = 1,
  Int = 2,
  StartInfo = 3,
  EndInfo = 4,
  Trace = 5,
}

/// A single entry in a run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LogRecord {
  pub parent_uid: i64,
  pub run_id: String,
  pub created_at: DateTime<Utc>,
  pub kind: LogKind,
  pub level: LogLevel,
  pub datatype: Datatype,
  pub value: String,
}

impl LogRecord {
  pub fn new(
    parent_uid: i64,
    run_id: impl Into<String>,
    kind: LogKind,
    level: LogLevel,
    datatype: Datatype,
    value: impl Into<String>,
  ) -> Self {
    Self {
      parent_uid,
      run_id: run_id.into(),
      created_at: Utc::now(),
      kind,
      level,
      datatype,
      value: value.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_trigger_kind_parse() {
    assert_eq!("CRON".parse::<TriggerKind>(), Ok(TriggerKind::Cron));
    assert_eq!("PUBSUB".parse::<TriggerKind>(), Ok(TriggerKind::Pubsub));
    assert!("cron".parse::<TriggerKind>().is_err());
  }

  #[test]
  fn test_trigger_kind_serde_uses_wire_names() {
    let json = serde_json::to_string(&TriggerKind::Http).unwrap();
    assert_eq!(json, "\"HTTP\"");
  }

  #[test]
  fn test_log_level_ordering() {
    assert!(LogLevel::Error > LogLevel::Warning);
    assert!(LogLevel::Warning > LogLevel::Info);
  }
}
