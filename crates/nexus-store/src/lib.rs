//! Nexus Store
//!
//! Persistence interfaces for the integration runtime. The runtime itself never
//! talks to a database directly; it reads runnables and triggers, writes run
//! logs and keeps script key/value data through the traits defined here.
//!
//! Two implementations are provided:
//! - [`SqliteStore`] backed by `sqlx` for the server binary
//! - [`MemoryStore`] for tests and embedding

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  Datatype, LogKind, LogLevel, LogRecord, Runnable, Session, Trigger, TriggerKind, UnknownTriggerKind,
  User,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A migration failed while preparing the schema.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Read and write access to runnables and their triggers.
#[async_trait]
pub trait RunnableStore: Send + Sync {
  /// Get a runnable, including its triggers, by uid.
  async fn get_runnable(&self, uid: i64) -> Result<Runnable, Error>;

  /// List every trigger of every runnable.
  async fn list_triggers(&self) -> Result<Vec<Trigger>, Error>;

  /// Insert or replace a runnable and its trigger list.
  async fn save_runnable(&self, runnable: &Runnable) -> Result<(), Error>;
}

/// Lookup of account records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
  /// Get a user by uid.
  async fn get_user(&self, uid: i64) -> Result<User, Error>;

  /// Insert or replace a user.
  async fn save_user(&self, user: &User) -> Result<(), Error>;
}

/// Lookup of login sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
  /// Get a live session by sid. Revoked and unknown sessions are not found.
  async fn get_session(&self, sid: &str) -> Result<Session, Error>;

  /// Insert or replace a session.
  async fn save_session(&self, session: &Session) -> Result<(), Error>;
}

/// Durable run log storage.
#[async_trait]
pub trait LogStore: Send + Sync {
  /// Append a record to the log of its runnable.
  async fn write_log(&self, record: &LogRecord) -> Result<(), Error>;

  /// List records of a single run, oldest first.
  async fn list_logs(&self, parent_uid: i64, run_id: &str) -> Result<Vec<LogRecord>, Error>;
}

/// Simple per-runnable key/value storage backing the `kv` capability.
///
/// Values are opaque strings; the capability stores JSON.
#[async_trait]
pub trait KvStore: Send + Sync {
  async fn get_data(&self, runnable_uid: i64, key: &str) -> Result<Option<String>, Error>;

  async fn set_data(&self, runnable_uid: i64, key: &str, value: &str) -> Result<(), Error>;
}
