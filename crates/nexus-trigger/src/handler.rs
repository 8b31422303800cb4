use async_trait::async_trait;
use nexus_store::{Trigger, TriggerKind};

use crate::error::TriggerError;

/// A handler turning external events of one trigger kind into runs.
///
/// Registration calls for one handler are serialized by the handler itself.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
  fn kind(&self) -> TriggerKind;

  /// Register a single trigger. Fails if its uid is already registered.
  async fn register(&self, trigger: &Trigger) -> Result<(), TriggerError>;

  /// Remove every trigger of `parent_uid`. Removing nothing is not an error.
  async fn delete(&self, parent_uid: i64) -> Result<(), TriggerError>;

  /// One-time initialization, e.g. starting a polling loop.
  fn setup(&self) {}

  /// Stop background work started by [`TriggerHandler::setup`] or `register`.
  fn shutdown(&self) {}
}
