use nexus_store::TriggerKind;
use thiserror::Error;

use crate::pubsub::PubsubError;

/// Errors raised while registering triggers or dispatching trigger events.
#[derive(Debug, Error)]
pub enum TriggerError {
  /// A handler already holds a trigger with this uid.
  #[error("trigger {trigger_uid} already registered")]
  AlreadyRegistered { trigger_uid: i64 },

  /// The trigger's values cannot be used by its handler.
  #[error("invalid configuration for trigger {trigger_uid}: {message}")]
  InvalidConfig { trigger_uid: i64, message: String },

  /// Credentials for an external service could not be loaded.
  #[error("failed to load credentials for trigger {trigger_uid}: {source}")]
  Credentials {
    trigger_uid: i64,
    #[source]
    source: PubsubError,
  },

  /// No handler is registered for the trigger's kind.
  #[error("no handler for trigger kind {kind}")]
  NoHandler { kind: TriggerKind },

  /// The trigger belongs to a different runnable than the one being updated.
  #[error("trigger {trigger_uid} belongs to runnable {parent_uid}, not {runnable_uid}")]
  ForeignTrigger {
    trigger_uid: i64,
    parent_uid: i64,
    runnable_uid: i64,
  },

  /// No email trigger claims the recipient's local part.
  #[error("unknown recipient {address}")]
  UnknownRecipient { address: String },

  /// An inbound message could not be parsed.
  #[error("malformed message: {message}")]
  MalformedMessage { message: String },

  #[error("store error: {0}")]
  Store(#[from] nexus_store::Error),
}
