use nexus_host::CapabilityError;

/// Errors returned when a run cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
  #[error("runnable {uid} not found")]
  RunnableNotFound { uid: i64 },

  #[error("failed to load runnable {uid}")]
  Store {
    uid: i64,
    #[source]
    source: nexus_store::Error,
  },

  /// The sandbox could not be created or a capability failed to bind.
  #[error("failed to prepare sandbox for runnable {uid}")]
  Sandbox {
    uid: i64,
    #[source]
    source: CapabilityError,
  },

  #[error("failed to allocate run id: {message}")]
  RunId { message: String },
}
