use std::sync::Arc;

use nexus_log::LogBroker;
use nexus_store::{Datatype, LogKind, LogLevel, LogRecord, LogStore};
use tracing::warn;

/// Writes a run's log records to the live broker and to durable storage.
#[derive(Clone)]
pub struct RunLogger {
  broker: Arc<LogBroker>,
  store: Arc<dyn LogStore>,
  parent_uid: i64,
  run_id: String,
}

impl RunLogger {
  pub fn new(broker: Arc<LogBroker>, store: Arc<dyn LogStore>, parent_uid: i64, run_id: impl Into<String>) -> Self {
    Self {
      broker,
      store,
      parent_uid,
      run_id: run_id.into(),
    }
  }

  /// Publish and persist one record. Persistence failures are traced only.
  pub async fn write(&self, kind: LogKind, level: LogLevel, datatype: Datatype, value: impl Into<String>) {
    let record = LogRecord::new(self.parent_uid, self.run_id.as_str(), kind, level, datatype, value);
    self.broker.log(&record);
    if let Err(e) = self.store.write_log(&record).await {
      warn!(run_id = %self.run_id, runnable_uid = self.parent_uid, error = %e, "log_persist_failed");
    }
  }

  pub async fn control(&self, message: impl Into<String>) {
    self
      .write(LogKind::Control, LogLevel::Info, Datatype::String, message)
      .await;
  }

  pub async fn data(&self, level: LogLevel, datatype: Datatype, value: impl Into<String>) {
    self.write(LogKind::Data, level, datatype, value).await;
  }
}
