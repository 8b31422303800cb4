//! Helpers for exercising capabilities outside the scheduler.

use std::sync::Arc;

use nexus_log::LogBroker;
use nexus_store::{MemoryStore, Runnable};
use tokio::runtime::Handle;

use crate::logger::RunLogger;
use crate::run::{RunInfo, StartContext};

pub const TEST_RUN_ID: &str = "test-run-01";

/// A manual run backed by an in-memory store and a fresh broker.
pub struct TestRun {
  pub store: MemoryStore,
  pub broker: Arc<LogBroker>,
  pub info: RunInfo,
}

impl TestRun {
  /// Must be called from within a tokio runtime.
  pub fn new(runnable: Runnable) -> Self {
    let store = MemoryStore::new();
    let broker = Arc::new(LogBroker::new());
    broker.started(TEST_RUN_ID);
    let logger = RunLogger::new(broker.clone(), Arc::new(store.clone()), runnable.uid, TEST_RUN_ID);
    let info = RunInfo::new(
      TEST_RUN_ID,
      Arc::new(runnable),
      StartContext::manual(),
      logger,
      Handle::current(),
    );
    Self { store, broker, info }
  }
}

pub fn runnable(uid: i64, content: &str) -> Runnable {
  Runnable {
    uid,
    owner_uid: 1,
    name: format!("runnable-{uid}"),
    content: content.to_string(),
    triggers: Vec::new(),
  }
}
