use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nexus_store::{Runnable, Trigger, TriggerKind};
use tokio::runtime::Handle;

use crate::logger::RunLogger;

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartContext {
  /// The trigger that caused the run, `None` for manual runs.
  pub trigger_uid: Option<i64>,
  pub kind: TriggerKind,
}

impl StartContext {
  pub fn manual() -> Self {
    Self {
      trigger_uid: None,
      kind: TriggerKind::Manual,
    }
  }

  pub fn from_trigger(trigger: &Trigger) -> Self {
    Self {
      trigger_uid: Some(trigger.uid),
      kind: trigger.kind,
    }
  }
}

/// Everything a capability may need to know about the run it is bound into.
#[derive(Clone)]
pub struct RunInfo {
  pub run_id: String,
  pub runnable: Arc<Runnable>,
  pub context: StartContext,
  pub started_at: DateTime<Utc>,
  pub logger: RunLogger,
  runtime: Handle,
}

impl RunInfo {
  pub fn new(
    run_id: impl Into<String>,
    runnable: Arc<Runnable>,
    context: StartContext,
    logger: RunLogger,
    runtime: Handle,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      runnable,
      context,
      started_at: Utc::now(),
      logger,
      runtime,
    }
  }

  pub fn runnable_uid(&self) -> i64 {
    self.runnable.uid
  }

  pub fn owner_uid(&self) -> i64 {
    self.runnable.owner_uid
  }

  /// Drive an async operation to completion from inside a host closure.
  ///
  /// Host closures run on the blocking pool thread executing the script.
  pub fn block_on<F: Future>(&self, future: F) -> F::Output {
    self.runtime.block_on(future)
  }
}
