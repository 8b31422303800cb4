#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nexus_host::{Capability, CapabilityRegistry, StartContext};
use nexus_host_log::ConsoleCapability;
use nexus_log::LogBroker;
use nexus_runtime::{RunHandle, RunOutcome, RunScheduler, RunStarter, SchedulerError};
use nexus_store::{MemoryStore, Runnable, RunnableStore, Trigger, TriggerKind};

#[derive(Debug, Clone)]
pub struct StartRecord {
  pub runnable_uid: i64,
  pub context: StartContext,
  pub seeds: Vec<String>,
}

/// Records every start request and, when backed by a scheduler, every outcome.
pub struct Recorder {
  pub store: MemoryStore,
  scheduler: Option<RunScheduler>,
  fail: bool,
  starts: Arc<Mutex<Vec<StartRecord>>>,
  outcomes: Arc<Mutex<Vec<RunOutcome>>>,
}

impl Recorder {
  fn build(scheduler: Option<RunScheduler>, store: MemoryStore, fail: bool) -> Arc<Self> {
    Arc::new(Self {
      store,
      scheduler,
      fail,
      starts: Arc::default(),
      outcomes: Arc::default(),
    })
  }

  /// Accepts every start without running anything.
  pub fn accepting() -> Arc<Self> {
    Self::build(None, MemoryStore::new(), false)
  }

  /// Rejects every start as an unknown runnable.
  pub fn failing() -> Arc<Self> {
    Self::build(None, MemoryStore::new(), true)
  }

  /// Runs scripts for real with the console capability bound.
  pub async fn running(scripts: &[(i64, &str)]) -> Arc<Self> {
    let store = MemoryStore::new();
    for (uid, content) in scripts {
      store
        .save_runnable(&Runnable {
          uid: *uid,
          owner_uid: 1,
          name: format!("script-{uid}"),
          content: content.to_string(),
          triggers: Vec::new(),
        })
        .await
        .unwrap();
    }
    let shared = Arc::new(store.clone());
    let scheduler = RunScheduler::new(
      shared.clone(),
      shared.clone(),
      shared,
      Arc::new(LogBroker::new()),
      CapabilityRegistry::new().with(Arc::new(ConsoleCapability)),
    );
    Self::build(Some(scheduler), store, false)
  }

  pub fn starts(&self) -> Vec<StartRecord> {
    self.starts.lock().unwrap().clone()
  }

  pub fn outcomes(&self) -> Vec<RunOutcome> {
    self.outcomes.lock().unwrap().clone()
  }

  pub async fn wait_for_starts(&self, count: usize, timeout: Duration) -> Vec<StartRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let starts = self.starts();
      if starts.len() >= count || tokio::time::Instant::now() >= deadline {
        return starts;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  }

  pub async fn wait_for_outcomes(&self, count: usize, timeout: Duration) -> Vec<RunOutcome> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let outcomes = self.outcomes();
      if outcomes.len() >= count || tokio::time::Instant::now() >= deadline {
        return outcomes;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  }
}

#[async_trait]
impl RunStarter for Recorder {
  async fn start_run(
    &self,
    runnable_uid: i64,
    context: StartContext,
    seeds: Vec<Arc<dyn Capability>>,
  ) -> Result<RunHandle, SchedulerError> {
    self.starts.lock().unwrap().push(StartRecord {
      runnable_uid,
      context,
      seeds: seeds.iter().map(|s| s.name().to_string()).collect(),
    });
    if self.fail {
      return Err(SchedulerError::RunnableNotFound { uid: runnable_uid });
    }

    let Some(scheduler) = &self.scheduler else {
      let count = self.starts.lock().unwrap().len();
      return Ok(RunHandle::finished(RunOutcome {
        run_id: format!("run-{count}"),
        value: String::new(),
        error: None,
      }));
    };

    let handle = scheduler.start(runnable_uid, context, seeds).await?;
    let run_id = handle.run_id.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let outcomes = self.outcomes.clone();
    tokio::spawn(async move {
      let outcome = handle.wait().await;
      outcomes.lock().unwrap().push(outcome.clone());
      let _ = tx.send(outcome);
    });
    Ok(RunHandle::new(run_id, rx))
  }
}

pub fn trigger(uid: i64, parent_uid: i64, kind: TriggerKind, val1: &str) -> Trigger {
  Trigger {
    uid,
    parent_uid,
    owner_uid: 1,
    name: format!("trigger-{uid}"),
    kind,
    val1: val1.to_string(),
    val2: String::new(),
    val3: String::new(),
  }
}
