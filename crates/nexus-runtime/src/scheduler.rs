use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nexus_host::{Capability, CapabilityRegistry, RunInfo, RunLogger, Sandbox, ScriptError, StartContext};
use nexus_log::LogBroker;
use nexus_store::{Datatype, Error as StoreError, LogLevel, LogStore, Runnable, RunnableStore, UserDirectory};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use crate::builtins::{ContextCapability, OwnerCapability};
use crate::error::SchedulerError;
use crate::run_id::generate_run_id;
use crate::runs::{ActiveRuns, RunState, RunSummary};

const MAX_RUN_ID_ATTEMPTS: usize = 8;

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
  pub run_id: String,
  /// String form of the script's result.
  pub value: String,
  pub error: Option<String>,
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
  pub run_id: String,
  completion: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
  pub fn new(run_id: impl Into<String>, completion: oneshot::Receiver<RunOutcome>) -> Self {
    Self {
      run_id: run_id.into(),
      completion,
    }
  }

  /// A handle whose run has already finished with `outcome`.
  pub fn finished(outcome: RunOutcome) -> Self {
    let (tx, rx) = oneshot::channel();
    let run_id = outcome.run_id.clone();
    let _ = tx.send(outcome);
    Self::new(run_id, rx)
  }

  /// Wait for the run to finish.
  pub async fn wait(self) -> RunOutcome {
    match self.completion.await {
      Ok(outcome) => outcome,
      Err(_) => RunOutcome {
        run_id: self.run_id,
        value: String::new(),
        error: Some("run aborted before completion".to_string()),
      },
    }
  }
}

/// Starts runs on behalf of trigger handlers.
#[async_trait]
pub trait RunStarter: Send + Sync {
  /// Start `runnable_uid`, binding `seeds` before the standard capabilities.
  async fn start_run(
    &self,
    runnable_uid: i64,
    context: StartContext,
    seeds: Vec<Arc<dyn Capability>>,
  ) -> Result<RunHandle, SchedulerError>;
}

/// Prepares and launches script runs.
pub struct RunScheduler {
  store: Arc<dyn RunnableStore>,
  logs: Arc<dyn LogStore>,
  broker: Arc<LogBroker>,
  capabilities: CapabilityRegistry,
  runs: ActiveRuns,
}

impl RunScheduler {
  /// `capabilities` are bound after the built-in `context` and `owner`.
  pub fn new(
    store: Arc<dyn RunnableStore>,
    users: Arc<dyn UserDirectory>,
    logs: Arc<dyn LogStore>,
    broker: Arc<LogBroker>,
    capabilities: CapabilityRegistry,
  ) -> Self {
    let mut registry = CapabilityRegistry::new()
      .with(Arc::new(ContextCapability))
      .with(Arc::new(OwnerCapability::new(users)));
    for capability in capabilities.iter() {
      registry.register(capability.clone());
    }
    Self {
      store,
      logs,
      broker,
      capabilities: registry,
      runs: ActiveRuns::new(),
    }
  }

  pub fn runs(&self) -> &ActiveRuns {
    &self.runs
  }

  pub fn broker(&self) -> &Arc<LogBroker> {
    &self.broker
  }

  pub fn capabilities(&self) -> &CapabilityRegistry {
    &self.capabilities
  }

  /// Start a run of `runnable_uid`.
  ///
  /// On success the run is announced to the broker before this returns, so
  /// callers can subscribe to its log immediately. On failure nothing has been
  /// recorded and no script code ran.
  #[instrument(name = "run_start", skip(self, seeds), fields(kind = %context.kind, run_id = tracing::field::Empty))]
  pub async fn start(
    &self,
    runnable_uid: i64,
    context: StartContext,
    seeds: Vec<Arc<dyn Capability>>,
  ) -> Result<RunHandle, SchedulerError> {
    let runnable = match self.store.get_runnable(runnable_uid).await {
      Ok(runnable) => Arc::new(runnable),
      Err(StoreError::NotFound(_)) => {
        return Err(SchedulerError::RunnableNotFound { uid: runnable_uid });
      }
      Err(source) => {
        return Err(SchedulerError::Store {
          uid: runnable_uid,
          source,
        });
      }
    };

    let run_id = self.reserve_run_id(&runnable, context)?;
    tracing::Span::current().record("run_id", run_id.as_str());

    let logger = RunLogger::new(self.broker.clone(), self.logs.clone(), runnable.uid, run_id.as_str());
    let info = RunInfo::new(run_id.as_str(), runnable.clone(), context, logger, Handle::current());

    let sandbox = match self.prepare(&info, &seeds) {
      Ok(sandbox) => sandbox,
      Err(source) => {
        self.runs.remove(&run_id);
        warn!(error = %source, "run_prepare_failed");
        return Err(SchedulerError::Sandbox {
          uid: runnable_uid,
          source,
        });
      }
    };

    self.broker.started(&run_id);
    let (tx, rx) = oneshot::channel();
    tokio::spawn(execute(info, sandbox, self.broker.clone(), self.runs.clone(), tx));

    info!(runnable_uid, "run_started");
    Ok(RunHandle::new(run_id, rx))
  }

  /// Allocate a fresh run id and claim it in the run table.
  fn reserve_run_id(&self, runnable: &Runnable, context: StartContext) -> Result<String, SchedulerError> {
    for _ in 0..MAX_RUN_ID_ATTEMPTS {
      let run_id = generate_run_id()?;
      let summary = RunSummary {
        run_id: run_id.clone(),
        runnable_uid: runnable.uid,
        runnable_name: runnable.name.clone(),
        context,
        started_at: Utc::now(),
        state: RunState::Running,
      };
      if self.runs.try_insert(summary) {
        return Ok(run_id);
      }
      warn!(run_id = %run_id, "run_id_collision");
    }
    Err(SchedulerError::RunId {
      message: format!("no free run id after {MAX_RUN_ID_ATTEMPTS} attempts"),
    })
  }

  fn prepare(&self, info: &RunInfo, seeds: &[Arc<dyn Capability>]) -> Result<Sandbox, nexus_host::CapabilityError> {
    let sandbox = Sandbox::new()?;
    let seeds = CapabilityRegistry::from(seeds.to_vec());
    seeds.apply(&sandbox, info)?;
    self.capabilities.apply(&sandbox, info)?;
    Ok(sandbox)
  }
}

#[async_trait]
impl RunStarter for RunScheduler {
  async fn start_run(
    &self,
    runnable_uid: i64,
    context: StartContext,
    seeds: Vec<Arc<dyn Capability>>,
  ) -> Result<RunHandle, SchedulerError> {
    self.start(runnable_uid, context, seeds).await
  }
}

/// Drive a prepared run to completion and finalize its bookkeeping.
async fn execute(
  info: RunInfo,
  sandbox: Sandbox,
  broker: Arc<LogBroker>,
  runs: ActiveRuns,
  done: oneshot::Sender<RunOutcome>,
) {
  let cause = info.context.kind.as_str();
  let logger = &info.logger;

  logger.control(format!("Run starting. Cause: {cause}")).await;
  logger
    .data(LogLevel::Info, Datatype::StartInfo, format!("cause={cause}"))
    .await;

  let result = sandbox
    .exec_blocking(info.runnable.name.clone(), info.runnable.content.clone())
    .await;

  let (value, error) = match result {
    Ok(value) => (value, None),
    Err(e) => {
      match &e {
        ScriptError::Panic { .. } => error!(run_id = %info.run_id, error = %e, "run_panicked"),
        _ => info!(run_id = %info.run_id, error = %e, "run_script_failed"),
      }
      logger
        .data(LogLevel::Error, Datatype::Trace, e.to_string())
        .await;
      (String::new(), Some(e.to_string()))
    }
  };

  let level = if error.is_some() { LogLevel::Error } else { LogLevel::Info };
  logger
    .data(
      level,
      Datatype::EndInfo,
      format!("value={value},error='{}'", error.as_deref().unwrap_or("<nil>")),
    )
    .await;

  broker.done(&info.run_id);
  runs.finish(&info.run_id, error.clone());
  info!(
    run_id = %info.run_id,
    runnable_uid = info.runnable.uid,
    failed = error.is_some(),
    "run_finished"
  );

  let _ = done.send(RunOutcome {
    run_id: info.run_id.clone(),
    value,
    error,
  });
}
