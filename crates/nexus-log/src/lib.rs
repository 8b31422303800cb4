//! Nexus Log Broker
//!
//! Fans out log records of running scripts to live subscribers. A run must be
//! announced with [`LogBroker::started`] before anyone may subscribe to it, and
//! [`LogBroker::done`] notifies every subscriber and forgets the run.
//!
//! Records published for a run nobody listens to are simply dropped; durable
//! storage is the job of the `LogStore`.

mod consumer;

pub use consumer::{ChannelConsumer, LogEvent};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use nexus_store::LogRecord;
use tracing::debug;

/// Errors returned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
  /// The run has not been announced, or has already finished.
  #[error("run {run_id} is not running")]
  NotRunning { run_id: String },
}

/// A live listener for one run's log records.
///
/// Callbacks are invoked while the broker's lock is held and must not block.
pub trait LogConsumer: Send + Sync {
  fn message(&self, record: &LogRecord);

  fn done(&self);
}

#[derive(Default)]
struct BrokerState {
  running: HashSet<String>,
  subscribers: HashMap<String, Vec<Arc<dyn LogConsumer>>>,
}

/// Routes log records to the consumers subscribed to their run.
#[derive(Default)]
pub struct LogBroker {
  state: Mutex<BrokerState>,
}

impl LogBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mark a run as active so consumers may subscribe to it.
  pub fn started(&self, run_id: &str) {
    let mut state = self.lock();
    state.running.insert(run_id.to_string());
    debug!(run_id, "log_run_started");
  }

  /// Attach a consumer to an active run.
  pub fn subscribe(&self, run_id: &str, consumer: Arc<dyn LogConsumer>) -> Result<(), LogError> {
    let mut state = self.lock();
    if !state.running.contains(run_id) {
      return Err(LogError::NotRunning {
        run_id: run_id.to_string(),
      });
    }
    state
      .subscribers
      .entry(run_id.to_string())
      .or_default()
      .push(consumer);
    Ok(())
  }

  /// Deliver a record to every consumer of its run, in subscription order.
  pub fn log(&self, record: &LogRecord) {
    let state = self.lock();
    if let Some(consumers) = state.subscribers.get(&record.run_id) {
      for consumer in consumers {
        consumer.message(record);
      }
    }
  }

  /// Finish a run: notify every consumer once and clear all state for it.
  pub fn done(&self, run_id: &str) {
    let mut state = self.lock();
    state.running.remove(run_id);
    if let Some(consumers) = state.subscribers.remove(run_id) {
      for consumer in consumers {
        consumer.done();
      }
    }
    debug!(run_id, "log_run_done");
  }

  pub fn is_running(&self, run_id: &str) -> bool {
    self.lock().running.contains(run_id)
  }

  pub fn subscriber_count(&self, run_id: &str) -> usize {
    self.lock().subscribers.get(run_id).map_or(0, Vec::len)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}
