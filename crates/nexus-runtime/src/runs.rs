use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nexus_host::StartContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
  Running,
  Finished {
    finished_at: DateTime<Utc>,
    error: Option<String>,
  },
}

/// Entry in the active-run table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
  pub run_id: String,
  pub runnable_uid: i64,
  pub runnable_name: String,
  pub context: StartContext,
  pub started_at: DateTime<Utc>,
  pub state: RunState,
}

/// Table of runs keyed by run id.
///
/// Entries stay while the run executes and, once finished, until
/// [`ActiveRuns::reap`] evicts them.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
  runs: Arc<RwLock<HashMap<String, RunSummary>>>,
}

impl ActiveRuns {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a new entry unless its run id is already taken.
  pub(crate) fn try_insert(&self, summary: RunSummary) -> bool {
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    match runs.entry(summary.run_id.clone()) {
      Entry::Occupied(_) => false,
      Entry::Vacant(slot) => {
        slot.insert(summary);
        true
      }
    }
  }

  pub(crate) fn remove(&self, run_id: &str) {
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    runs.remove(run_id);
  }

  pub(crate) fn finish(&self, run_id: &str, error: Option<String>) {
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    if let Some(summary) = runs.get_mut(run_id) {
      summary.state = RunState::Finished {
        finished_at: Utc::now(),
        error,
      };
    }
  }

  pub fn get(&self, run_id: &str) -> Option<RunSummary> {
    let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
    runs.get(run_id).cloned()
  }

  /// All entries, oldest first.
  pub fn list(&self) -> Vec<RunSummary> {
    let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
    let mut list: Vec<RunSummary> = runs.values().cloned().collect();
    list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
    list
  }

  pub fn is_running(&self, run_id: &str) -> bool {
    self
      .get(run_id)
      .is_some_and(|summary| summary.state == RunState::Running)
  }

  pub fn len(&self) -> usize {
    self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Evict finished runs that ended more than `retention` ago. Returns the
  /// number of evicted entries.
  pub fn reap(&self, retention: Duration) -> usize {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now().checked_sub_signed(retention);
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    let before = runs.len();
    runs.retain(|_, summary| match (&summary.state, cutoff) {
      (RunState::Finished { finished_at, .. }, Some(cutoff)) => *finished_at > cutoff,
      _ => true,
    });
    before - runs.len()
  }
}
