use std::collections::HashMap;
use std::sync::Arc;

use nexus_store::{Runnable, RunnableStore, Trigger, TriggerKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::TriggerError;
use crate::handler::TriggerHandler;

/// Routes trigger registrations to the handler of each trigger kind.
///
/// Updates for a runnable are applied as a sweep: its triggers are deleted
/// from every handler and the new list is registered. Sweeps are serialized,
/// and a failed sweep restores the previously applied list.
pub struct TriggerRegistry {
  handlers: Vec<Arc<dyn TriggerHandler>>,
  applied: Mutex<HashMap<i64, Vec<Trigger>>>,
}

impl TriggerRegistry {
  pub fn new() -> Self {
    Self {
      handlers: Vec::new(),
      applied: Mutex::new(HashMap::new()),
    }
  }

  /// Add a handler. A later handler for the same kind replaces the earlier one.
  pub fn with_handler(mut self, handler: Arc<dyn TriggerHandler>) -> Self {
    self.handlers.retain(|h| h.kind() != handler.kind());
    self.handlers.push(handler);
    self
  }

  pub fn kinds(&self) -> Vec<TriggerKind> {
    self.handlers.iter().map(|h| h.kind()).collect()
  }

  fn handler_for(&self, kind: TriggerKind) -> Result<&Arc<dyn TriggerHandler>, TriggerError> {
    self
      .handlers
      .iter()
      .find(|h| h.kind() == kind)
      .ok_or(TriggerError::NoHandler { kind })
  }

  /// Run every handler's one-time setup.
  pub fn setup(&self) {
    for handler in &self.handlers {
      handler.setup();
    }
  }

  /// Set up the handlers and register every persisted trigger.
  ///
  /// A trigger that fails to register is logged and skipped. Returns the
  /// number of triggers registered.
  pub async fn initialise(&self, store: &dyn RunnableStore) -> Result<usize, TriggerError> {
    self.setup();

    let triggers = store.list_triggers().await?;
    let mut applied = self.applied.lock().await;
    let mut count = 0;
    for trigger in triggers {
      let handler = match self.handler_for(trigger.kind) {
        Ok(handler) => handler,
        Err(e) => {
          warn!(trigger_uid = trigger.uid, error = %e, "trigger_kind_unhandled");
          continue;
        }
      };
      if let Err(e) = handler.register(&trigger).await {
        warn!(
          trigger_uid = trigger.uid,
          runnable_uid = trigger.parent_uid,
          error = %e,
          "trigger_register_failed"
        );
        continue;
      }
      applied.entry(trigger.parent_uid).or_default().push(trigger);
      count += 1;
    }

    info!(count, "triggers_initialised");
    Ok(count)
  }

  /// Replace the registered triggers of `runnable` with its current list.
  ///
  /// Every trigger is validated before anything is removed. If a registration
  /// fails, the runnable's triggers are removed again and the previous list is
  /// re-registered before the error is returned.
  pub async fn runnable_changed(&self, runnable: &Runnable) -> Result<(), TriggerError> {
    for trigger in &runnable.triggers {
      if trigger.parent_uid != runnable.uid {
        return Err(TriggerError::ForeignTrigger {
          trigger_uid: trigger.uid,
          parent_uid: trigger.parent_uid,
          runnable_uid: runnable.uid,
        });
      }
      self.handler_for(trigger.kind)?;
    }

    let mut applied = self.applied.lock().await;
    self.delete_everywhere(runnable.uid).await?;
    let previous = applied.remove(&runnable.uid).unwrap_or_default();

    for trigger in &runnable.triggers {
      let result = match self.handler_for(trigger.kind) {
        Ok(handler) => handler.register(trigger).await,
        Err(e) => Err(e),
      };
      if let Err(e) = result {
        warn!(
          runnable_uid = runnable.uid,
          trigger_uid = trigger.uid,
          error = %e,
          "trigger_sweep_failed"
        );
        let restored = self.restore(runnable.uid, previous).await;
        if !restored.is_empty() {
          applied.insert(runnable.uid, restored);
        }
        return Err(e);
      }
    }

    if !runnable.triggers.is_empty() {
      applied.insert(runnable.uid, runnable.triggers.clone());
    }
    info!(
      runnable_uid = runnable.uid,
      count = runnable.triggers.len(),
      "runnable_triggers_applied"
    );
    Ok(())
  }

  /// Remove every trigger of a runnable from all handlers.
  pub async fn remove_runnable(&self, runnable_uid: i64) -> Result<(), TriggerError> {
    let mut applied = self.applied.lock().await;
    self.delete_everywhere(runnable_uid).await?;
    applied.remove(&runnable_uid);
    Ok(())
  }

  /// Triggers currently applied for a runnable.
  pub async fn registered(&self, runnable_uid: i64) -> Vec<Trigger> {
    let applied = self.applied.lock().await;
    applied.get(&runnable_uid).cloned().unwrap_or_default()
  }

  /// Stop background work in every handler.
  pub fn shutdown(&self) {
    for handler in &self.handlers {
      handler.shutdown();
    }
  }

  async fn delete_everywhere(&self, runnable_uid: i64) -> Result<(), TriggerError> {
    for handler in &self.handlers {
      handler.delete(runnable_uid).await?;
    }
    Ok(())
  }

  /// Best-effort rollback to `previous`. Returns the triggers that came back.
  async fn restore(&self, runnable_uid: i64, previous: Vec<Trigger>) -> Vec<Trigger> {
    for handler in &self.handlers {
      if let Err(e) = handler.delete(runnable_uid).await {
        warn!(runnable_uid, error = %e, "trigger_rollback_delete_failed");
      }
    }

    let mut restored = Vec::with_capacity(previous.len());
    for trigger in previous {
      let result = match self.handler_for(trigger.kind) {
        Ok(handler) => handler.register(&trigger).await,
        Err(e) => Err(e),
      };
      match result {
        Ok(()) => restored.push(trigger),
        Err(e) => warn!(
          runnable_uid,
          trigger_uid = trigger.uid,
          error = %e,
          "trigger_rollback_register_failed"
        ),
      }
    }
    restored
  }
}

impl Default for TriggerRegistry {
  fn default() -> Self {
    Self::new()
  }
}
