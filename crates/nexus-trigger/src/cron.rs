//! Cron triggers.
//!
//! `val1` holds the cron expression. Five-field expressions get a leading
//! seconds field of `0`. A shared loop wakes every tick and starts a run for
//! each trigger whose next fire time has passed.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use nexus_host::{Capability, CapabilityError, RunInfo, Sandbox, StartContext};
use nexus_runtime::RunStarter;
use nexus_store::{Trigger, TriggerKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TriggerError;
use crate::handler::TriggerHandler;

pub const DEFAULT_TICK: Duration = Duration::from_secs(6);

/// Parse a cron expression, accepting the five-field form.
pub fn parse_expression(expression: &str) -> Result<Schedule, cron::error::Error> {
  let trimmed = expression.trim();
  if trimmed.split_whitespace().count() == 5 {
    Schedule::from_str(&format!("0 {trimmed}"))
  } else {
    Schedule::from_str(trimmed)
  }
}

struct CronEntry {
  trigger: Trigger,
  /// `None` when the expression did not parse; the entry never fires.
  schedule: Option<Schedule>,
  next: Option<DateTime<Utc>>,
}

struct CronInner {
  starter: Arc<dyn RunStarter>,
  entries: Mutex<Vec<CronEntry>>,
  tick: Duration,
  shutdown: CancellationToken,
  started: AtomicBool,
}

/// Handler for [`TriggerKind::Cron`].
#[derive(Clone)]
pub struct CronTriggers {
  inner: Arc<CronInner>,
}

impl CronTriggers {
  pub fn new(starter: Arc<dyn RunStarter>) -> Self {
    Self::with_tick(starter, DEFAULT_TICK)
  }

  pub fn with_tick(starter: Arc<dyn RunStarter>, tick: Duration) -> Self {
    Self {
      inner: Arc::new(CronInner {
        starter,
        entries: Mutex::new(Vec::new()),
        tick,
        shutdown: CancellationToken::new(),
        started: AtomicBool::new(false),
      }),
    }
  }

  /// Next fire time of a registered trigger, `None` if unknown or inert.
  pub fn next_fire(&self, trigger_uid: i64) -> Option<DateTime<Utc>> {
    let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries
      .iter()
      .find(|e| e.trigger.uid == trigger_uid)
      .and_then(|e| e.next)
  }

  pub fn len(&self) -> usize {
    let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Fire every trigger due at `now`. Returns the number of runs requested.
  ///
  /// Next fire times are advanced before any run is started, so a slow start
  /// cannot make a trigger fire twice for the same slot.
  pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
    let due: Vec<Trigger> = {
      let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
      let mut due = Vec::new();
      for entry in entries.iter_mut() {
        let (Some(schedule), Some(next)) = (&entry.schedule, entry.next) else {
          continue;
        };
        if next <= now {
          entry.next = schedule.after(&now).next();
          due.push(entry.trigger.clone());
        }
      }
      due
    };

    for trigger in &due {
      self.fire(trigger).await;
    }
    due.len()
  }

  async fn fire(&self, trigger: &Trigger) {
    let seed: Arc<dyn Capability> = Arc::new(CronSpec {
      expression: trigger.val1.clone(),
    });
    match self
      .inner
      .starter
      .start_run(trigger.parent_uid, StartContext::from_trigger(trigger), vec![seed])
      .await
    {
      Ok(handle) => debug!(trigger_uid = trigger.uid, run_id = %handle.run_id, "cron_run_started"),
      Err(e) => warn!(trigger_uid = trigger.uid, error = %e, "cron_run_failed"),
    }
  }
}

#[async_trait]
impl TriggerHandler for CronTriggers {
  fn kind(&self) -> TriggerKind {
    TriggerKind::Cron
  }

  async fn register(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    if entries.iter().any(|e| e.trigger.uid == trigger.uid) {
      return Err(TriggerError::AlreadyRegistered {
        trigger_uid: trigger.uid,
      });
    }

    let schedule = match parse_expression(&trigger.val1) {
      Ok(schedule) => Some(schedule),
      Err(e) => {
        warn!(
          trigger_uid = trigger.uid,
          expression = %trigger.val1,
          error = %e,
          "cron_expression_invalid"
        );
        None
      }
    };
    let next = schedule.as_ref().and_then(|s| s.after(&Utc::now()).next());
    debug!(trigger_uid = trigger.uid, next = ?next, "cron_trigger_registered");

    entries.push(CronEntry {
      trigger: trigger.clone(),
      schedule,
      next,
    });
    Ok(())
  }

  async fn delete(&self, parent_uid: i64) -> Result<(), TriggerError> {
    let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.retain(|e| e.trigger.parent_uid != parent_uid);
    Ok(())
  }

  /// Start the shared tick loop. Calling it again is a no-op.
  fn setup(&self) {
    if self.inner.started.swap(true, Ordering::SeqCst) {
      return;
    }
    let this = self.clone();
    let shutdown = self.inner.shutdown.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(this.inner.tick);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      info!(tick_ms = this.inner.tick.as_millis() as u64, "cron_loop_started");
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = interval.tick() => {
            this.tick_at(Utc::now()).await;
          }
        }
      }
      info!("cron_loop_stopped");
    });
  }

  fn shutdown(&self) {
    self.inner.shutdown.cancel();
  }
}

/// Seeds the sandbox with the firing trigger's expression as `cronspec`.
struct CronSpec {
  expression: String,
}

impl Capability for CronSpec {
  fn name(&self) -> &str {
    "cronspec"
  }

  fn bind(&self, sandbox: &Sandbox, _run: &RunInfo) -> Result<(), CapabilityError> {
    sandbox.set_global("cronspec", self.expression.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration as ChronoDuration, TimeZone};

  #[test]
  fn test_five_field_expression_gets_seconds() {
    let schedule = parse_expression("*/5 * * * *").unwrap();
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
    let next = schedule.after(&from).next().unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
  }

  #[test]
  fn test_six_field_expression_is_used_as_is() {
    let schedule = parse_expression("* * * * * *").unwrap();
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
    let next = schedule.after(&from).next().unwrap();
    assert_eq!(next - from, ChronoDuration::seconds(1));
  }

  #[test]
  fn test_garbage_expression_is_rejected() {
    assert!(parse_expression("every tuesday").is_err());
    assert!(parse_expression("").is_err());
  }
}
