//! Nexus Runtime
//!
//! The [`RunScheduler`] turns "run runnable X because of Y" into an isolated,
//! concurrently executing script run:
//!
//! 1. load the runnable from the store
//! 2. allocate a unique run id
//! 3. build a sandbox, bind trigger seeds and then every registered capability
//! 4. announce the run to the log broker and record it in [`ActiveRuns`]
//! 5. execute the script on the blocking pool, writing lifecycle log records
//!
//! Trigger handlers depend only on the [`RunStarter`] trait.

mod builtins;
mod error;
mod run_id;
mod runs;
mod scheduler;

pub use builtins::{ContextCapability, OwnerCapability};
pub use error::SchedulerError;
pub use run_id::generate_run_id;
pub use runs::{ActiveRuns, RunState, RunSummary};
pub use scheduler::{RunHandle, RunOutcome, RunScheduler, RunStarter};
