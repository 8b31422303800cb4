//! Nexus Host
//!
//! Shared infrastructure for executing a runnable's script:
//!
//! - [`Sandbox`]: an isolated Lua state with only the safe standard libraries
//! - [`Capability`] and [`CapabilityRegistry`]: named host objects bound into
//!   the sandbox before the script starts
//! - [`RunInfo`] and [`RunLogger`]: per-run context handed to every capability
//! - [`HostError`]: the error raised into scripts by failing host calls

mod capability;
mod error;
mod logger;
mod run;
mod sandbox;
pub mod value;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capability::{Capability, CapabilityRegistry};
pub use error::{CapabilityError, HostError, ScriptError, kind};
pub use logger::RunLogger;
pub use run::{RunInfo, StartContext};
pub use sandbox::Sandbox;

pub use mlua;
