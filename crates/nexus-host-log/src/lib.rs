//! Console capability.
//!
//! Binds `console` into the sandbox. `log`, `warn` and `error` join their
//! arguments with spaces and write a `log` record at the matching level;
//! `data` JSON-encodes exactly one value into a `json` record.

use nexus_host::mlua::{Value, Variadic};
use nexus_host::value::{lua_to_json, to_display};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox};
use nexus_store::{Datatype, LogKind, LogLevel};
use tracing::trace;

pub const NAME: &str = "console";

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleCapability;

impl Capability for ConsoleCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let console = lua.create_table()?;

    for (method, level) in [
      ("log", LogLevel::Info),
      ("warn", LogLevel::Warning),
      ("error", LogLevel::Error),
    ] {
      let run = run.clone();
      let f = lua.create_function(move |_, args: Variadic<Value>| {
        let line = args.iter().map(to_display).collect::<Vec<_>>().join(" ");
        trace!(run_id = %run.run_id, %line, "console_line");
        run.block_on(run.logger.write(LogKind::Log, level, Datatype::String, line));
        Ok(())
      })?;
      console.set(method, f)?;
    }

    let run = run.clone();
    let data = lua.create_function(move |lua, mut args: Variadic<Value>| {
      if args.len() != 1 {
        return Err(HostError::api("console.data() expects exactly one argument").into());
      }
      let value = args.pop().unwrap_or(Value::Nil);
      let json = lua_to_json(lua, value)?;
      let encoded = serde_json::to_string(&json).map_err(|e| HostError::internal(e.to_string()))?;
      run.block_on(run.logger.write(LogKind::Json, LogLevel::Info, Datatype::Unstructured, encoded));
      Ok(())
    })?;
    console.set("data", data)?;

    sandbox.set_global(NAME, console)
  }
}
