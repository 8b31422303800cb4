use mlua::{IntoLua, Lua, LuaOptions, StdLib, Table, Value};

use crate::error::{CapabilityError, ScriptError};

/// Base-library functions that reach outside the sandbox.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "print"];

/// Replaces `load` with a text-only version. Precompiled chunks are never
/// verified by the VM. An explicit `env` argument is passed through only when
/// given, since `load` treats a nil fourth argument as an empty environment.
const TEXT_ONLY_LOAD: &str = r##"
local base_load = load
load = function(chunk, name, _, ...)
  if select("#", ...) > 0 then
    return base_load(chunk, name, "t", ...)
  end
  return base_load(chunk, name, "t")
end
"##;

/// An isolated Lua state for a single run.
///
/// Only the table, string, math, utf8 and coroutine libraries are loaded; there
/// is no `io`, `os`, `package` or `debug`. `load` accepts source text only and
/// `string.dump` is gone. Everything else a script can reach is bound in as a
/// capability.
pub struct Sandbox {
  lua: Lua,
}

impl Sandbox {
  pub fn new() -> Result<Self, CapabilityError> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
    let lua = Lua::new_with(libs, LuaOptions::default())?;
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
      globals.raw_set(*name, Value::Nil)?;
    }
    let string: Table = globals.get("string")?;
    string.raw_set("dump", Value::Nil)?;
    lua.load(TEXT_ONLY_LOAD).set_name("=sandbox").exec()?;
    Ok(Self { lua })
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn create_table(&self) -> Result<Table, CapabilityError> {
    Ok(self.lua.create_table()?)
  }

  pub fn set_global(&self, name: &str, value: impl IntoLua) -> Result<(), CapabilityError> {
    self.lua.globals().set(name, value)?;
    Ok(())
  }

  pub fn has_global(&self, name: &str) -> bool {
    self.lua.globals().contains_key(name).unwrap_or(false)
  }

  /// Run `source` to completion on the current thread.
  ///
  /// Returns the string form of the chunk's result. Host closures may block
  /// on the tokio runtime, so this must not be called from an async context;
  /// use [`Sandbox::exec_blocking`] there.
  pub fn exec(&self, chunk_name: &str, source: &str) -> Result<String, ScriptError> {
    let value: Value = self.lua.load(source).set_name(chunk_name).eval()?;
    Ok(crate::value::to_display(&value))
  }

  /// Run the script on the blocking thread pool.
  pub async fn exec_blocking(self, chunk_name: String, source: String) -> Result<String, ScriptError> {
    match tokio::task::spawn_blocking(move || self.exec(&chunk_name, &source)).await {
      Ok(result) => result,
      Err(join) => Err(ScriptError::Panic {
        message: join.to_string(),
      }),
    }
  }
}
