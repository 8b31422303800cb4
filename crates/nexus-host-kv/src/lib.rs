//! Key-value capability.
//!
//! Binds `kv` with `get(key)` and `set(key, value)`. Values are stored as JSON
//! through the [`KvStore`] collaborator, keyed by the runnable's uid, so data
//! persists across runs of the same runnable and is invisible to others.

use std::sync::Arc;

use nexus_host::mlua::Value;
use nexus_host::value::{json_to_lua, lua_to_json};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, kind};
use nexus_store::KvStore;
use tracing::warn;

pub const NAME: &str = "kv";

pub struct KvCapability {
  store: Arc<dyn KvStore>,
}

impl KvCapability {
  pub fn new(store: Arc<dyn KvStore>) -> Self {
    Self { store }
  }
}

impl Capability for KvCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let kv = lua.create_table()?;

    let store = self.store.clone();
    let info = run.clone();
    let get = lua.create_function(move |lua, key: String| {
      let stored = info
        .block_on(store.get_data(info.runnable_uid(), &key))
        .map_err(|e| {
          warn!(run_id = %info.run_id, %key, error = %e, "kv_get_failed");
          HostError::new(kind::KV, e.to_string())
        })?;
      let Some(raw) = stored else {
        return Ok(Value::Nil);
      };
      let json: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| HostError::new(kind::KV, e.to_string()))?;
      json_to_lua(lua, &json)
    })?;
    kv.set("get", get)?;

    let store = self.store.clone();
    let info = run.clone();
    let set = lua.create_function(move |lua, (key, value): (String, Value)| {
      let json = lua_to_json(lua, value).map_err(|e| HostError::new(kind::KV, e.message))?;
      let encoded = serde_json::to_string(&json).map_err(|e| HostError::new(kind::KV, e.to_string()))?;
      info
        .block_on(store.set_data(info.runnable_uid(), &key, &encoded))
        .map_err(|e| {
          warn!(run_id = %info.run_id, %key, error = %e, "kv_set_failed");
          HostError::new(kind::KV, e.to_string())
        })?;
      Ok(())
    })?;
    kv.set("set", set)?;

    sandbox.set_global(NAME, kv)
  }
}
