use std::sync::Arc;

use nexus_host::mlua::{Lua, Table, Value};
use nexus_host::value::{json_to_lua, lua_to_json};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, kind};
use serde_json::Map;
use tracing::warn;

use crate::{Condition, Datastore, Query};

pub const NAME: &str = "datastore";

pub struct DatastoreCapability {
  datastore: Arc<dyn Datastore>,
}

impl DatastoreCapability {
  pub fn new(datastore: Arc<dyn Datastore>) -> Self {
    Self { datastore }
  }
}

fn ds_error(message: impl Into<String>) -> HostError {
  HostError::new(kind::DATASTORE, message)
}

fn fields_arg(lua: &Lua, value: Value, what: &str) -> Result<Map<String, serde_json::Value>, HostError> {
  match lua_to_json(lua, value).map_err(|e| ds_error(e.message))? {
    serde_json::Value::Object(map) => Ok(map),
    _ => Err(ds_error(format!("expected table containing fields to {what}"))),
  }
}

fn conditions_arg(lua: &Lua, value: Value) -> Result<Vec<Condition>, HostError> {
  if value.is_nil() {
    return Ok(Vec::new());
  }
  let conditions = match lua_to_json(lua, value).map_err(|e| ds_error(e.message))? {
    serde_json::Value::Array(items) => items,
    // An empty Lua table has no array marker.
    serde_json::Value::Object(map) if map.is_empty() => Vec::new(),
    _ => return Err(ds_error("expected list of conditions")),
  };

  conditions
    .into_iter()
    .enumerate()
    .map(|(i, condition)| {
      let bad = || ds_error(format!("bad conditional at index {i}: missing or bad type for 'column' or 'value'"));
      let column = condition.get("column").and_then(|c| c.as_str()).ok_or_else(bad)?;
      let value = condition.get("value").cloned().ok_or_else(bad)?;
      let conditional = condition
        .get("condition")
        .and_then(|c| c.as_str())
        .unwrap_or("==")
        .parse()
        .map_err(|e: crate::DatastoreError| ds_error(e.to_string()))?;
      Ok(Condition {
        column: column.to_string(),
        conditional,
        value,
      })
    })
    .collect()
}

fn success(lua: &Lua) -> nexus_host::mlua::Result<Table> {
  let result = lua.create_table()?;
  result.set("success", true)?;
  Ok(result)
}

impl Capability for DatastoreCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let ds = lua.create_table()?;

    let (store, info) = (self.datastore.clone(), run.clone());
    ds.set(
      "insert",
      lua.create_function(move |lua, (name, fields): (String, Value)| {
        let fields = fields_arg(lua, fields, "insert")?;
        let row_id = info
          .block_on(store.insert(info.owner_uid(), &name, fields))
          .map_err(|e| {
            warn!(run_id = %info.run_id, datastore = %name, error = %e, "datastore_insert_failed");
            ds_error(e.to_string())
          })?;
        let result = success(lua)?;
        result.set("rowID", row_id)?;
        Ok(result)
      })?,
    )?;

    let (store, info) = (self.datastore.clone(), run.clone());
    ds.set(
      "query",
      lua.create_function(
        move |lua, (name, conditions, limit, offset): (String, Value, Option<i64>, Option<i64>)| {
          let query = Query {
            conditions: conditions_arg(lua, conditions)?,
            limit: limit.map(|l| l.max(0) as usize),
            offset: offset.unwrap_or(0).max(0) as usize,
          };
          let rows = info
            .block_on(store.query(info.owner_uid(), &name, &query))
            .map_err(|e| {
              warn!(run_id = %info.run_id, datastore = %name, error = %e, "datastore_query_failed");
              ds_error(e.to_string())
            })?;

          let results = lua.create_table()?;
          for (i, row) in rows.into_iter().enumerate() {
            let entry = json_to_lua(lua, &serde_json::Value::Object(row.fields))?;
            if let Value::Table(t) = &entry {
              t.set("rowID", row.row_id)?;
            }
            results.raw_set(i + 1, entry)?;
          }
          let result = success(lua)?;
          result.set("results", results)?;
          Ok(result)
        },
      )?,
    )?;

    let (store, info) = (self.datastore.clone(), run.clone());
    ds.set(
      "editRow",
      lua.create_function(move |lua, (name, row_id, fields): (String, i64, Value)| {
        let fields = fields_arg(lua, fields, "set")?;
        info
          .block_on(store.edit_row(info.owner_uid(), &name, row_id, fields))
          .map_err(|e| ds_error(e.to_string()))?;
        success(lua)
      })?,
    )?;

    let (store, info) = (self.datastore.clone(), run.clone());
    ds.set(
      "deleteRow",
      lua.create_function(move |lua, (name, row_id): (String, i64)| {
        info
          .block_on(store.delete_row(info.owner_uid(), &name, row_id))
          .map_err(|e| ds_error(e.to_string()))?;
        success(lua)
      })?,
    )?;

    sandbox.set_global(NAME, ds)
  }
}
