//! Conversions between Lua values and JSON.

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Value};

use crate::error::HostError;

/// Convert JSON into a Lua value. JSON `null` becomes `nil`.
pub fn json_to_lua(lua: &Lua, json: &serde_json::Value) -> mlua::Result<Value> {
  let options = SerializeOptions::new()
    .serialize_none_to_null(false)
    .serialize_unit_to_null(false);
  lua.to_value_with(json, options)
}

/// Convert a Lua value into JSON, failing on functions and userdata.
pub fn lua_to_json(lua: &Lua, value: Value) -> Result<serde_json::Value, HostError> {
  lua
    .from_value(value)
    .map_err(|e| HostError::api(format!("value is not JSON-encodable: {e}")))
}

/// Render a script value the way console output shows it.
pub fn to_display(value: &Value) -> String {
  match value {
    Value::Nil => "nil".to_string(),
    Value::Boolean(b) => b.to_string(),
    Value::Integer(i) => i.to_string(),
    Value::Number(n) => n.to_string(),
    Value::String(s) => s.to_string_lossy().to_string(),
    other => other.type_name().to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_json_object_round_trip() {
    let lua = Lua::new();
    let input = json!({"name": "digest", "count": 3, "tags": ["a", "b"]});
    let value = json_to_lua(&lua, &input).unwrap();
    assert_eq!(lua_to_json(&lua, value).unwrap(), input);
  }

  #[test]
  fn test_json_null_becomes_nil() {
    let lua = Lua::new();
    let value = json_to_lua(&lua, &serde_json::Value::Null).unwrap();
    assert!(value.is_nil());
  }

  #[test]
  fn test_functions_are_not_json() {
    let lua = Lua::new();
    let f = lua.create_function(|_, ()| Ok(())).unwrap();
    let err = lua_to_json(&lua, Value::Function(f)).unwrap_err();
    assert_eq!(err.kind, "api-error");
  }
}
