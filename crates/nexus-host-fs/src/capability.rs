use std::sync::Arc;

use nexus_host::mlua::{Lua, Table, Value};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, kind};
use tracing::warn;

use crate::{FileEntry, FileSource, ItemKind};

pub const NAME: &str = "fs";

/// Binds `fs` with `read`, `write`, `delete`, `list`, `isFile` and `isDir`.
pub struct FsCapability {
  source: Arc<dyn FileSource>,
}

impl FsCapability {
  pub fn new(source: Arc<dyn FileSource>) -> Self {
    Self { source }
  }
}

fn fs_error(run: &RunInfo, op: &str, e: impl std::fmt::Display) -> HostError {
  warn!(run_id = %run.run_id, op, error = %e, "fs_call_failed");
  HostError::new(kind::FS, e.to_string())
}

fn entry_table(lua: &Lua, entry: &FileEntry) -> nexus_host::mlua::Result<Table> {
  let table = lua.create_table()?;
  table.set("name", entry.name.as_str())?;
  table.set("kind", entry.kind as i64)?;
  table.set("size", entry.size)?;
  table.set("modified", entry.modified.map(|t| t.timestamp()))?;
  Ok(table)
}

/// Accept either a listed item or a bare kind number.
fn item_kind(value: &Value, helper: &str) -> Result<i64, HostError> {
  let invalid = || HostError::new(kind::FS, format!("{helper}() expects an integer or an item from fs.list()"));
  match value {
    Value::Integer(i) => Ok(*i),
    Value::Number(n) => Ok(*n as i64),
    Value::Table(t) => {
      let kind: Option<i64> = t.get("kind").map_err(|_| invalid())?;
      kind.ok_or_else(invalid)
    }
    _ => Err(invalid()),
  }
}

impl Capability for FsCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let fs = lua.create_table()?;

    let (source, info) = (self.source.clone(), run.clone());
    fs.set(
      "read",
      lua.create_function(move |lua, path: String| {
        let data = info
          .block_on(source.read(info.owner_uid(), &path))
          .map_err(|e| fs_error(&info, "read", e))?;
        lua.create_string(&data)
      })?,
    )?;

    let (source, info) = (self.source.clone(), run.clone());
    fs.set(
      "write",
      lua.create_function(move |_, (path, data): (String, nexus_host::mlua::String)| {
        info
          .block_on(source.write(info.owner_uid(), &path, &data.as_bytes()))
          .map_err(|e| fs_error(&info, "write", e))?;
        Ok(())
      })?,
    )?;

    let (source, info) = (self.source.clone(), run.clone());
    fs.set(
      "delete",
      lua.create_function(move |_, path: String| {
        info
          .block_on(source.delete(info.owner_uid(), &path))
          .map_err(|e| fs_error(&info, "delete", e))?;
        Ok(())
      })?,
    )?;

    let (source, info) = (self.source.clone(), run.clone());
    fs.set(
      "list",
      lua.create_function(move |lua, path: Option<String>| {
        let path = path.unwrap_or_else(|| "/".to_string());
        let entries = info
          .block_on(source.list(info.owner_uid(), &path))
          .map_err(|e| fs_error(&info, "list", e))?;
        let items = lua.create_table()?;
        for (i, entry) in entries.iter().enumerate() {
          items.raw_set(i + 1, entry_table(lua, entry)?)?;
        }
        Ok(items)
      })?,
    )?;

    fs.set(
      "isFile",
      lua.create_function(|_, value: Value| Ok(item_kind(&value, "isFile")? == ItemKind::File as i64))?,
    )?;
    fs.set(
      "isDir",
      lua.create_function(|_, value: Value| Ok(item_kind(&value, "isDir")? == ItemKind::Directory as i64))?,
    )?;

    sandbox.set_global(NAME, fs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::LocalFileSource;
  use nexus_host::testing::{TestRun, runnable};

  async fn exec(root: &std::path::Path, source: &str) -> Result<String, nexus_host::ScriptError> {
    let run = TestRun::new(runnable(1, source));
    let sandbox = Sandbox::new().unwrap();
    FsCapability::new(Arc::new(LocalFileSource::new(root)))
      .bind(&sandbox, &run.info)
      .unwrap();
    sandbox
      .exec_blocking("test".to_string(), source.to_string())
      .await
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let result = exec(dir.path(), "fs.write('greeting.txt', 'hi there') return fs.read('greeting.txt')")
      .await
      .unwrap();
    assert_eq!(result, "hi there");
    // Runnable owner is uid 1.
    assert!(dir.path().join("1/greeting.txt").exists());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_list_and_kind_helpers() {
    let dir = tempfile::tempdir().unwrap();
    let source = r#"
      fs.write('docs/a.txt', 'a')
      fs.write('z.txt', 'z')
      local items = fs.list('/')
      return items[1].name .. ':' .. tostring(fs.isDir(items[1])) .. ',' ..
        items[2].name .. ':' .. tostring(fs.isFile(items[2].kind))
    "#;
    let result = exec(dir.path(), source).await.unwrap();
    assert_eq!(result, "docs:true,z.txt:true");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_missing_file_raises_fs_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = "local ok, err = pcall(fs.read, 'nope') return tostring(ok) .. tostring(err)";
    let result = exec(dir.path(), source).await.unwrap();
    assert!(result.starts_with("false"), "{result}");
    assert!(result.contains("fs: file not found"), "{result}");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_is_file_rejects_strings() {
    let dir = tempfile::tempdir().unwrap();
    let err = exec(dir.path(), "return fs.isFile('x')").await.unwrap_err();
    assert!(err.to_string().contains("fs: isFile()"), "{err}");
  }
}
