use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{Datastore, DatastoreError, Query, Row};

#[derive(Debug, Default)]
struct Table {
  owner_uid: i64,
  shared_with: HashSet<i64>,
  next_row: i64,
  rows: BTreeMap<i64, Map<String, Value>>,
}

impl Table {
  fn can_access(&self, uid: i64) -> bool {
    self.owner_uid == uid || self.shared_with.contains(&uid)
  }
}

/// In-memory [`Datastore`]. Tables must be created before use.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
  tables: RwLock<HashMap<String, Table>>,
}

impl MemoryDatastore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create an empty datastore owned by `owner_uid`, replacing any existing one.
  pub fn create(&self, name: &str, owner_uid: i64) {
    let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
    tables.insert(
      name.to_string(),
      Table {
        owner_uid,
        next_row: 1,
        ..Table::default()
      },
    );
  }

  /// Allow a non-owner to use a datastore.
  pub fn grant(&self, name: &str, uid: i64) -> Result<(), DatastoreError> {
    let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
    let table = tables.get_mut(name).ok_or_else(|| DatastoreError::NotFound {
      name: name.to_string(),
    })?;
    table.shared_with.insert(uid);
    Ok(())
  }

  fn with_table<R>(
    &self,
    owner_uid: i64,
    name: &str,
    f: impl FnOnce(&mut Table) -> Result<R, DatastoreError>,
  ) -> Result<R, DatastoreError> {
    let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
    let table = tables.get_mut(name).ok_or_else(|| DatastoreError::NotFound {
      name: name.to_string(),
    })?;
    if !table.can_access(owner_uid) {
      return Err(DatastoreError::AccessDenied {
        name: name.to_string(),
      });
    }
    f(table)
  }
}

#[async_trait]
impl Datastore for MemoryDatastore {
  async fn insert(&self, owner_uid: i64, name: &str, fields: Map<String, Value>) -> Result<i64, DatastoreError> {
    self.with_table(owner_uid, name, |table| {
      let row_id = table.next_row;
      table.next_row += 1;
      table.rows.insert(row_id, fields);
      Ok(row_id)
    })
  }

  async fn query(&self, owner_uid: i64, name: &str, query: &Query) -> Result<Vec<Row>, DatastoreError> {
    self.with_table(owner_uid, name, |table| {
      let matching = table
        .rows
        .iter()
        .filter(|(_, fields)| query.conditions.iter().all(|c| c.matches(fields)))
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|(row_id, fields)| Row {
          row_id: *row_id,
          fields: fields.clone(),
        })
        .collect();
      Ok(matching)
    })
  }

  async fn edit_row(
    &self,
    owner_uid: i64,
    name: &str,
    row_id: i64,
    fields: Map<String, Value>,
  ) -> Result<(), DatastoreError> {
    self.with_table(owner_uid, name, |table| {
      let row = table.rows.get_mut(&row_id).ok_or_else(|| DatastoreError::RowNotFound {
        name: name.to_string(),
        row_id,
      })?;
      row.extend(fields);
      Ok(())
    })
  }

  async fn delete_row(&self, owner_uid: i64, name: &str, row_id: i64) -> Result<(), DatastoreError> {
    self.with_table(owner_uid, name, |table| {
      table
        .rows
        .remove(&row_id)
        .map(|_| ())
        .ok_or_else(|| DatastoreError::RowNotFound {
          name: name.to_string(),
          row_id,
        })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Condition, Conditional};
  use serde_json::json;

  fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
  }

  #[tokio::test]
  async fn test_access_is_checked() {
    let store = MemoryDatastore::new();
    store.create("people", 1);

    let err = store.insert(2, "people", Map::new()).await.unwrap_err();
    assert!(matches!(err, DatastoreError::AccessDenied { .. }));

    store.grant("people", 2).unwrap();
    assert_eq!(store.insert(2, "people", Map::new()).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_query_edit_delete() {
    let store = MemoryDatastore::new();
    store.create("people", 1);
    for age in [10, 20, 30, 40] {
      store.insert(1, "people", fields(json!({"age": age}))).await.unwrap();
    }

    let query = Query {
      conditions: vec![Condition {
        column: "age".to_string(),
        conditional: Conditional::Ge,
        value: json!(20),
      }],
      limit: Some(2),
      offset: 1,
    };
    let rows = store.query(1, "people", &query).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![3, 4]);

    store.edit_row(1, "people", 3, fields(json!({"name": "c"}))).await.unwrap();
    let rows = store.query(1, "people", &Query::default()).await.unwrap();
    assert_eq!(rows[2].fields, fields(json!({"age": 30, "name": "c"})));

    store.delete_row(1, "people", 3).await.unwrap();
    assert!(matches!(
      store.delete_row(1, "people", 3).await,
      Err(DatastoreError::RowNotFound { row_id: 3, .. })
    ));
  }

  #[tokio::test]
  async fn test_unknown_datastore() {
    let store = MemoryDatastore::new();
    assert!(matches!(
      store.query(1, "nope", &Query::default()).await,
      Err(DatastoreError::NotFound { .. })
    ));
  }
}
