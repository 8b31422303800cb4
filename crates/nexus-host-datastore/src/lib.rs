//! Datastore capability and collaborator.
//!
//! A datastore is a named table of JSON rows owned by a user. Scripts reach it
//! through `datastore.insert`, `query`, `editRow` and `deleteRow`; access
//! checks are the collaborator's job and use the runnable owner's uid.

mod capability;
mod memory;

pub use capability::DatastoreCapability;
pub use memory::MemoryDatastore;

use std::cmp::Ordering;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatastoreError {
  #[error("no datastore named {name}")]
  NotFound { name: String },

  #[error("access to datastore {name} denied")]
  AccessDenied { name: String },

  #[error("row {row_id} not found in {name}")]
  RowNotFound { name: String, row_id: i64 },

  #[error("invalid query: {message}")]
  InvalidQuery { message: String },
}

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditional {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

impl FromStr for Conditional {
  type Err = DatastoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "" | "==" | "=" => Ok(Conditional::Eq),
      "!=" => Ok(Conditional::Ne),
      "<" => Ok(Conditional::Lt),
      "<=" => Ok(Conditional::Le),
      ">" => Ok(Conditional::Gt),
      ">=" => Ok(Conditional::Ge),
      other => Err(DatastoreError::InvalidQuery {
        message: format!("unknown condition {other}"),
      }),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
  pub column: String,
  pub conditional: Conditional,
  pub value: Value,
}

impl Condition {
  /// Whether a row satisfies the condition. Missing columns never match.
  pub fn matches(&self, row: &Map<String, Value>) -> bool {
    let Some(actual) = row.get(&self.column) else {
      return false;
    };
    let ordering = compare(actual, &self.value);
    match self.conditional {
      Conditional::Eq => actual == &self.value || ordering == Some(Ordering::Equal),
      Conditional::Ne => actual != &self.value && ordering != Some(Ordering::Equal),
      Conditional::Lt => ordering == Some(Ordering::Less),
      Conditional::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
      Conditional::Gt => ordering == Some(Ordering::Greater),
      Conditional::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
  }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
  pub conditions: Vec<Condition>,
  pub limit: Option<usize>,
  pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
  pub row_id: i64,
  pub fields: Map<String, Value>,
}

/// Named, owner-controlled row storage.
#[async_trait]
pub trait Datastore: Send + Sync {
  /// Insert a row, returning its id.
  async fn insert(&self, owner_uid: i64, name: &str, fields: Map<String, Value>) -> Result<i64, DatastoreError>;

  /// Rows matching every condition, ordered by row id.
  async fn query(&self, owner_uid: i64, name: &str, query: &Query) -> Result<Vec<Row>, DatastoreError>;

  /// Merge `fields` into an existing row.
  async fn edit_row(
    &self,
    owner_uid: i64,
    name: &str,
    row_id: i64,
    fields: Map<String, Value>,
  ) -> Result<(), DatastoreError>;

  async fn delete_row(&self, owner_uid: i64, name: &str, row_id: i64) -> Result<(), DatastoreError>;
}
