use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{
  Error, KvStore, LogRecord, LogStore, Runnable, RunnableStore, Session, SessionStore, Trigger, User,
  UserDirectory,
};

#[derive(Debug, Default)]
struct Tables {
  runnables: HashMap<i64, Runnable>,
  users: HashMap<i64, User>,
  sessions: HashMap<String, Session>,
  logs: Vec<LogRecord>,
  data: HashMap<(i64, String), String>,
}

/// In-memory store implementing every storage trait.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every log record written so far, in write order.
  pub fn logs(&self) -> Vec<LogRecord> {
    self.read(|t| t.logs.clone())
  }

  fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
    let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
    f(&tables)
  }

  fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
    let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
    f(&mut tables)
  }
}

#[async_trait]
impl RunnableStore for MemoryStore {
  async fn get_runnable(&self, uid: i64) -> Result<Runnable, Error> {
    self
      .read(|t| t.runnables.get(&uid).cloned())
      .ok_or_else(|| Error::NotFound(format!("runnable {uid}")))
  }

  async fn list_triggers(&self) -> Result<Vec<Trigger>, Error> {
    let mut triggers: Vec<Trigger> = self.read(|t| {
      t.runnables
        .values()
        .flat_map(|r| r.triggers.iter().cloned())
        .collect()
    });
    triggers.sort_by_key(|t| t.uid);
    Ok(triggers)
  }

  async fn save_runnable(&self, runnable: &Runnable) -> Result<(), Error> {
    self.write(|t| t.runnables.insert(runnable.uid, runnable.clone()));
    Ok(())
  }
}

#[async_trait]
impl UserDirectory for MemoryStore {
  async fn get_user(&self, uid: i64) -> Result<User, Error> {
    self
      .read(|t| t.users.get(&uid).cloned())
      .ok_or_else(|| Error::NotFound(format!("user {uid}")))
  }

  async fn save_user(&self, user: &User) -> Result<(), Error> {
    self.write(|t| t.users.insert(user.uid, user.clone()));
    Ok(())
  }
}

#[async_trait]
impl SessionStore for MemoryStore {
  async fn get_session(&self, sid: &str) -> Result<Session, Error> {
    self
      .read(|t| t.sessions.get(sid).filter(|s| !s.revoked).cloned())
      .ok_or_else(|| Error::NotFound("session".to_string()))
  }

  async fn save_session(&self, session: &Session) -> Result<(), Error> {
    self.write(|t| t.sessions.insert(session.sid.clone(), session.clone()));
    Ok(())
  }
}

#[async_trait]
impl LogStore for MemoryStore {
  async fn write_log(&self, record: &LogRecord) -> Result<(), Error> {
    self.write(|t| t.logs.push(record.clone()));
    Ok(())
  }

  async fn list_logs(&self, parent_uid: i64, run_id: &str) -> Result<Vec<LogRecord>, Error> {
    Ok(self.read(|t| {
      t.logs
        .iter()
        .filter(|r| r.parent_uid == parent_uid && r.run_id == run_id)
        .cloned()
        .collect()
    }))
  }
}

#[async_trait]
impl KvStore for MemoryStore {
  async fn get_data(&self, runnable_uid: i64, key: &str) -> Result<Option<String>, Error> {
    Ok(self.read(|t| t.data.get(&(runnable_uid, key.to_string())).cloned()))
  }

  async fn set_data(&self, runnable_uid: i64, key: &str, value: &str) -> Result<(), Error> {
    self.write(|t| t.data.insert((runnable_uid, key.to_string()), value.to_string()));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Datatype, LogKind, LogLevel, TriggerKind};

  fn runnable(uid: i64) -> Runnable {
    Runnable {
      uid,
      owner_uid: 1,
      name: format!("runnable-{uid}"),
      content: "return 1".to_string(),
      triggers: vec![Trigger {
        uid: uid * 10,
        parent_uid: uid,
        owner_uid: 1,
        name: "every minute".to_string(),
        kind: TriggerKind::Cron,
        val1: "* * * * *".to_string(),
        val2: String::new(),
        val3: String::new(),
      }],
    }
  }

  #[tokio::test]
  async fn test_get_missing_runnable() {
    let store = MemoryStore::new();
    let err = store.get_runnable(4).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
  }

  #[tokio::test]
  async fn test_list_triggers_across_runnables() {
    let store = MemoryStore::new();
    store.save_runnable(&runnable(2)).await.unwrap();
    store.save_runnable(&runnable(1)).await.unwrap();

    let triggers = store.list_triggers().await.unwrap();
    let uids: Vec<i64> = triggers.iter().map(|t| t.uid).collect();
    assert_eq!(uids, vec![10, 20]);
  }

  #[tokio::test]
  async fn test_logs_filtered_by_run() {
    let store = MemoryStore::new();
    for run in ["a", "b", "a"] {
      let record = LogRecord::new(1, run, LogKind::Log, LogLevel::Info, Datatype::String, "x");
      store.write_log(&record).await.unwrap();
    }
    assert_eq!(store.list_logs(1, "a").await.unwrap().len(), 2);
    assert_eq!(store.list_logs(2, "a").await.unwrap().len(), 0);
    assert_eq!(store.logs().len(), 3);
  }

  #[tokio::test]
  async fn test_kv_scoped_by_runnable() {
    let store = MemoryStore::new();
    store.set_data(1, "k", "\"one\"").await.unwrap();
    assert_eq!(store.get_data(1, "k").await.unwrap().as_deref(), Some("\"one\""));
    assert_eq!(store.get_data(2, "k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_revoked_session_is_not_found() {
    let store = MemoryStore::new();
    let mut session = Session {
      sid: "abc".to_string(),
      uid: 1,
      created_at: chrono::Utc::now(),
      revoked: false,
      can_access_web: true,
      can_access_sys_api: false,
      authed_via: "PASS".to_string(),
    };
    store.save_session(&session).await.unwrap();
    assert_eq!(store.get_session("abc").await.unwrap().uid, 1);

    session.revoked = true;
    store.save_session(&session).await.unwrap();
    assert!(matches!(store.get_session("abc").await, Err(Error::NotFound(_))));
    assert!(matches!(store.get_session("nope").await, Err(Error::NotFound(_))));
  }
}
