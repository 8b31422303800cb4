use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::FromRow;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{
  Error, KvStore, LogRecord, LogStore, Runnable, RunnableStore, Session, SessionStore, Trigger, User,
  UserDirectory,
};

#[derive(FromRow)]
struct RunnableRow {
  uid: i64,
  owner_uid: i64,
  name: String,
  content: String,
}

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  async fn triggers_of(&self, parent_uid: i64) -> Result<Vec<Trigger>, Error> {
    let triggers = sqlx::query_as(
      r#"
      SELECT uid, parent_uid, owner_uid, name, kind, val1, val2, val3
      FROM integration_trigger
      WHERE parent_uid = ?
      ORDER BY uid ASC
      "#,
    )
    .bind(parent_uid)
    .fetch_all(&self.pool)
    .await?;
    Ok(triggers)
  }
}

#[async_trait]
impl RunnableStore for SqliteStore {
  async fn get_runnable(&self, uid: i64) -> Result<Runnable, Error> {
    let row: Option<RunnableRow> = sqlx::query_as(
      r#"
      SELECT uid, owner_uid, name, content
      FROM integration_runnable
      WHERE uid = ?
      "#,
    )
    .bind(uid)
    .fetch_optional(&self.pool)
    .await?;

    let row = row.ok_or_else(|| Error::NotFound(format!("runnable {uid}")))?;
    let triggers = self.triggers_of(row.uid).await?;
    Ok(Runnable {
      uid: row.uid,
      owner_uid: row.owner_uid,
      name: row.name,
      content: row.content,
      triggers,
    })
  }

  async fn list_triggers(&self) -> Result<Vec<Trigger>, Error> {
    let triggers = sqlx::query_as(
      r#"
      SELECT uid, parent_uid, owner_uid, name, kind, val1, val2, val3
      FROM integration_trigger
      ORDER BY uid ASC
      "#,
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(triggers)
  }

  async fn save_runnable(&self, runnable: &Runnable) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      INSERT INTO integration_runnable (uid, owner_uid, name, content)
      VALUES (?, ?, ?, ?)
      ON CONFLICT(uid) DO UPDATE SET
        owner_uid = excluded.owner_uid,
        name = excluded.name,
        content = excluded.content
      "#,
    )
    .bind(runnable.uid)
    .bind(runnable.owner_uid)
    .bind(&runnable.name)
    .bind(&runnable.content)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM integration_trigger WHERE parent_uid = ?")
      .bind(runnable.uid)
      .execute(&mut *tx)
      .await?;

    for trigger in &runnable.triggers {
      sqlx::query(
        r#"
        INSERT INTO integration_trigger (uid, parent_uid, owner_uid, name, kind, val1, val2, val3)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
      )
      .bind(trigger.uid)
      .bind(runnable.uid)
      .bind(trigger.owner_uid)
      .bind(&trigger.name)
      .bind(trigger.kind)
      .bind(&trigger.val1)
      .bind(&trigger.val2)
      .bind(&trigger.val3)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }
}

#[async_trait]
impl UserDirectory for SqliteStore {
  async fn get_user(&self, uid: i64) -> Result<User, Error> {
    let user: Option<User> = sqlx::query_as(
      r#"
      SELECT uid, username, display_name, admin, created_at
      FROM users
      WHERE uid = ?
      "#,
    )
    .bind(uid)
    .fetch_optional(&self.pool)
    .await?;
    user.ok_or_else(|| Error::NotFound(format!("user {uid}")))
  }

  async fn save_user(&self, user: &User) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO users (uid, username, display_name, admin, created_at)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT(uid) DO UPDATE SET
        username = excluded.username,
        display_name = excluded.display_name,
        admin = excluded.admin
      "#,
    )
    .bind(user.uid)
    .bind(&user.username)
    .bind(&user.display_name)
    .bind(user.admin)
    .bind(user.created_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

#[async_trait]
impl SessionStore for SqliteStore {
  async fn get_session(&self, sid: &str) -> Result<Session, Error> {
    let session: Option<Session> = sqlx::query_as(
      r#"
      SELECT sid, uid, created_at, revoked, can_access_web, can_access_sys_api, authed_via
      FROM sessions
      WHERE sid = ? AND revoked = 0
      "#,
    )
    .bind(sid)
    .fetch_optional(&self.pool)
    .await?;
    session.ok_or_else(|| Error::NotFound("session".to_string()))
  }

  async fn save_session(&self, session: &Session) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO sessions (sid, uid, created_at, revoked, can_access_web, can_access_sys_api, authed_via)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT(sid) DO UPDATE SET
        uid = excluded.uid,
        revoked = excluded.revoked,
        can_access_web = excluded.can_access_web,
        can_access_sys_api = excluded.can_access_sys_api,
        authed_via = excluded.authed_via
      "#,
    )
    .bind(&session.sid)
    .bind(session.uid)
    .bind(session.created_at)
    .bind(session.revoked)
    .bind(session.can_access_web)
    .bind(session.can_access_sys_api)
    .bind(&session.authed_via)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

#[async_trait]
impl LogStore for SqliteStore {
  async fn write_log(&self, record: &LogRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO integration_log (parent_uid, run_id, created_at, kind, level, datatype, value)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(record.parent_uid)
    .bind(&record.run_id)
    .bind(record.created_at)
    .bind(record.kind)
    .bind(record.level)
    .bind(record.datatype)
    .bind(&record.value)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn list_logs(&self, parent_uid: i64, run_id: &str) -> Result<Vec<LogRecord>, Error> {
    let records = sqlx::query_as(
      r#"
      SELECT parent_uid, run_id, created_at, kind, level, datatype, value
      FROM integration_log
      WHERE parent_uid = ? AND run_id = ?
      ORDER BY rowid ASC
      "#,
    )
    .bind(parent_uid)
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(records)
  }
}

#[async_trait]
impl KvStore for SqliteStore {
  async fn get_data(&self, runnable_uid: i64, key: &str) -> Result<Option<String>, Error> {
    let value: Option<(String,)> = sqlx::query_as(
      "SELECT value FROM integration_stddata WHERE integration_parent = ? AND key = ?",
    )
    .bind(runnable_uid)
    .bind(key)
    .fetch_optional(&self.pool)
    .await?;
    Ok(value.map(|(v,)| v))
  }

  async fn set_data(&self, runnable_uid: i64, key: &str, value: &str) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO integration_stddata (integration_parent, key, value, modified_at)
      VALUES (?, ?, ?, ?)
      ON CONFLICT(integration_parent, key) DO UPDATE SET
        value = excluded.value,
        modified_at = excluded.modified_at
      "#,
    )
    .bind(runnable_uid)
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}
