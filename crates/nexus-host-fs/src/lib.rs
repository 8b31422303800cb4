//! File capability and the [`FileSource`] collaborator.
//!
//! Every path is resolved relative to the owning user's root; scripts can never
//! see another user's files. Trigger handlers use the same source to read
//! credential files on behalf of a trigger's owner.

mod capability;
mod local;

pub use capability::FsCapability;
pub use local::LocalFileSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Errors returned by a [`FileSource`].
#[derive(Debug, thiserror::Error)]
pub enum FsError {
  #[error("file not found: {path}")]
  NotFound { path: String },

  /// The path escapes the owner's root or is otherwise unusable.
  #[error("invalid path: {path}")]
  InvalidPath { path: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Kind of a listed item, numbered as scripts see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ItemKind {
  Unknown = -1,
  File = 2,
  Directory = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
  pub name: String,
  pub kind: ItemKind,
  pub size: u64,
  pub modified: Option<DateTime<Utc>>,
}

/// Owner-scoped file storage.
#[async_trait]
pub trait FileSource: Send + Sync {
  async fn read(&self, owner_uid: i64, path: &str) -> Result<Vec<u8>, FsError>;

  /// Create or replace a file, creating parent directories.
  async fn write(&self, owner_uid: i64, path: &str, data: &[u8]) -> Result<(), FsError>;

  async fn delete(&self, owner_uid: i64, path: &str) -> Result<(), FsError>;

  /// List a directory, sorted by name.
  async fn list(&self, owner_uid: i64, path: &str) -> Result<Vec<FileEntry>, FsError>;
}
