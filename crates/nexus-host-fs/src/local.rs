use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{FileEntry, FileSource, FsError, ItemKind};

/// [`FileSource`] rooted at a local directory, one subdirectory per owner.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
  root: PathBuf,
}

impl LocalFileSource {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Map a script path onto the owner's directory, refusing anything that
  /// could leave it.
  fn resolve(&self, owner_uid: i64, path: &str) -> Result<PathBuf, FsError> {
    let mut resolved = self.root.join(owner_uid.to_string());
    for component in Path::new(path.trim_start_matches('/')).components() {
      match component {
        Component::Normal(part) => resolved.push(part),
        Component::CurDir => {}
        _ => {
          return Err(FsError::InvalidPath {
            path: path.to_string(),
          });
        }
      }
    }
    Ok(resolved)
  }
}

fn io_error(path: &str, source: std::io::Error) -> FsError {
  if source.kind() == ErrorKind::NotFound {
    FsError::NotFound {
      path: path.to_string(),
    }
  } else {
    FsError::Io {
      path: path.to_string(),
      source,
    }
  }
}

#[async_trait]
impl FileSource for LocalFileSource {
  async fn read(&self, owner_uid: i64, path: &str) -> Result<Vec<u8>, FsError> {
    let target = self.resolve(owner_uid, path)?;
    tokio::fs::read(&target).await.map_err(|e| io_error(path, e))
  }

  async fn write(&self, owner_uid: i64, path: &str, data: &[u8]) -> Result<(), FsError> {
    let target = self.resolve(owner_uid, path)?;
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(path, e))?;
    }
    tokio::fs::write(&target, data)
      .await
      .map_err(|e| io_error(path, e))
  }

  async fn delete(&self, owner_uid: i64, path: &str) -> Result<(), FsError> {
    let target = self.resolve(owner_uid, path)?;
    let metadata = tokio::fs::metadata(&target)
      .await
      .map_err(|e| io_error(path, e))?;
    let result = if metadata.is_dir() {
      tokio::fs::remove_dir(&target).await
    } else {
      tokio::fs::remove_file(&target).await
    };
    result.map_err(|e| io_error(path, e))
  }

  async fn list(&self, owner_uid: i64, path: &str) -> Result<Vec<FileEntry>, FsError> {
    let target = self.resolve(owner_uid, path)?;
    let mut dir = match tokio::fs::read_dir(&target).await {
      Ok(dir) => dir,
      // An owner who never wrote anything has an empty root.
      Err(e) if e.kind() == ErrorKind::NotFound && path.trim_matches('/').is_empty() => {
        return Ok(Vec::new());
      }
      Err(e) => return Err(io_error(path, e)),
    };

    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
      let metadata = entry.metadata().await.map_err(|e| io_error(path, e))?;
      let kind = if metadata.is_dir() {
        ItemKind::Directory
      } else if metadata.is_file() {
        ItemKind::File
      } else {
        ItemKind::Unknown
      };
      entries.push(FileEntry {
        name: entry.file_name().to_string_lossy().into_owned(),
        kind,
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
      });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
  }
}
