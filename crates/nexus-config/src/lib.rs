//! Nexus Config
//!
//! Daemon configuration loaded from a TOML file. Every section and field has a
//! default, so an empty file (or no file at all) yields a working setup:
//!
//! ```toml
//! [server]
//! listen_addr = "127.0.0.1:8080"
//!
//! [storage]
//! data_dir = "/var/lib/nexus"
//!
//! [cron]
//! tick_secs = 6
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file at {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file at {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid value for {field}: {message}")]
  Invalid { field: String, message: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerSection,
  pub storage: StorageSection,
  pub runs: RunsSection,
  pub cron: CronSection,
  pub web: WebSection,
  pub pubsub: PubsubSection,
  pub http: HttpSection,
}

impl Config {
  /// Parse configuration from TOML text.
  pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
    Self::parse(text, "<inline>")
  }

  /// Load and validate a configuration file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: display.clone(),
      source,
    })?;
    Self::parse(&text, &display)
  }

  /// Load `path` if given, otherwise the per-user config file if it exists,
  /// otherwise the defaults.
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = path {
      return Self::load(path);
    }
    match default_config_path() {
      Some(path) if path.exists() => Self::load(&path),
      _ => Ok(Self::default()),
    }
  }

  fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
      path: path.to_string(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self.server.listen_addr()?;
    if self.cron.tick_secs == 0 {
      return Err(invalid("cron.tick_secs", "must be at least 1"));
    }
    if self.web.timeout_secs == 0 {
      return Err(invalid("web.timeout_secs", "must be at least 1"));
    }
    if self.runs.reap_interval_secs == 0 {
      return Err(invalid("runs.reap_interval_secs", "must be at least 1"));
    }
    if !self.pubsub.api_base.starts_with("http://") && !self.pubsub.api_base.starts_with("https://") {
      return Err(invalid("pubsub.api_base", "must be an http(s) URL"));
    }
    Ok(())
  }
}

fn invalid(field: &str, message: &str) -> ConfigError {
  ConfigError::Invalid {
    field: field.to_string(),
    message: message.to_string(),
  }
}

/// `<config dir>/nexus/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|d| d.join("nexus").join(CONFIG_FILE))
}

fn default_data_dir() -> PathBuf {
  dirs::data_dir()
    .map(|d| d.join("nexus"))
    .unwrap_or_else(|| PathBuf::from("nexus-data"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
  /// Address the web trigger endpoint listens on.
  pub listen_addr: String,
}

impl Default for ServerSection {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
    }
  }
}

impl ServerSection {
  pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
    self
      .listen_addr
      .parse()
      .map_err(|e: std::net::AddrParseError| invalid("server.listen_addr", &e.to_string()))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
  /// SQLite URL. Defaults to `nexus.db` inside `data_dir`.
  pub database_url: Option<String>,
  pub data_dir: PathBuf,
  /// Root of the per-owner file area. Defaults to `files` inside `data_dir`.
  pub files_dir: Option<PathBuf>,
}

impl Default for StorageSection {
  fn default() -> Self {
    Self {
      database_url: None,
      data_dir: default_data_dir(),
      files_dir: None,
    }
  }
}

impl StorageSection {
  pub fn database_url(&self) -> String {
    match &self.database_url {
      Some(url) => url.clone(),
      None => format!("sqlite://{}", self.data_dir.join("nexus.db").display()),
    }
  }

  pub fn files_dir(&self) -> PathBuf {
    self
      .files_dir
      .clone()
      .unwrap_or_else(|| self.data_dir.join("files"))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsSection {
  /// How long finished runs stay queryable.
  pub retention_secs: u64,
  pub reap_interval_secs: u64,
}

impl Default for RunsSection {
  fn default() -> Self {
    Self {
      retention_secs: 3600,
      reap_interval_secs: 60,
    }
  }
}

impl RunsSection {
  pub fn retention(&self) -> Duration {
    Duration::from_secs(self.retention_secs)
  }

  pub fn reap_interval(&self) -> Duration {
    Duration::from_secs(self.reap_interval_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSection {
  pub tick_secs: u64,
}

impl Default for CronSection {
  fn default() -> Self {
    Self { tick_secs: 6 }
  }
}

impl CronSection {
  pub fn tick(&self) -> Duration {
    Duration::from_secs(self.tick_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSection {
  /// How long an inbound request waits for the script's `done()`.
  pub timeout_secs: u64,
}

impl Default for WebSection {
  fn default() -> Self {
    Self { timeout_secs: 25 }
  }
}

impl WebSection {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubSection {
  pub api_base: String,
  pub backoff_secs: u64,
}

impl Default for PubsubSection {
  fn default() -> Self {
    Self {
      api_base: "https://pubsub.googleapis.com".to_string(),
      backoff_secs: 8,
    }
  }
}

impl PubsubSection {
  pub fn backoff(&self) -> Duration {
    Duration::from_secs(self.backoff_secs)
  }
}

/// Outbound HTTP used by the `web` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
  pub timeout_secs: u64,
}

impl Default for HttpSection {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl HttpSection {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.cron.tick(), Duration::from_secs(6));
    assert_eq!(config.web.timeout(), Duration::from_secs(25));
    assert_eq!(config.pubsub.backoff(), Duration::from_secs(8));
    assert_eq!(config.runs.retention(), Duration::from_secs(3600));
    assert_eq!(
      config.server.listen_addr().unwrap(),
      "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
    );
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::from_toml(
      r#"
        [storage]
        data_dir = "/srv/nexus"

        [web]
        timeout_secs = 5
      "#,
    )
    .unwrap();

    assert_eq!(config.web.timeout_secs, 5);
    assert_eq!(config.cron.tick_secs, 6);
    assert_eq!(config.storage.database_url(), "sqlite:///srv/nexus/nexus.db");
    assert_eq!(config.storage.files_dir(), PathBuf::from("/srv/nexus/files"));
  }

  #[test]
  fn test_explicit_database_url_wins() {
    let config = Config::from_toml("[storage]\ndatabase_url = \"sqlite::memory:\"").unwrap();
    assert_eq!(config.storage.database_url(), "sqlite::memory:");
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    let err = Config::from_toml("[server]\nlisten_addr = \"nowhere\"").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "server.listen_addr"));

    let err = Config::from_toml("[cron]\ntick_secs = 0").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "cron.tick_secs"));

    let err = Config::from_toml("[pubsub]\napi_base = \"pubsub.local\"").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
  }

  #[test]
  fn test_parse_error_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE);
    std::fs::write(&path, "[cron\n").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains(CONFIG_FILE));
  }

  #[test]
  fn test_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }
}
