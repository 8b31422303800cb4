use thiserror::Error;

/// Error kind tags carried by [`HostError`].
pub mod kind {
  pub const API: &str = "api-error";
  pub const INTERNAL: &str = "internal-error";
  pub const KV: &str = "kv";
  pub const FS: &str = "fs";
  pub const DATASTORE: &str = "datastore";
  pub const EMAIL: &str = "email";
  pub const WEB: &str = "web";
  pub const PUBSUB: &str = "pubsub-error";
}

/// Error raised into the script by a failing host call.
///
/// Scripts see it as a Lua error whose string form is `"<kind>: <message>"`
/// and can catch it with `pcall`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
  pub kind: String,
  pub message: String,
}

impl HostError {
  pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      message: message.into(),
    }
  }

  /// Misuse of a host API (wrong arguments, missing callbacks).
  pub fn api(message: impl Into<String>) -> Self {
    Self::new(kind::API, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(kind::INTERNAL, message)
  }
}

impl From<HostError> for mlua::Error {
  fn from(err: HostError) -> Self {
    mlua::Error::external(err)
  }
}

/// Errors that can occur while binding capabilities into a sandbox.
#[derive(Debug, Error)]
pub enum CapabilityError {
  /// A capability failed to install itself.
  #[error("failed to bind capability {name}: {source}")]
  Bind {
    name: String,
    #[source]
    source: mlua::Error,
  },

  /// A collaborator needed by a capability is unavailable.
  #[error("capability {name} unavailable: {message}")]
  Unavailable { name: String, message: String },

  #[error("sandbox error: {0}")]
  Lua(#[from] mlua::Error),
}

impl CapabilityError {
  pub fn unavailable(name: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Unavailable {
      name: name.into(),
      message: message.into(),
    }
  }
}

/// Failure of a script run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
  /// The script did not compile.
  #[error("syntax error: {message}")]
  Syntax { message: String },

  /// The script raised an error, or a host call failed and it was not caught.
  #[error("{message}")]
  Runtime { message: String },

  /// The thread executing the script panicked.
  #[error("Internal Panic! :: {message}")]
  Panic { message: String },
}

impl From<mlua::Error> for ScriptError {
  fn from(err: mlua::Error) -> Self {
    match err {
      mlua::Error::SyntaxError { message, .. } => ScriptError::Syntax { message },
      other => ScriptError::Runtime {
        message: root_message(&other),
      },
    }
  }
}

/// Strip callback wrappers so host errors surface as `"<kind>: <message>"`.
fn root_message(err: &mlua::Error) -> String {
  match err {
    mlua::Error::CallbackError { cause, .. } => root_message(cause),
    mlua::Error::WithContext { cause, .. } => root_message(cause),
    mlua::Error::RuntimeError(message) => message.clone(),
    other => other.to_string(),
  }
}
