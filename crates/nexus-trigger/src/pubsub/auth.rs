use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use nexus_host_fs::FileSource;
use nexus_store::Trigger;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::PubsubError;

pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens this close to expiry are refreshed.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Supplies OAuth2 bearer tokens for API calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
  async fn token(&self) -> Result<String, PubsubError>;
}

/// A fixed token, for emulators and tests.
pub struct StaticTokenSource(String);

impl StaticTokenSource {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
  async fn token(&self) -> Result<String, PubsubError> {
    Ok(self.0.clone())
  }
}

fn default_token_uri() -> String {
  DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service-account JSON key that token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
  pub client_email: String,
  pub private_key: String,
  #[serde(default)]
  pub private_key_id: Option<String>,
  #[serde(default = "default_token_uri")]
  pub token_uri: String,
  #[serde(default)]
  pub project_id: Option<String>,
}

impl ServiceAccountKey {
  pub fn from_json(bytes: &[u8]) -> Result<Self, PubsubError> {
    serde_json::from_slice(bytes).map_err(|e| PubsubError::Credentials {
      message: format!("invalid service account key: {e}"),
    })
  }
}

#[derive(Serialize)]
struct Claims<'a> {
  iss: &'a str,
  scope: &'a str,
  aud: &'a str,
  iat: i64,
  exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
  access_token: String,
  #[serde(default = "default_expires_in")]
  expires_in: u64,
}

fn default_expires_in() -> u64 {
  ASSERTION_LIFETIME_SECS as u64
}

struct CachedToken {
  value: String,
  expires_at: Instant,
}

/// Exchanges a signed service-account assertion for access tokens and caches
/// them until shortly before they expire.
pub struct ServiceAccountTokenSource {
  key: ServiceAccountKey,
  signing_key: EncodingKey,
  http: Client,
  cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
  /// Fails if the key's PEM cannot be used for RS256 signing.
  pub fn new(key: ServiceAccountKey, http: Client) -> Result<Self, PubsubError> {
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
    Ok(Self {
      key,
      signing_key,
      http,
      cached: Mutex::new(None),
    })
  }

  fn assertion(&self) -> Result<String, PubsubError> {
    let iat = Utc::now().timestamp();
    let claims = Claims {
      iss: &self.key.client_email,
      scope: PUBSUB_SCOPE,
      aud: &self.key.token_uri,
      iat,
      exp: iat + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = self.key.private_key_id.clone();
    Ok(jsonwebtoken::encode(&header, &claims, &self.signing_key)?)
  }

  async fn exchange(&self) -> Result<CachedToken, PubsubError> {
    let assertion = self.assertion()?;
    let response = self
      .http
      .post(&self.key.token_uri)
      .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(PubsubError::Status {
        operation: "token exchange",
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
      });
    }
    let token: TokenResponse = response.json().await?;
    debug!(client_email = %self.key.client_email, expires_in = token.expires_in, "pubsub_token_refreshed");
    Ok(CachedToken {
      value: token.access_token,
      expires_at: Instant::now() + Duration::from_secs(token.expires_in),
    })
  }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
  async fn token(&self) -> Result<String, PubsubError> {
    let mut cached = self.cached.lock().await;
    if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now() + EXPIRY_MARGIN) {
      return Ok(token.value.clone());
    }
    let fresh = self.exchange().await?;
    let value = fresh.value.clone();
    *cached = Some(fresh);
    Ok(value)
  }
}

/// Produces the token source a Pub/Sub trigger authenticates with.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
  async fn load(&self, trigger: &Trigger) -> Result<Arc<dyn TokenSource>, PubsubError>;
}

/// Reads the service-account key named by the trigger's `val2` from the
/// owner's files.
pub struct FileCredentialLoader {
  files: Arc<dyn FileSource>,
  http: Client,
}

impl FileCredentialLoader {
  pub fn new(files: Arc<dyn FileSource>, http: Client) -> Self {
    Self { files, http }
  }
}

#[async_trait]
impl CredentialLoader for FileCredentialLoader {
  async fn load(&self, trigger: &Trigger) -> Result<Arc<dyn TokenSource>, PubsubError> {
    let path = trigger.val2.trim();
    if path.is_empty() {
      return Err(PubsubError::Credentials {
        message: "no credentials file configured".to_string(),
      });
    }
    let bytes = self
      .files
      .read(trigger.owner_uid, path)
      .await
      .map_err(|source| PubsubError::CredentialFile {
        path: path.to_string(),
        source,
      })?;
    let key = ServiceAccountKey::from_json(&bytes)?;
    Ok(Arc::new(ServiceAccountTokenSource::new(key, self.http.clone())?))
  }
}

/// Hands every trigger the same token source.
pub struct SharedCredentials(pub Arc<dyn TokenSource>);

#[async_trait]
impl CredentialLoader for SharedCredentials {
  async fn load(&self, _trigger: &Trigger) -> Result<Arc<dyn TokenSource>, PubsubError> {
    Ok(self.0.clone())
  }
}
