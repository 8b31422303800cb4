use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::PubsubError;
use super::auth::TokenSource;

pub const DEFAULT_API_BASE: &str = "https://pubsub.googleapis.com";

/// Messages requested per pull.
pub const MAX_MESSAGES: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
  /// Base64-encoded payload.
  #[serde(default)]
  pub data: String,
  #[serde(default)]
  pub attributes: BTreeMap<String, String>,
  #[serde(default)]
  pub message_id: String,
  #[serde(default)]
  pub publish_time: String,
}

impl PubsubMessage {
  pub fn decoded_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(self.data.as_bytes())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
  pub ack_id: String,
  pub message: PubsubMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
  #[serde(default)]
  received_messages: Vec<ReceivedMessage>,
}

/// Minimal Pub/Sub REST client: create subscription, pull, acknowledge.
pub struct PubsubClient {
  http: Client,
  base: String,
  tokens: Arc<dyn TokenSource>,
}

impl PubsubClient {
  pub fn new(http: Client, base: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
    let base = base.into().trim_end_matches('/').to_string();
    Self { http, base, tokens }
  }

  fn url(&self, subscription: &str, verb: Option<&str>) -> String {
    match verb {
      Some(verb) => format!("{}/v1/{subscription}:{verb}", self.base),
      None => format!("{}/v1/{subscription}", self.base),
    }
  }

  /// Create `subscription` on `topic`. An existing subscription is fine.
  pub async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), PubsubError> {
    let token = self.tokens.token().await?;
    let response = self
      .http
      .put(self.url(subscription, None))
      .bearer_auth(token)
      .json(&json!({ "topic": topic }))
      .send()
      .await?;

    match response.status() {
      StatusCode::CONFLICT => {
        debug!(subscription, "pubsub_subscription_exists");
        Ok(())
      }
      status if status.is_success() => Ok(()),
      status => Err(PubsubError::Status {
        operation: "create subscription",
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
      }),
    }
  }

  /// Long-poll for the next batch of messages.
  pub async fn pull(&self, subscription: &str) -> Result<Vec<ReceivedMessage>, PubsubError> {
    let token = self.tokens.token().await?;
    let response = self
      .http
      .post(self.url(subscription, Some("pull")))
      .bearer_auth(token)
      .json(&json!({ "returnImmediately": false, "maxMessages": MAX_MESSAGES }))
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(PubsubError::Status {
        operation: "pull",
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
      });
    }
    let pulled: PullResponse = response.json().await?;
    Ok(pulled.received_messages)
  }

  /// Acknowledge messages. Returns whether the service answered 200.
  pub async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<bool, PubsubError> {
    let token = self.tokens.token().await?;
    let response = self
      .http
      .post(self.url(subscription, Some("acknowledge")))
      .bearer_auth(token)
      .json(&json!({ "ackIds": ack_ids }))
      .send()
      .await?;
    Ok(response.status() == StatusCode::OK)
  }
}
