mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{Recorder, trigger};
use nexus_host_fs::{FileSource, LocalFileSource};
use nexus_store::TriggerKind;
use nexus_trigger::pubsub::{
  CredentialLoader, FileCredentialLoader, ServiceAccountKey, ServiceAccountTokenSource, SharedCredentials,
  StaticTokenSource, TokenSource,
};
use nexus_trigger::{PubsubConfig, PubsubTriggers, TriggerError, TriggerHandler};
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SUBSCRIPTION: &str = "/v1/projects/acme/subscriptions/nexus-10-deploys";
const SERVICE_ACCOUNT: &str = include_str!("fixtures/service_account.json");

fn pubsub_trigger() -> nexus_store::Trigger {
  trigger(1, 10, TriggerKind::Pubsub, "projects/acme/topics/deploys")
}

fn handler(starter: Arc<Recorder>, server: &MockServer) -> PubsubTriggers {
  let tokens: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new("test-token"));
  PubsubTriggers::new(
    starter,
    Arc::new(SharedCredentials(tokens)),
    reqwest::Client::new(),
    PubsubConfig {
      api_base: server.uri(),
      backoff: Duration::from_millis(50),
    },
  )
}

fn received(ack_id: &str, data: &str) -> serde_json::Value {
  json!({
    "receivedMessages": [{
      "ackId": ack_id,
      "message": {
        "data": STANDARD.encode(data),
        "attributes": { "env": "prod" },
        "messageId": "m-1",
        "publishTime": "2024-05-01T10:00:00Z"
      }
    }]
  })
}

/// Answers further pulls with an empty batch after a short wait.
async fn idle_pulls(server: &MockServer) {
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:pull")))
    .respond_with(
      ResponseTemplate::new(200)
        .set_body_json(json!({}))
        .set_delay(Duration::from_millis(100)),
    )
    .with_priority(10)
    .mount(server)
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_message_starts_run_and_acknowledges() {
  let server = MockServer::start().await;
  Mock::given(method("PUT"))
    .and(path(SUBSCRIPTION))
    .and(header("authorization", "Bearer test-token"))
    .and(body_json(json!({ "topic": "projects/acme/topics/deploys" })))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
    .expect(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:pull")))
    .and(body_json(json!({ "returnImmediately": false, "maxMessages": 5 })))
    .respond_with(ResponseTemplate::new(200).set_body_json(received("ack-1", "deploy v2")))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&server)
    .await;
  idle_pulls(&server).await;
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:acknowledge")))
    .and(body_json(json!({ "ackIds": ["ack-1"] })))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
    .expect(1)
    .mount(&server)
    .await;

  let script = r#"
    local ok = pubsub.acknowledge()
    return table.concat({
      pubsub.message.data,
      pubsub.message.attributes.env,
      pubsub.message.messageId,
      pubsub.topic,
      pubsub.topic_spec,
      tostring(ok),
    }, "|")
  "#;
  let starter = Recorder::running(&[(10, script)]).await;
  let pubsub = handler(starter.clone(), &server);
  pubsub.register(&pubsub_trigger()).await.unwrap();

  let outcomes = starter.wait_for_outcomes(1, Duration::from_secs(5)).await;
  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].error, None);
  assert_eq!(
    outcomes[0].value,
    "deploy v2|prod|m-1|deploys|projects/acme/topics/deploys|true"
  );

  let starts = starter.starts();
  assert_eq!(starts[0].context.kind, TriggerKind::Pubsub);
  assert_eq!(starts[0].seeds, vec!["pubsub".to_string()]);

  pubsub.delete(10).await.unwrap();
  assert!(pubsub.subscriptions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_existing_subscription_is_tolerated() {
  let server = MockServer::start().await;
  Mock::given(method("PUT"))
    .and(path(SUBSCRIPTION))
    .respond_with(ResponseTemplate::new(409).set_body_string("already exists"))
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:pull")))
    .respond_with(ResponseTemplate::new(200).set_body_json(received("ack-2", "hello")))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&server)
    .await;
  idle_pulls(&server).await;

  let starter = Recorder::accepting();
  let pubsub = handler(starter.clone(), &server);
  pubsub.register(&pubsub_trigger()).await.unwrap();

  let starts = starter.wait_for_starts(1, Duration::from_secs(5)).await;
  pubsub.shutdown();
  assert_eq!(starts.len(), 1);
  assert_eq!(starts[0].runnable_uid, 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pull_errors_are_retried() {
  let server = MockServer::start().await;
  Mock::given(method("PUT"))
    .and(path(SUBSCRIPTION))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:pull")))
    .respond_with(ResponseTemplate::new(503))
    .up_to_n_times(2)
    .with_priority(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path(format!("{SUBSCRIPTION}:pull")))
    .respond_with(ResponseTemplate::new(200).set_body_json(received("ack-3", "after retry")))
    .up_to_n_times(1)
    .with_priority(2)
    .mount(&server)
    .await;
  idle_pulls(&server).await;

  let starter = Recorder::accepting();
  let pubsub = handler(starter.clone(), &server);
  pubsub.register(&pubsub_trigger()).await.unwrap();

  let starts = starter.wait_for_starts(1, Duration::from_secs(5)).await;
  pubsub.shutdown();
  assert_eq!(starts.len(), 1);
}

#[tokio::test]
async fn test_invalid_topic_is_rejected() {
  let server = MockServer::start().await;
  let pubsub = handler(Recorder::accepting(), &server);

  let err = pubsub
    .register(&trigger(1, 10, TriggerKind::Pubsub, "deploys"))
    .await
    .unwrap_err();
  assert!(matches!(err, TriggerError::InvalidConfig { trigger_uid: 1, .. }));
  assert!(pubsub.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_and_idempotent_delete() {
  let server = MockServer::start().await;
  idle_pulls(&server).await;
  let pubsub = handler(Recorder::accepting(), &server);

  pubsub.register(&pubsub_trigger()).await.unwrap();
  assert!(matches!(
    pubsub.register(&pubsub_trigger()).await,
    Err(TriggerError::AlreadyRegistered { trigger_uid: 1 })
  ));
  assert_eq!(
    pubsub.subscriptions().await.get(&1).map(String::as_str),
    Some("projects/acme/subscriptions/nexus-10-deploys")
  );

  pubsub.delete(10).await.unwrap();
  pubsub.delete(10).await.unwrap();
  pubsub.delete(77).await.unwrap();
  assert!(pubsub.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_missing_credentials_abort_registration() {
  let dir = tempfile::tempdir().unwrap();
  let files: Arc<dyn FileSource> = Arc::new(LocalFileSource::new(dir.path()));
  let pubsub = PubsubTriggers::new(
    Recorder::accepting(),
    Arc::new(FileCredentialLoader::new(files, reqwest::Client::new())),
    reqwest::Client::new(),
    PubsubConfig::default(),
  );

  let mut t = pubsub_trigger();
  t.val2 = "keys/missing.json".to_string();
  let err = pubsub.register(&t).await.unwrap_err();
  assert!(matches!(err, TriggerError::Credentials { trigger_uid: 1, .. }));
  assert!(pubsub.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_file_credentials_are_read_as_owner() {
  let dir = tempfile::tempdir().unwrap();
  let files = Arc::new(LocalFileSource::new(dir.path()));
  files
    .write(1, "keys/gcp.json", SERVICE_ACCOUNT.as_bytes())
    .await
    .unwrap();

  let loader = FileCredentialLoader::new(files.clone(), reqwest::Client::new());
  let mut t = pubsub_trigger();
  t.val2 = "keys/gcp.json".to_string();
  assert!(loader.load(&t).await.is_ok());

  t.owner_uid = 2;
  assert!(loader.load(&t).await.is_err());
}

#[tokio::test]
async fn test_service_account_token_is_exchanged_once() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/token"))
    .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
    .and(body_string_contains("assertion="))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "access_token": "ya29.test",
      "expires_in": 3600,
      "token_type": "Bearer"
    })))
    .expect(1)
    .mount(&server)
    .await;

  let mut key = ServiceAccountKey::from_json(SERVICE_ACCOUNT.as_bytes()).unwrap();
  assert_eq!(key.client_email, "nexus@nexus-test.iam.gserviceaccount.com");
  key.token_uri = format!("{}/token", server.uri());

  let source = ServiceAccountTokenSource::new(key, reqwest::Client::new()).unwrap();
  assert_eq!(source.token().await.unwrap(), "ya29.test");
  assert_eq!(source.token().await.unwrap(), "ya29.test");
}

#[tokio::test]
async fn test_rejected_token_exchange_is_an_error() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/token"))
    .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
    .mount(&server)
    .await;

  let mut key = ServiceAccountKey::from_json(SERVICE_ACCOUNT.as_bytes()).unwrap();
  key.token_uri = format!("{}/token", server.uri());
  let source = ServiceAccountTokenSource::new(key, reqwest::Client::new()).unwrap();

  let err = source.token().await.unwrap_err();
  assert!(err.to_string().contains("400"));
  assert!(!err.is_transient());
}

#[test]
fn test_bad_private_key_is_rejected() {
  let mut key = ServiceAccountKey::from_json(SERVICE_ACCOUNT.as_bytes()).unwrap();
  key.private_key = "not a key".to_string();
  assert!(ServiceAccountTokenSource::new(key, reqwest::Client::new()).is_err());
}
