//! Pub/Sub triggers.
//!
//! `val1` names the topic (`projects/<p>/topics/<t>`) and `val2` the
//! service-account key file, read as the trigger's owner. Each trigger owns a
//! subscription `projects/<p>/subscriptions/nexus-<runnable>-<t>` and two
//! tasks: a long-poll loop feeding a small channel, and a dispatch loop that
//! starts one run per message.

mod auth;
mod client;

pub use auth::{
  CredentialLoader, DEFAULT_TOKEN_URI, FileCredentialLoader, PUBSUB_SCOPE, ServiceAccountKey,
  ServiceAccountTokenSource, SharedCredentials, StaticTokenSource, TokenSource,
};
pub use client::{DEFAULT_API_BASE, MAX_MESSAGES, PubsubClient, PubsubMessage, ReceivedMessage};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, StartContext, kind};
use nexus_host_fs::FsError;
use nexus_runtime::RunStarter;
use nexus_store::{Trigger, TriggerKind};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TriggerError;
use crate::handler::TriggerHandler;

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(8);

/// Capacity of the channel between the poll and dispatch loops.
const DISPATCH_QUEUE: usize = 2;

#[derive(Debug, Error)]
pub enum PubsubError {
  #[error("invalid credentials: {message}")]
  Credentials { message: String },

  #[error("failed to read credentials file {path}: {source}")]
  CredentialFile {
    path: String,
    #[source]
    source: FsError,
  },

  #[error("failed to sign token request: {0}")]
  Jwt(#[from] jsonwebtoken::errors::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("{operation} returned {status}: {body}")]
  Status {
    operation: &'static str,
    status: u16,
    body: String,
  },
}

impl PubsubError {
  /// Network failures, throttling and server errors are worth retrying.
  pub fn is_transient(&self) -> bool {
    match self {
      PubsubError::Http(_) => true,
      PubsubError::Status { status, .. } => *status == 429 || *status >= 500,
      _ => false,
    }
  }
}

/// A parsed `projects/<project>/topics/<topic>` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicName {
  pub project: String,
  pub topic: String,
}

impl TopicName {
  pub fn parse(name: &str) -> Option<Self> {
    match name.trim().split('/').collect::<Vec<_>>().as_slice() {
      ["projects", project, "topics", topic] if !project.is_empty() && !topic.is_empty() => Some(Self {
        project: project.to_string(),
        topic: topic.to_string(),
      }),
      _ => None,
    }
  }

  /// Subscription owned by `runnable_uid` on this topic.
  pub fn subscription_for(&self, runnable_uid: i64) -> String {
    format!(
      "projects/{}/subscriptions/nexus-{runnable_uid}-{}",
      self.project, self.topic
    )
  }
}

#[derive(Debug, Clone)]
pub struct PubsubConfig {
  pub api_base: String,
  /// Delay before retrying a failed API call.
  pub backoff: Duration,
}

impl Default for PubsubConfig {
  fn default() -> Self {
    Self {
      api_base: DEFAULT_API_BASE.to_string(),
      backoff: DEFAULT_BACKOFF,
    }
  }
}

struct SubscriptionTask {
  parent_uid: i64,
  subscription: String,
  cancel: CancellationToken,
}

struct PubsubInner {
  starter: Arc<dyn RunStarter>,
  loader: Arc<dyn CredentialLoader>,
  http: Client,
  config: PubsubConfig,
  tasks: Mutex<HashMap<i64, SubscriptionTask>>,
  shutdown: CancellationToken,
}

/// Handler for [`TriggerKind::Pubsub`].
#[derive(Clone)]
pub struct PubsubTriggers {
  inner: Arc<PubsubInner>,
}

impl PubsubTriggers {
  pub fn new(
    starter: Arc<dyn RunStarter>,
    loader: Arc<dyn CredentialLoader>,
    http: Client,
    config: PubsubConfig,
  ) -> Self {
    Self {
      inner: Arc::new(PubsubInner {
        starter,
        loader,
        http,
        config,
        tasks: Mutex::new(HashMap::new()),
        shutdown: CancellationToken::new(),
      }),
    }
  }

  /// Subscription names of the registered triggers, keyed by trigger uid.
  pub async fn subscriptions(&self) -> BTreeMap<i64, String> {
    let tasks = self.inner.tasks.lock().await;
    tasks
      .iter()
      .map(|(uid, task)| (*uid, task.subscription.clone()))
      .collect()
  }
}

#[async_trait]
impl TriggerHandler for PubsubTriggers {
  fn kind(&self) -> TriggerKind {
    TriggerKind::Pubsub
  }

  async fn register(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    let mut tasks = self.inner.tasks.lock().await;
    if tasks.contains_key(&trigger.uid) {
      return Err(TriggerError::AlreadyRegistered {
        trigger_uid: trigger.uid,
      });
    }

    let topic = TopicName::parse(&trigger.val1).ok_or_else(|| TriggerError::InvalidConfig {
      trigger_uid: trigger.uid,
      message: format!("invalid topic name {:?}", trigger.val1),
    })?;
    let tokens = self
      .inner
      .loader
      .load(trigger)
      .await
      .map_err(|source| TriggerError::Credentials {
        trigger_uid: trigger.uid,
        source,
      })?;

    let subscription = topic.subscription_for(trigger.parent_uid);
    let client = Arc::new(PubsubClient::new(
      self.inner.http.clone(),
      self.inner.config.api_base.as_str(),
      tokens,
    ));
    let cancel = self.inner.shutdown.child_token();
    tasks.insert(
      trigger.uid,
      SubscriptionTask {
        parent_uid: trigger.parent_uid,
        subscription: subscription.clone(),
        cancel: cancel.clone(),
      },
    );

    let listener = Listener {
      inner: self.inner.clone(),
      trigger: trigger.clone(),
      topic,
      subscription,
      client,
      cancel,
    };
    tokio::spawn(listener.run());
    Ok(())
  }

  async fn delete(&self, parent_uid: i64) -> Result<(), TriggerError> {
    let mut tasks = self.inner.tasks.lock().await;
    tasks.retain(|uid, task| {
      if task.parent_uid != parent_uid {
        return true;
      }
      task.cancel.cancel();
      debug!(trigger_uid = *uid, subscription = %task.subscription, "pubsub_trigger_removed");
      false
    });
    Ok(())
  }

  fn shutdown(&self) {
    self.inner.shutdown.cancel();
  }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => false,
    _ = tokio::time::sleep(delay) => true,
  }
}

/// The background work of one registered trigger.
struct Listener {
  inner: Arc<PubsubInner>,
  trigger: Trigger,
  topic: TopicName,
  subscription: String,
  client: Arc<PubsubClient>,
  cancel: CancellationToken,
}

impl Listener {
  async fn run(self) {
    if !self.ensure_subscription().await {
      return;
    }
    info!(trigger_uid = self.trigger.uid, subscription = %self.subscription, "pubsub_listening");

    let (tx, mut rx) = mpsc::channel(DISPATCH_QUEUE);
    tokio::spawn(poll(
      self.client.clone(),
      self.subscription.clone(),
      tx,
      self.cancel.clone(),
      self.inner.config.backoff,
    ));

    loop {
      let received = tokio::select! {
        _ = self.cancel.cancelled() => break,
        received = rx.recv() => match received {
          Some(received) => received,
          None => break,
        },
      };
      self.dispatch(received).await;
    }
    debug!(trigger_uid = self.trigger.uid, "pubsub_listener_stopped");
  }

  async fn ensure_subscription(&self) -> bool {
    loop {
      let result = tokio::select! {
        _ = self.cancel.cancelled() => return false,
        result = self.client.create_subscription(&self.subscription, &self.trigger.val1) => result,
      };
      match result {
        Ok(()) => return true,
        Err(e) if e.is_transient() => {
          warn!(trigger_uid = self.trigger.uid, error = %e, "pubsub_subscribe_retry");
          if !backoff(&self.cancel, self.inner.config.backoff).await {
            return false;
          }
        }
        Err(e) => {
          error!(trigger_uid = self.trigger.uid, error = %e, "pubsub_subscribe_failed");
          return false;
        }
      }
    }
  }

  async fn dispatch(&self, received: ReceivedMessage) {
    let data = match received.message.decoded_data() {
      Ok(data) => data,
      Err(e) => {
        warn!(
          trigger_uid = self.trigger.uid,
          message_id = %received.message.message_id,
          error = %e,
          "pubsub_payload_invalid"
        );
        return;
      }
    };

    let seed: Arc<dyn Capability> = Arc::new(PubsubCapability {
      topic_spec: self.trigger.val1.clone(),
      topic: self.topic.topic.clone(),
      trigger_name: self.trigger.name.clone(),
      subscription: self.subscription.clone(),
      data: String::from_utf8_lossy(&data).into_owned(),
      message: received.message,
      ack_id: received.ack_id,
      client: self.client.clone(),
    });

    match self
      .inner
      .starter
      .start_run(
        self.trigger.parent_uid,
        StartContext::from_trigger(&self.trigger),
        vec![seed],
      )
      .await
    {
      Ok(handle) => debug!(trigger_uid = self.trigger.uid, run_id = %handle.run_id, "pubsub_run_started"),
      Err(e) => warn!(trigger_uid = self.trigger.uid, error = %e, "pubsub_run_failed"),
    }
  }
}

/// Pull batches until cancelled, forwarding each message to the dispatcher.
async fn poll(
  client: Arc<PubsubClient>,
  subscription: String,
  tx: mpsc::Sender<ReceivedMessage>,
  cancel: CancellationToken,
  delay: Duration,
) {
  loop {
    let result = tokio::select! {
      _ = cancel.cancelled() => return,
      result = client.pull(&subscription) => result,
    };
    match result {
      Ok(messages) => {
        for message in messages {
          tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(message) => if sent.is_err() { return },
          }
        }
      }
      Err(e) => {
        warn!(subscription = %subscription, error = %e, "pubsub_pull_failed");
        if !backoff(&cancel, delay).await {
          return;
        }
      }
    }
  }
}

/// Binds `pubsub`: the received message and its `acknowledge()`.
struct PubsubCapability {
  topic_spec: String,
  topic: String,
  trigger_name: String,
  subscription: String,
  data: String,
  message: PubsubMessage,
  ack_id: String,
  client: Arc<PubsubClient>,
}

impl Capability for PubsubCapability {
  fn name(&self) -> &str {
    "pubsub"
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let pubsub = lua.create_table()?;
    pubsub.set("topic_spec", self.topic_spec.as_str())?;
    pubsub.set("topic", self.topic.as_str())?;
    pubsub.set("trigger_name", self.trigger_name.as_str())?;
    pubsub.set("subscription", self.subscription.as_str())?;

    let message = lua.create_table()?;
    message.set("data", self.data.as_str())?;
    message.set("messageId", self.message.message_id.as_str())?;
    message.set("publishTime", self.message.publish_time.as_str())?;
    let attributes = lua.create_table()?;
    for (key, value) in &self.message.attributes {
      attributes.set(key.as_str(), value.as_str())?;
    }
    message.set("attributes", attributes)?;
    pubsub.set("message", message)?;

    let client = self.client.clone();
    let subscription = self.subscription.clone();
    let ack_ids = vec![self.ack_id.clone()];
    let info = run.clone();
    let acknowledge = lua.create_function(move |_, ()| {
      info
        .block_on(client.acknowledge(&subscription, &ack_ids))
        .map_err(|e| {
          warn!(run_id = %info.run_id, error = %e, "pubsub_ack_failed");
          HostError::new(kind::PUBSUB, e.to_string()).into()
        })
    })?;
    pubsub.set("acknowledge", acknowledge)?;

    sandbox.set_global("pubsub", pubsub)
  }
}
