//! Email triggers.
//!
//! `val1` is the local part of a recipient address. An external SMTP server
//! asks [`EmailTriggers::accept_recipient`] during `RCPT TO` and hands every
//! accepted message to [`EmailTriggers::commit`], which starts one run for
//! each trigger whose local part is among the recipients.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use mail_parser::{MessageParser, PartType};
use nexus_host::{Capability, CapabilityError, RunInfo, Sandbox, StartContext};
use nexus_runtime::RunStarter;
use nexus_store::{Trigger, TriggerKind};
use tracing::{debug, info, warn};

use crate::error::TriggerError;
use crate::handler::TriggerHandler;

/// A recipient split into its local part and domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
  pub local: String,
  pub domain: String,
}

impl Recipient {
  /// Split at the last `@`. An address without one is all local part.
  pub fn parse(address: &str) -> Self {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    match address.rsplit_once('@') {
      Some((local, domain)) => Self {
        local: local.to_string(),
        domain: domain.to_string(),
      },
      None => Self {
        local: address.to_string(),
        domain: String::new(),
      },
    }
  }
}

/// Envelope details supplied by the SMTP server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMetadata {
  pub tls: bool,
  /// Envelope sender (`MAIL FROM`).
  pub from: String,
  /// Domain announced in `HELO`/`EHLO`.
  pub domain: String,
  pub remote: String,
  pub recipients: Vec<Recipient>,
}

/// Handler for [`TriggerKind::Email`].
#[derive(Clone)]
pub struct EmailTriggers {
  starter: Arc<dyn RunStarter>,
  triggers: Arc<RwLock<Vec<Trigger>>>,
}

impl EmailTriggers {
  pub fn new(starter: Arc<dyn RunStarter>) -> Self {
    Self {
      starter,
      triggers: Arc::new(RwLock::new(Vec::new())),
    }
  }

  /// Every local part some trigger accepts.
  pub fn recipients(&self) -> BTreeSet<String> {
    let triggers = self.triggers.read().unwrap_or_else(|e| e.into_inner());
    triggers.iter().map(|t| t.val1.clone()).collect()
  }

  /// Accept `local` or `local@domain` if a trigger claims the local part.
  pub fn accept_recipient(&self, address: &str) -> Result<(), TriggerError> {
    let recipient = Recipient::parse(address);
    let triggers = self.triggers.read().unwrap_or_else(|e| e.into_inner());
    if triggers.iter().any(|t| t.val1 == recipient.local) {
      Ok(())
    } else {
      Err(TriggerError::UnknownRecipient {
        address: address.to_string(),
      })
    }
  }

  /// Dispatch an accepted message. See [`EmailTriggers::handle_mail`].
  pub async fn commit(&self, raw: &[u8], metadata: &MailMetadata) -> Result<usize, TriggerError> {
    self.handle_mail(raw, metadata).await
  }

  /// Start a run for every trigger matching a recipient of the message.
  ///
  /// The message is parsed once, and only if something matches. A message
  /// that does not parse starts no runs. Returns the number of runs started.
  pub async fn handle_mail(&self, raw: &[u8], metadata: &MailMetadata) -> Result<usize, TriggerError> {
    let matches: Vec<(Trigger, String)> = {
      let triggers = self.triggers.read().unwrap_or_else(|e| e.into_inner());
      triggers
        .iter()
        .filter_map(|t| {
          metadata
            .recipients
            .iter()
            .find(|r| r.local == t.val1)
            .map(|r| (t.clone(), r.local.clone()))
        })
        .collect()
    };
    if matches.is_empty() {
      debug!(recipients = metadata.recipients.len(), "email_no_match");
      return Ok(0);
    }

    let parsed = ParsedMail::parse(raw).ok_or_else(|| {
      warn!(bytes = raw.len(), "email_parse_failed");
      TriggerError::MalformedMessage {
        message: "message is not valid MIME".to_string(),
      }
    })?;

    let mut started = 0;
    for (trigger, address) in matches {
      let seed: Arc<dyn Capability> = Arc::new(MessageCapability {
        address,
        raw: raw.to_vec(),
        metadata: metadata.clone(),
        mail: parsed.clone(),
      });
      match self
        .starter
        .start_run(trigger.parent_uid, StartContext::from_trigger(&trigger), vec![seed])
        .await
      {
        Ok(handle) => {
          started += 1;
          debug!(trigger_uid = trigger.uid, run_id = %handle.run_id, "email_run_started");
        }
        Err(e) => warn!(trigger_uid = trigger.uid, error = %e, "email_run_failed"),
      }
    }
    info!(started, from = %metadata.from, "email_dispatched");
    Ok(started)
  }
}

#[async_trait]
impl TriggerHandler for EmailTriggers {
  fn kind(&self) -> TriggerKind {
    TriggerKind::Email
  }

  async fn register(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    let mut triggers = self.triggers.write().unwrap_or_else(|e| e.into_inner());
    if triggers.iter().any(|t| t.uid == trigger.uid) {
      return Err(TriggerError::AlreadyRegistered {
        trigger_uid: trigger.uid,
      });
    }
    if trigger.val1.is_empty() || trigger.val1.contains('@') {
      return Err(TriggerError::InvalidConfig {
        trigger_uid: trigger.uid,
        message: format!("invalid local part {:?}", trigger.val1),
      });
    }
    triggers.push(trigger.clone());
    Ok(())
  }

  async fn delete(&self, parent_uid: i64) -> Result<(), TriggerError> {
    let mut triggers = self.triggers.write().unwrap_or_else(|e| e.into_inner());
    triggers.retain(|t| t.parent_uid != parent_uid);
    Ok(())
  }
}

/// The parts of a MIME message exposed to scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
  pub subject: String,
  pub text: String,
  pub html: String,
  /// Headers in message order, names as written.
  pub headers: Vec<(String, String)>,
}

impl ParsedMail {
  pub fn parse(raw: &[u8]) -> Option<Self> {
    let message = MessageParser::default().parse(raw)?;
    if message.headers().is_empty() {
      return None;
    }

    let headers = message
      .headers()
      .iter()
      .map(|h| {
        let value = raw
          .get(h.offset_start as usize..h.offset_end as usize)
          .map(|v| unfold(&String::from_utf8_lossy(v)))
          .unwrap_or_default();
        (h.name().to_string(), value)
      })
      .collect();

    Some(Self {
      subject: message.subject().unwrap_or_default().to_string(),
      text: message.body_text(0).map(|t| t.into_owned()).unwrap_or_default(),
      // body_html converts a plain text body; only a real HTML part counts.
      html: message
        .html_part(0)
        .and_then(|part| match &part.body {
          PartType::Html(html) => Some(html.to_string()),
          _ => None,
        })
        .unwrap_or_default(),
      headers,
    })
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Join folded header lines and trim.
fn unfold(value: &str) -> String {
  value
    .split(['\r', '\n'])
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Binds `message` for a run started by an email.
struct MessageCapability {
  address: String,
  /// The message as received; 8bit bodies need not be UTF-8.
  raw: Vec<u8>,
  metadata: MailMetadata,
  mail: ParsedMail,
}

impl Capability for MessageCapability {
  fn name(&self) -> &str {
    "message"
  }

  fn bind(&self, sandbox: &Sandbox, _run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let message = lua.create_table()?;
    message.set("address", self.address.as_str())?;
    message.set("raw", lua.create_string(&self.raw)?)?;
    message.set("was_tls", self.metadata.tls)?;
    message.set("from", self.metadata.from.as_str())?;
    message.set("domain", self.metadata.domain.as_str())?;
    message.set("remote", self.metadata.remote.as_str())?;
    message.set("subject", self.mail.subject.as_str())?;
    message.set("text", self.mail.text.as_str())?;
    message.set("html", self.mail.html.as_str())?;

    let mut first: BTreeMap<String, &str> = BTreeMap::new();
    for (name, value) in &self.mail.headers {
      first.entry(name.to_ascii_lowercase()).or_insert(value.as_str());
    }
    let headers = lua.create_table()?;
    for (name, value) in first {
      headers.set(name, value)?;
    }
    message.set("headers", headers)?;

    let mail = self.mail.clone();
    let get_header = lua.create_function(move |_, name: String| Ok(mail.header(&name).map(str::to_string)))?;
    message.set("get_header", get_header)?;

    sandbox.set_global("message", message)
  }
}
