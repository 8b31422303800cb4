//! Email capability.
//!
//! Binds `email.send(server_addr, password, {to, from, subject, body})` and the
//! `email.gmail_addr` constant. Delivery goes through the [`Mailer`]
//! collaborator; [`SmtpMailer`] authenticates as `from` and upgrades with
//! STARTTLS.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use nexus_host::mlua::Table;
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, kind};
use tracing::{info, warn};

pub const NAME: &str = "email";

pub const GMAIL_ADDR: &str = "smtp.gmail.com:587";

#[derive(Debug, thiserror::Error)]
pub enum MailerError {
  #[error("invalid address {address}: {message}")]
  InvalidAddress { address: String, message: String },

  #[error("failed to build message: {0}")]
  Build(#[from] lettre::error::Error),

  #[error("smtp error: {0}")]
  Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
  pub to: String,
  pub from: String,
  pub subject: String,
  pub body: String,
}

/// Delivers mail on behalf of scripts.
#[async_trait]
pub trait Mailer: Send + Sync {
  async fn send(&self, server_addr: &str, password: &str, email: &OutgoingEmail) -> Result<(), MailerError>;
}

/// [`Mailer`] speaking SMTP with STARTTLS and PLAIN/LOGIN auth.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpMailer;

fn mailbox(address: &str) -> Result<Mailbox, MailerError> {
  address.parse().map_err(|e: lettre::address::AddressError| MailerError::InvalidAddress {
    address: address.to_string(),
    message: e.to_string(),
  })
}

fn split_server(server_addr: &str) -> Result<(&str, u16), MailerError> {
  let invalid = || MailerError::InvalidAddress {
    address: server_addr.to_string(),
    message: "expected host:port".to_string(),
  };
  let (host, port) = server_addr.rsplit_once(':').ok_or_else(invalid)?;
  let port = port.parse().map_err(|_| invalid())?;
  Ok((host, port))
}

#[async_trait]
impl Mailer for SmtpMailer {
  async fn send(&self, server_addr: &str, password: &str, email: &OutgoingEmail) -> Result<(), MailerError> {
    let (host, port) = split_server(server_addr)?;
    let message = Message::builder()
      .from(mailbox(&email.from)?)
      .to(mailbox(&email.to)?)
      .subject(email.subject.as_str())
      .body(email.body.clone())?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
      .port(port)
      .credentials(Credentials::new(email.from.clone(), password.to_string()))
      .build();
    transport.send(message).await?;
    Ok(())
  }
}

pub struct EmailCapability {
  mailer: Arc<dyn Mailer>,
}

impl EmailCapability {
  pub fn new(mailer: Arc<dyn Mailer>) -> Self {
    Self { mailer }
  }
}

fn field(details: &Table, name: &str) -> Result<String, HostError> {
  let value: Option<String> = details
    .get(name)
    .map_err(|_| HostError::api(format!("email field {name} must be a string")))?;
  Ok(value.unwrap_or_default())
}

impl Capability for EmailCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let email = lua.create_table()?;
    email.set("gmail_addr", GMAIL_ADDR)?;

    let (mailer, info) = (self.mailer.clone(), run.clone());
    let send = lua.create_function(move |_, (server_addr, password, details): (String, String, Option<Table>)| {
      let details = details.ok_or_else(|| HostError::api("expected table with email info"))?;
      let outgoing = OutgoingEmail {
        to: field(&details, "to")?,
        from: field(&details, "from")?,
        subject: field(&details, "subject")?,
        body: field(&details, "body")?,
      };
      info
        .block_on(mailer.send(&server_addr, &password, &outgoing))
        .map_err(|e| {
          warn!(run_id = %info.run_id, to = %outgoing.to, error = %e, "email_send_failed");
          HostError::new(kind::EMAIL, e.to_string())
        })?;
      info!(run_id = %info.run_id, to = %outgoing.to, "email_sent");
      Ok(())
    })?;
    email.set("send", send)?;

    sandbox.set_global(NAME, email)
  }
}
