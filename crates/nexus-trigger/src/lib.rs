//! Nexus Trigger
//!
//! Trigger handlers translate external events into runs:
//!
//! - [`CronTriggers`]: a shared tick loop firing cron expressions
//! - [`WebTriggers`]: inbound HTTP requests matched by path pattern
//! - [`PubsubTriggers`]: Google Cloud Pub/Sub subscriptions
//! - [`EmailTriggers`]: mail accepted by an external SMTP server
//!
//! [`TriggerRegistry`] keeps the handlers in step with each runnable's stored
//! trigger list. Handlers start runs through [`nexus_runtime::RunStarter`].

pub mod cron;
pub mod email;
mod error;
mod handler;
pub mod pubsub;
mod registry;
pub mod web;

pub use self::cron::CronTriggers;
pub use email::{EmailTriggers, MailMetadata, Recipient};
pub use error::TriggerError;
pub use handler::TriggerHandler;
pub use pubsub::{PubsubConfig, PubsubError, PubsubTriggers};
pub use registry::TriggerRegistry;
pub use web::WebTriggers;
