//! Capabilities bound into every run.

use std::sync::Arc;

use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox};
use nexus_store::{Error as StoreError, UserDirectory};
use tracing::warn;

/// Binds `context`: facts about the current run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextCapability;

impl Capability for ContextCapability {
  fn name(&self) -> &str {
    "context"
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let context = sandbox.create_table()?;
    context.set("run_id", run.run_id.as_str())?;
    context.set("run_reason", run.context.kind.as_str())?;
    context.set("trigger_id", run.context.trigger_uid)?;
    context.set("runnable_id", run.runnable.uid)?;
    context.set("runnable_name", run.runnable.name.as_str())?;
    context.set("start_time", run.started_at.to_rfc3339())?;
    context.set("start_unix", run.started_at.timestamp())?;
    sandbox.set_global(self.name(), context)
  }
}

/// Binds `owner`: the runnable owner's id and a lookup of their account.
pub struct OwnerCapability {
  users: Arc<dyn UserDirectory>,
}

impl OwnerCapability {
  pub fn new(users: Arc<dyn UserDirectory>) -> Self {
    Self { users }
  }
}

impl Capability for OwnerCapability {
  fn name(&self) -> &str {
    "owner"
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let owner = lua.create_table()?;
    owner.set("id", run.owner_uid())?;

    let (users, info) = (self.users.clone(), run.clone());
    let get = lua.create_function(move |lua, ()| {
      let user = match info.block_on(users.get_user(info.owner_uid())) {
        Ok(user) => user,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => {
          warn!(run_id = %info.run_id, error = %e, "owner_lookup_failed");
          return Err(HostError::internal(e.to_string()).into());
        }
      };
      let table = lua.create_table()?;
      table.set("uid", user.uid)?;
      table.set("username", user.username)?;
      table.set("display_name", user.display_name)?;
      table.set("admin", user.admin)?;
      table.set("created_at", user.created_at.timestamp())?;
      Ok(Some(table))
    })?;
    owner.set("get", get)?;

    sandbox.set_global(self.name(), owner)
  }
}
