use std::sync::Arc;

use tracing::debug;

use crate::error::CapabilityError;
use crate::run::RunInfo;
use crate::sandbox::Sandbox;

/// A named host object installed into a run's sandbox before the script starts.
pub trait Capability: Send + Sync {
  /// Global name the capability is bound under.
  fn name(&self) -> &str;

  /// Install the capability. Failure aborts the run before it starts.
  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError>;
}

/// Ordered set of capabilities applied to every run.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
  capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a capability; capabilities are bound in registration order.
  pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
    self.register(capability);
    self
  }

  pub fn register(&mut self, capability: Arc<dyn Capability>) {
    self.capabilities.push(capability);
  }

  pub fn names(&self) -> Vec<&str> {
    self.capabilities.iter().map(|c| c.name()).collect()
  }

  pub fn len(&self) -> usize {
    self.capabilities.len()
  }

  pub fn is_empty(&self) -> bool {
    self.capabilities.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
    self.capabilities.iter()
  }

  /// Bind every capability in order, stopping at the first failure.
  pub fn apply(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    for capability in &self.capabilities {
      let name = capability.name();
      capability.bind(sandbox, run).map_err(|e| match e {
        CapabilityError::Lua(source) => CapabilityError::Bind {
          name: name.to_string(),
          source,
        },
        other => other,
      })?;
      debug!(run_id = %run.run_id, capability = name, "capability_bound");
    }
    Ok(())
  }
}

impl From<Vec<Arc<dyn Capability>>> for CapabilityRegistry {
  fn from(capabilities: Vec<Arc<dyn Capability>>) -> Self {
    Self { capabilities }
  }
}
