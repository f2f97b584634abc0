//! Guest provisioning hook
//!
//! The remote-command communicator is an external collaborator; the engine
//! only defines the seam. A pipeline without a provisioner skips the phase.

use std::path::Path;
use std::sync::Arc;

use super::{Step, StepContext};
use crate::config::AccessProtocol;
use crate::error::EngineError;
use crate::state::BuildState;

/// Connection details handed to a [`Provisioner`].
pub struct ProvisionTarget<'a> {
    pub address: &'a str,
    pub protocol: AccessProtocol,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub private_key: Option<&'a Path>,
}

/// Runs guest-side installation over the configured access protocol.
pub trait Provisioner: Send + Sync {
    fn provision(&self, target: &ProvisionTarget<'_>) -> Result<(), EngineError>;
}

pub struct ProvisionStep {
    pub protocol: AccessProtocol,
    pub provisioner: Option<Arc<dyn Provisioner>>,
}

impl ProvisionStep {
    pub fn new(protocol: AccessProtocol, provisioner: Option<Arc<dyn Provisioner>>) -> Self {
        Self {
            protocol,
            provisioner,
        }
    }
}

impl Step for ProvisionStep {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let Some(provisioner) = &self.provisioner else {
            cx.ui.say("No provisioner configured, skipping guest setup.");
            return Ok(());
        };

        let address = state.require_host_address()?.to_string();
        let target = ProvisionTarget {
            address: &address,
            protocol: self.protocol,
            username: state.guest_username.as_deref(),
            password: state.guest_password.as_deref(),
            private_key: state.keys.as_ref().map(|keys| keys.private_key.as_path()),
        };

        cx.ui.say("Running guest provisioning...");
        provisioner.provision(&target)?;
        cx.ui.say("Guest provisioning finished.");
        Ok(())
    }
}
