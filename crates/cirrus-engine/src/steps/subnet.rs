//! Network placement resolution

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

/// Resolves the parent VPC and placement zone from the configured subnet,
/// and verifies a caller-supplied security group lives on the same VPC.
/// Read-only: no cleanup.
pub struct SubnetStep {
    pub subnet_id: String,
    pub security_group_id: Option<String>,
}

impl SubnetStep {
    pub fn new(subnet_id: impl Into<String>, security_group_id: Option<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            security_group_id,
        }
    }
}

impl Step for SubnetStep {
    fn name(&self) -> &'static str {
        "subnet"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        cx.ui
            .say(&format!("Retrieving subnet {} ...", self.subnet_id));
        let subnet = cx.backend.subnet(&self.subnet_id)?;

        cx.ui.say(&format!("VPC: {}", subnet.vpc_id));
        cx.ui.say(&format!("Zone: {}", subnet.zone));

        if let Some(group_id) = &self.security_group_id {
            let group = cx.backend.security_group(group_id)?;
            if group.vpc_id != subnet.vpc_id {
                return Err(EngineError::Step(format!(
                    "security group {} belongs to VPC {}, not to the subnet's VPC {}",
                    group_id, group.vpc_id, subnet.vpc_id
                )));
            }
            cx.ui.say(&format!(
                "Reusing security group {} ({})",
                group.name, group.id
            ));
        }

        state.vpc_id = Some(subnet.vpc_id);
        state.zone = Some(subnet.zone);
        Ok(())
    }
}
