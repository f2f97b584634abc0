//! Security group provisioning

use super::{Step, StepContext};
use crate::backend::IngressRule;
use crate::error::EngineError;
use crate::state::{BuildState, SecurityGroupHandle};

/// Creates a temporary security group (or adopts a caller-supplied one),
/// opens the access protocol's port range, and binds the instance's primary
/// network interface to the group.
pub struct SecurityGroupStep {
    /// Caller-supplied group to reuse; `None` creates a build-owned group.
    pub existing_group_id: Option<String>,
    pub group_name: String,
    pub port_min: u16,
    pub port_max: u16,
    pub resource_group_id: Option<String>,
}

impl SecurityGroupStep {
    pub fn new(
        existing_group_id: Option<String>,
        group_name: impl Into<String>,
        (port_min, port_max): (u16, u16),
        resource_group_id: Option<String>,
    ) -> Self {
        Self {
            existing_group_id,
            group_name: group_name.into(),
            port_min,
            port_max,
            resource_group_id,
        }
    }
}

impl Step for SecurityGroupStep {
    fn name(&self) -> &'static str {
        "security-group"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let vpc_id = state.require_vpc_id()?.to_string();

        let handle = match &self.existing_group_id {
            None => {
                cx.ui
                    .say(&format!("Creating a temporary security group on VPC {vpc_id} ..."));
                let group = cx.backend.create_security_group(
                    &self.group_name,
                    &vpc_id,
                    self.resource_group_id.as_deref(),
                )?;
                cx.ui
                    .say(&format!("Security group created: {} ({})", group.name, group.id));
                SecurityGroupHandle {
                    id: group.id,
                    name: group.name,
                    owned: true,
                }
            }
            Some(group_id) => {
                let group = cx.backend.security_group(group_id)?;
                cx.ui
                    .say(&format!("Reusing security group {} ({})", group.name, group.id));
                SecurityGroupHandle {
                    id: group.id,
                    name: group.name,
                    owned: false,
                }
            }
        };

        cx.ui.say(&format!(
            "Opening inbound tcp {}-{} ...",
            self.port_min, self.port_max
        ));
        let rule_id = cx.backend.create_ingress_rule(
            &handle.id,
            &IngressRule {
                protocol: "tcp",
                port_min: self.port_min,
                port_max: self.port_max,
            },
        )?;

        cx.ui.say("Binding the instance to the security group...");
        let interface_id = state.require_instance()?.primary_interface_id.clone();
        cx.backend.attach_interface(&handle.id, &interface_id)?;
        cx.ui.say("Instance bound to the security group.");

        state.security_group = Some(handle);
        state.security_group_rule_id = Some(rule_id);
        Ok(())
    }

    fn cleanup(&mut self, _cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        // Rule and group teardown happens in the instance step's cleanup: the
        // backend refuses to delete a group with an attached instance, and
        // the unwind reaches this step before the instance one.
        Ok(())
    }
}
