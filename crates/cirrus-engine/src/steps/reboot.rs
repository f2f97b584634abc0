//! Post-provisioning reboot

use std::time::Duration;

use super::{Step, StepContext};
use crate::backend::{InstanceAction, ResourceKind};
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_for, WaitSpec};

/// Reboots the instance so installed components settle cleanly before the
/// boot volume is captured.
pub struct RebootStep {
    pub timeout: Duration,
    pub interval: Duration,
}

impl RebootStep {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: Duration::from_secs(10),
        }
    }
}

impl Step for RebootStep {
    fn name(&self) -> &'static str {
        "reboot"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let instance_id = state.require_instance()?.id.clone();
        cx.ui
            .say("Rebooting the instance to settle installed components...");
        let status = cx
            .backend
            .instance_action(&instance_id, InstanceAction::Reboot)?;

        if status.as_deref() != Some("running") {
            wait_for(
                &cx.backend,
                &cx.ui,
                WaitSpec {
                    kind: ResourceKind::Instance,
                    id: instance_id.clone(),
                    target: &["running"],
                    failure: &["failed"],
                    interval: self.interval,
                    timeout: self.timeout,
                },
            )?;
        }

        let refreshed = cx.backend.instance(&instance_id)?;
        state.instance = Some(refreshed);
        cx.ui.say("Instance is RUNNING again.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ready_state, test_context, FakeBackend};

    #[test]
    fn reboots_and_refreshes_the_record() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = ready_state();
        state.instance = Some(crate::testing::instance_record());

        let mut step = RebootStep::new(Duration::from_millis(200));
        step.interval = Duration::from_millis(1);
        step.execute(&cx, &mut state).unwrap();

        assert!(
            handles
                .journal()
                .iter()
                .any(|c| c == "instance_action:inst-1:reboot")
        );
    }
}
