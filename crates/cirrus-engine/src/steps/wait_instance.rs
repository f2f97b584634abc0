//! Instance readiness wait

use std::time::Duration;

use super::{Step, StepContext};
use crate::backend::ResourceKind;
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_for, WaitSpec};

/// Blocks until the instance reports `running`, then refreshes the cached
/// record with the data only available once it runs (addresses in
/// particular). Creates nothing: no cleanup.
pub struct WaitInstanceStep {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitInstanceStep {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: Duration::from_secs(10),
        }
    }
}

impl Step for WaitInstanceStep {
    fn name(&self) -> &'static str {
        "wait-instance"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let instance_id = state.require_instance()?.id.clone();
        cx.ui.say("Waiting for the instance to become RUNNING...");
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

        let refreshed = cx.backend.instance(&instance_id)?;
        state.instance = Some(refreshed);
        cx.ui.say("Instance is RUNNING.");
        Ok(())
    }
}
