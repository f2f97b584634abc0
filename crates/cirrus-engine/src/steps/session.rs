//! Backend session setup

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

/// Establishes (or verifies) the provider session. Authentication and token
/// refresh stay inside the backend; this step only surfaces a broken session
/// before any resource is created.
pub struct SessionStep;

impl Step for SessionStep {
    fn name(&self) -> &'static str {
        "session"
    }

    fn execute(&mut self, cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        cx.ui.say("Connecting to the provider...");
        cx.backend.connect()?;
        cx.ui.say("Provider session established.");
        Ok(())
    }
}
