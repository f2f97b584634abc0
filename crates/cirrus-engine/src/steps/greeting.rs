//! Opening and closing banners

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

/// Prints the opening banner; as the first step of every pipeline its
/// cleanup runs last and prints the closing banner.
pub struct GreetingStep {
    title: &'static str,
}

impl GreetingStep {
    pub fn build() -> Self {
        Self {
            title: "Initializing cirrus image build",
        }
    }

    pub fn export() -> Self {
        Self {
            title: "Initializing cirrus image export",
        }
    }
}

impl Step for GreetingStep {
    fn name(&self) -> &'static str {
        "greeting"
    }

    fn execute(&mut self, cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        let border = "*".repeat(self.title.len() + 4);
        cx.ui.say(&border);
        cx.ui.say(&format!("* {} *", self.title));
        cx.ui.say(&border);
        cx.ui.say("");
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        cx.ui.say("");
        cx.ui.say("Thank you for using cirrus.");
        Ok(())
    }
}
