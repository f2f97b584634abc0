//! Base-image name resolution

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

/// Resolves a configured base-image name to its id. Selected only when the
/// boot source is an image name. Read-only: no cleanup.
pub struct ResolveImageStep {
    pub image_name: String,
}

impl ResolveImageStep {
    pub fn new(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
        }
    }
}

impl Step for ResolveImageStep {
    fn name(&self) -> &'static str {
        "resolve-image"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        cx.ui
            .say(&format!("Resolving base image {} ...", self.image_name));
        let image_id = cx.backend.image_id_by_name(&self.image_name)?;
        cx.ui.say(&format!("Base image id: {image_id}"));
        state.base_image_id = Some(image_id);
        Ok(())
    }
}
