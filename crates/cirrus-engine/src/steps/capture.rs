//! Image capture

use std::time::Duration;

use super::{Step, StepContext};
use crate::backend::{ImageRequest, InstanceAction, ResourceKind};
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_for, WaitSpec};

/// Stops the instance, captures its boot volume as an image, waits for the
/// image to become available, then applies tags and cross-region replicas.
/// The image is the deliverable and is never torn down by the build; cleanup
/// only announces the teardown phase (it runs first in the unwind).
pub struct CaptureImageStep {
    pub image_name: String,
    pub image_tags: Vec<String>,
    pub replicate_regions: Vec<String>,
    pub encryption_key_crn: Option<String>,
    pub resource_group_id: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl CaptureImageStep {
    pub fn new(
        image_name: impl Into<String>,
        image_tags: Vec<String>,
        replicate_regions: Vec<String>,
        encryption_key_crn: Option<String>,
        resource_group_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            image_tags,
            replicate_regions,
            encryption_key_crn,
            resource_group_id,
            timeout,
            interval: Duration::from_secs(10),
        }
    }

    fn wait_available(&self, cx: &StepContext, image_id: &str) -> Result<(), EngineError> {
        wait_for(
            &cx.backend,
            &cx.ui,
            WaitSpec {
                kind: ResourceKind::Image,
                id: image_id.to_string(),
                target: &["available"],
                failure: &["failed"],
                interval: self.interval,
                timeout: self.timeout,
            },
        )
    }
}

impl Step for CaptureImageStep {
    fn name(&self) -> &'static str {
        "capture-image"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let instance = state.require_instance()?.clone();

        cx.ui
            .say(&format!("Stopping instance {} ...", instance.id));
        let status = cx
            .backend
            .instance_action(&instance.id, InstanceAction::Stop)?;
        if status.as_deref() != Some("stopped") {
            wait_for(
                &cx.backend,
                &cx.ui,
                WaitSpec {
                    kind: ResourceKind::Instance,
                    id: instance.id.clone(),
                    target: &["stopped"],
                    failure: &["failed"],
                    interval: self.interval,
                    timeout: self.timeout,
                },
            )?;
        }
        cx.ui.say("Instance stopped.");

        cx.ui.say(&format!(
            "Creating image {} from boot volume {} ...",
            self.image_name, instance.boot_volume_id
        ));
        let image = cx.backend.create_image(&ImageRequest {
            name: self.image_name.clone(),
            source_volume_id: instance.boot_volume_id.clone(),
            encryption_key_crn: self.encryption_key_crn.clone(),
            resource_group_id: self.resource_group_id.clone(),
        })?;
        cx.ui.say(&format!("Image created: {}", image.id));
        state.image_id = Some(image.id.clone());
        state.image_name = Some(image.name.clone());

        if !self.image_tags.is_empty() {
            // Tagging failures are advisory; the image itself is intact.
            match cx.backend.tag_image(&image.id, &self.image_tags) {
                Ok(()) => cx
                    .ui
                    .say(&format!("Tags attached: {}", self.image_tags.join(", "))),
                Err(err) => cx.ui.error(&format!("failed to attach tags: {err}")),
            }
        }

        cx.ui.say("Waiting for the image to become AVAILABLE...");
        self.wait_available(cx, &image.id)?;
        cx.ui.say("Image is AVAILABLE.");

        for region in &self.replicate_regions {
            cx.ui
                .say(&format!("Replicating image into {region} ..."));
            let replica = cx
                .backend
                .replicate_image(&image.id, region, &self.image_name)?;
            self.wait_available(cx, &replica.id)?;
            cx.ui
                .say(&format!("Replica in {region}: {}", replica.id));
            state.replicas.insert(region.clone(), replica.id);
        }
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        cx.ui.say("");
        cx.ui
            .say("Cleaning up all transient infrastructure created by this build...");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ready_state, test_context, FakeBackend};

    fn step() -> CaptureImageStep {
        let mut step = CaptureImageStep::new(
            "golden",
            Vec::new(),
            Vec::new(),
            None,
            None,
            Duration::from_millis(200),
        );
        step.interval = Duration::from_millis(1);
        step
    }

    fn state_with_instance() -> BuildState {
        let mut state = ready_state();
        state.instance = Some(crate::testing::instance_record());
        state
    }

    #[test]
    fn stops_captures_and_waits_for_availability() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::Image, "img-1", &["pending", "available"]);
        let (cx, handles) = test_context(backend);
        let mut state = state_with_instance();

        step().execute(&cx, &mut state).unwrap();

        assert_eq!(state.image_id.as_deref(), Some("img-1"));
        assert_eq!(state.image_name.as_deref(), Some("golden"));
        let journal = handles.journal();
        assert!(journal.iter().any(|c| c == "instance_action:inst-1:stop"));
        assert!(journal.iter().any(|c| c == "create_image:golden"));
    }

    #[test]
    fn tag_failures_are_advisory() {
        let backend = FakeBackend::new();
        backend.fail_op("tag_image");
        let (cx, handles) = test_context(backend);
        let mut state = state_with_instance();

        let mut tagged = step();
        tagged.image_tags = vec!["team:build".into()];
        tagged.execute(&cx, &mut state).unwrap();

        assert!(handles.errors().iter().any(|l| l.contains("tags")));
        assert_eq!(state.image_id.as_deref(), Some("img-1"));
    }

    #[test]
    fn replicates_into_each_configured_region() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = state_with_instance();

        let mut replicated = step();
        replicated.replicate_regions = vec!["eu-de".into(), "jp-tok".into()];
        replicated.execute(&cx, &mut state).unwrap();

        assert_eq!(state.replicas.get("eu-de"), Some(&"img-1-eu-de".to_string()));
        assert_eq!(state.replicas.get("jp-tok"), Some(&"img-1-jp-tok".to_string()));
        assert!(
            handles
                .journal()
                .iter()
                .any(|c| c == "replicate_image:img-1/eu-de")
        );
    }

    #[test]
    fn a_failed_image_halts_the_build() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::Image, "img-1", &["failed"]);
        let (cx, _handles) = test_context(backend);
        let mut state = state_with_instance();

        let err = step().execute(&cx, &mut state).unwrap_err();
        assert!(matches!(err, EngineError::ResourceFailed { .. }));
    }
}
