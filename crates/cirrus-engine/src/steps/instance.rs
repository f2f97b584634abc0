//! Transient instance creation and teardown

use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::{Step, StepContext};
use crate::backend::{BootDisk, InstanceAction, InstanceRequest, ResourceKind};
use crate::config::{BootSource, UserData};
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_for, WaitSpec};

/// Creates the transient instance from the configured boot source.
///
/// Teardown is the widest of any step: stop the instance if it still runs,
/// delete it, poll until the backend reports it absent, then remove the
/// ingress rule and the build-owned security group. Group teardown lives
/// here rather than in the security-group step because the backend refuses
/// to delete a group that still has an attached instance, and the unwind
/// reaches the security-group step first.
pub struct CreateInstanceStep {
    pub instance_name: String,
    pub profile: String,
    pub subnet_id: String,
    pub boot: BootSource,
    pub user_data: Option<UserData>,
    pub resource_group_id: Option<String>,
    pub timeout: Duration,
    /// Interval of the post-delete absence poll.
    pub poll_interval: Duration,
    /// Bound on the post-delete absence poll.
    pub poll_attempts: u32,
}

impl CreateInstanceStep {
    pub fn new(
        instance_name: impl Into<String>,
        profile: impl Into<String>,
        subnet_id: impl Into<String>,
        boot: BootSource,
        user_data: Option<UserData>,
        resource_group_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            profile: profile.into(),
            subnet_id: subnet_id.into(),
            boot,
            user_data,
            resource_group_id,
            timeout,
            poll_interval: Duration::from_secs(10),
            poll_attempts: 30,
        }
    }

    fn boot_disk(&self, state: &BuildState) -> Result<BootDisk, EngineError> {
        Ok(match &self.boot {
            BootSource::ImageId(id) => BootDisk::Image(id.clone()),
            // The resolve-image step ran earlier and left the id behind.
            BootSource::ImageName(_) => BootDisk::Image(state.require_base_image_id()?.to_string()),
            BootSource::CatalogOffering(crn) => BootDisk::CatalogOffering(crn.clone()),
            BootSource::CatalogOfferingVersion(crn) => {
                BootDisk::CatalogOfferingVersion(crn.clone())
            }
            BootSource::BootVolume(id) => BootDisk::Volume(id.clone()),
            BootSource::BootSnapshot(id) => BootDisk::Snapshot(id.clone()),
        })
    }

    /// Stop a still-running instance and wait for it to come down, so the
    /// deletion starts from a settled state. Best-effort: a failed stop does
    /// not block the deletion attempt.
    fn settle_before_delete(&self, cx: &StepContext, instance_id: &str) {
        match cx.backend.status(ResourceKind::Instance, instance_id) {
            Ok(status) if status != "stopped" => {
                cx.ui
                    .say(&format!("Stopping instance {instance_id} before deletion..."));
                if let Err(err) = cx.backend.instance_action(instance_id, InstanceAction::Stop) {
                    cx.ui.error(&format!("stop request failed: {err}"));
                    return;
                }
                let wait = wait_for(
                    &cx.backend,
                    &cx.ui,
                    WaitSpec {
                        kind: ResourceKind::Instance,
                        id: instance_id.to_string(),
                        target: &["stopped"],
                        failure: &[],
                        interval: self.poll_interval,
                        timeout: self.timeout,
                    },
                );
                if let Err(err) = wait {
                    cx.ui
                        .error(&format!("instance did not stop in time, deleting anyway: {err}"));
                }
            }
            Ok(_) | Err(_) => {}
        }
    }

    /// Poll until the backend reports the instance absent. Transient "still
    /// exists" answers are expected; the loop is bounded.
    fn confirm_deleted(&self, cx: &StepContext, instance_id: &str) -> Result<(), EngineError> {
        for attempt in 0..=self.poll_attempts {
            match cx.backend.instance(instance_id) {
                Err(err) if err.is_not_found() => {
                    cx.ui.say("Instance deleted.");
                    return Ok(());
                }
                Ok(current) => cx.ui.say(&format!("Instance status: {}", current.status)),
                Err(err) => cx.ui.error(&format!("delete status check failed: {err}")),
            }
            if attempt < self.poll_attempts {
                thread::sleep(self.poll_interval);
            }
        }
        Err(EngineError::Step(format!(
            "instance {instance_id} still present after deletion, please delete it manually"
        )))
    }

    /// Remove the ingress rule and the build-owned group once the instance
    /// no longer pins them.
    fn teardown_security_group(
        &self,
        cx: &StepContext,
        state: &mut BuildState,
    ) -> Result<(), EngineError> {
        let Some(group) = state.security_group.clone() else {
            return Ok(());
        };

        if let Some(rule_id) = state.security_group_rule_id.clone() {
            cx.ui
                .say(&format!("Deleting security group rule {rule_id} ..."));
            match cx.backend.delete_ingress_rule(&group.id, &rule_id) {
                Ok(()) => cx.ui.say("Security group rule deleted."),
                Err(err) if err.is_not_found() => {
                    cx.ui.say("Security group rule was already gone.");
                }
                Err(err) => {
                    return Err(EngineError::Step(format!(
                        "failed to delete security group rule {rule_id}, please delete it \
                         manually: {err}"
                    )));
                }
            }
        }

        if group.owned {
            cx.ui
                .say(&format!("Deleting security group {} ...", group.name));
            match cx.backend.delete_security_group(&group.id) {
                Ok(()) => cx.ui.say("Security group deleted."),
                Err(err) if err.is_not_found() => {
                    cx.ui.say("Security group was already gone.");
                }
                Err(err) => {
                    return Err(EngineError::Step(format!(
                        "failed to delete security group {}, please delete it manually: {err}",
                        group.name
                    )));
                }
            }
        } else {
            cx.ui.say(&format!(
                "Leaving caller-supplied security group {} in place.",
                group.name
            ));
        }
        Ok(())
    }
}

impl Step for CreateInstanceStep {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let boot = self.boot_disk(state)?;
        let user_data = match &self.user_data {
            Some(source) => {
                let data = source.read().map_err(|err| {
                    EngineError::Step(format!("failed to read user data: {err}"))
                })?;
                let digest = hex::encode(Sha256::digest(data.as_bytes()));
                cx.ui
                    .say(&format!("User data checksum: {}", &digest[..12]));
                Some(data)
            }
            None => None,
        };

        let request = InstanceRequest {
            name: self.instance_name.clone(),
            zone: state.require_zone()?.to_string(),
            vpc_id: state.require_vpc_id()?.to_string(),
            subnet_id: self.subnet_id.clone(),
            profile: self.profile.clone(),
            key_id: state.require_registered_key_id()?.to_string(),
            boot,
            user_data,
            resource_group_id: self.resource_group_id.clone(),
        };

        cx.ui.say("Creating instance...");
        let instance = cx.backend.create_instance(&request)?;
        cx.ui.say("Instance created.");
        cx.ui.say(&format!("Instance name: {}", instance.name));
        cx.ui.say(&format!("Instance id: {}", instance.id));
        state.instance = Some(instance);
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let Some(instance) = state.instance.clone() else {
            // Creation never happened; nothing of ours exists remotely.
            return Ok(());
        };

        self.settle_before_delete(cx, &instance.id);

        cx.ui
            .say(&format!("Deleting instance {} ...", instance.id));
        match cx.backend.delete_instance(&instance.id) {
            Ok(()) => self.confirm_deleted(cx, &instance.id)?,
            Err(err) if err.is_not_found() => cx.ui.say("Instance was already gone."),
            Err(err) => {
                return Err(EngineError::Step(format!(
                    "failed to delete instance {}, please delete it manually: {err}",
                    instance.id
                )));
            }
        }

        self.teardown_security_group(cx, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SecurityGroupHandle;
    use crate::testing::{ready_state, test_context, FakeBackend};

    fn step(boot: BootSource) -> CreateInstanceStep {
        let mut step = CreateInstanceStep::new(
            "cirrus-vsi-1",
            "bx2-2x8",
            "subnet-1",
            boot,
            None,
            None,
            Duration::from_millis(200),
        );
        step.poll_interval = Duration::from_millis(1);
        step.poll_attempts = 3;
        step
    }

    #[test]
    fn creates_from_an_image_id() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = ready_state();
        step(BootSource::ImageId("img-base".into()))
            .execute(&cx, &mut state)
            .unwrap();
        assert_eq!(state.instance.as_ref().unwrap().id, "inst-1");
    }

    #[test]
    fn image_name_boot_requires_the_resolved_id() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = ready_state();
        state.base_image_id = None;
        let err = step(BootSource::ImageName("base".into()))
            .execute(&cx, &mut state)
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingState("base_image_id")));
    }

    #[test]
    fn missing_user_data_file_halts() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = ready_state();
        let mut step = step(BootSource::ImageId("img-base".into()));
        step.user_data = Some(UserData::File("/nonexistent/user-data.yml".into()));
        let err = step.execute(&cx, &mut state).unwrap_err();
        assert!(err.to_string().contains("user data"));
    }

    #[test]
    fn cleanup_deletes_instance_then_rule_then_group() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::Instance, "inst-1", &["stopped"]);
        let (cx, handles) = test_context(backend);
        let mut state = ready_state();
        let mut creator = step(BootSource::ImageId("img-base".into()));
        creator.execute(&cx, &mut state).unwrap();
        state.security_group = Some(SecurityGroupHandle {
            id: "sg-1".into(),
            name: "cirrus-sg".into(),
            owned: true,
        });
        state.security_group_rule_id = Some("rule-1".into());

        creator.cleanup(&cx, &mut state).unwrap();

        let journal = handles.journal();
        let delete_instance = position(&journal, "delete_instance:inst-1");
        let delete_rule = position(&journal, "delete_ingress_rule:sg-1/rule-1");
        let delete_group = position(&journal, "delete_security_group:sg-1");
        assert!(delete_instance < delete_rule);
        assert!(delete_rule < delete_group);
    }

    #[test]
    fn caller_supplied_group_is_never_deleted() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::Instance, "inst-1", &["stopped"]);
        let (cx, handles) = test_context(backend);
        let mut state = ready_state();
        let mut creator = step(BootSource::ImageId("img-base".into()));
        creator.execute(&cx, &mut state).unwrap();
        state.security_group = Some(SecurityGroupHandle {
            id: "sg-ext".into(),
            name: "shared".into(),
            owned: false,
        });
        state.security_group_rule_id = Some("rule-1".into());

        creator.cleanup(&cx, &mut state).unwrap();

        let journal = handles.journal();
        assert!(journal.iter().any(|c| c == "delete_ingress_rule:sg-ext/rule-1"));
        assert!(!journal.iter().any(|c| c.starts_with("delete_security_group")));
    }

    #[test]
    fn cleanup_tolerates_an_instance_that_is_already_gone() {
        let backend = FakeBackend::new();
        backend.mark_gone(ResourceKind::Instance, "inst-1");
        let (cx, ui) = test_context(backend);
        let mut state = ready_state();
        state.instance = Some(crate::testing::instance_record());

        step(BootSource::ImageId("img-base".into()))
            .cleanup(&cx, &mut state)
            .unwrap();
        assert!(ui.lines().iter().any(|l| l.contains("already gone")));
    }

    #[test]
    fn cleanup_without_execute_is_a_no_op() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        step(BootSource::ImageId("img-base".into()))
            .cleanup(&cx, &mut state)
            .unwrap();
        assert!(handles.journal().is_empty());
    }

    #[test]
    fn bounded_absence_poll_gives_up_with_a_manual_remediation_error() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::Instance, "inst-1", &["stopped"]);
        backend.keep_instance_after_delete();
        let (cx, _ui) = test_context(backend);
        let mut state = ready_state();
        let mut creator = step(BootSource::ImageId("img-base".into()));
        creator.execute(&cx, &mut state).unwrap();

        let err = creator.cleanup(&cx, &mut state).unwrap_err();
        assert!(err.to_string().contains("delete it manually"));
    }

    fn position(journal: &[String], needle: &str) -> usize {
        journal
            .iter()
            .position(|call| call == needle)
            .unwrap_or_else(|| panic!("{needle} not in journal: {journal:?}"))
    }
}
