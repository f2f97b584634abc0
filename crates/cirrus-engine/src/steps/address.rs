//! Guest address acquisition

use std::env;
use std::time::Duration;

use super::{Step, StepContext};
use crate::backend::ResourceKind;
use crate::config::Exposure;
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_for, WaitSpec};

/// Determines the address the provisioner reaches the guest at: a freshly
/// reserved floating IP bound to the primary interface for public builds,
/// the primary IP for private ones.
pub struct AddressStep {
    pub exposure: Exposure,
    pub floating_ip_name: String,
    pub resource_group_id: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl AddressStep {
    pub fn new(
        exposure: Exposure,
        floating_ip_name: impl Into<String>,
        resource_group_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            exposure,
            floating_ip_name: floating_ip_name.into(),
            resource_group_id,
            timeout,
            interval: Duration::from_secs(5),
        }
    }
}

impl Step for AddressStep {
    fn name(&self) -> &'static str {
        "address"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let instance = state.require_instance()?.clone();

        let address = match self.exposure {
            Exposure::Private => {
                cx.ui.say("Using the instance's primary IP...");
                instance.primary_ip
            }
            Exposure::Public => {
                cx.ui.say("Reserving a floating IP...");
                let floating_ip = cx.backend.create_floating_ip(
                    &self.floating_ip_name,
                    &instance.primary_interface_id,
                    self.resource_group_id.as_deref(),
                )?;
                state.floating_ip = Some(floating_ip.clone());

                cx.ui.say("Waiting for the floating IP to become AVAILABLE...");
                wait_for(
                    &cx.backend,
                    &cx.ui,
                    WaitSpec {
                        kind: ResourceKind::FloatingIp,
                        id: floating_ip.id.clone(),
                        target: &["available"],
                        failure: &["failed"],
                        interval: self.interval,
                        timeout: self.timeout,
                    },
                )?;
                cx.ui.say("Floating IP is AVAILABLE.");
                floating_ip.address
            }
        };

        cx.ui.say(&format!("Guest address: {address}"));
        state.host_address = Some(address.clone());

        // Legacy hand-off for external inventory tooling.
        if let Some(path) = env::var_os("ANSIBLE_INVENTORY_FILE") {
            std::fs::write(&path, format!("{address}\n")).map_err(|err| {
                EngineError::Step(format!("failed to write inventory file: {err}"))
            })?;
        }
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let Some(floating_ip) = state.floating_ip.clone() else {
            return Ok(());
        };
        cx.ui
            .say(&format!("Releasing floating IP {} ...", floating_ip.address));

        let current = match cx.backend.floating_ip(&floating_ip.id) {
            Ok(current) => current,
            Err(err) if err.is_not_found() => {
                cx.ui.say("Floating IP was already released.");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if current.status == "available" {
            match cx.backend.release_floating_ip(&floating_ip.id) {
                Ok(()) => cx.ui.say("Floating IP released."),
                Err(err) if err.is_not_found() => cx.ui.say("Floating IP was already released."),
                Err(err) => {
                    return Err(EngineError::Step(format!(
                        "failed to release floating IP {}, please release it manually: {err}",
                        floating_ip.address
                    )));
                }
            }
        } else {
            cx.ui.say(&format!(
                "Floating IP is {}, leaving it for the provider to settle.",
                current.status
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FloatingIpRecord;
    use crate::testing::{ready_state, test_context, FakeBackend};

    fn step(exposure: Exposure) -> AddressStep {
        let mut step = AddressStep::new(
            exposure,
            "cirrus-floating-ip-1",
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
    fn private_builds_use_the_primary_ip() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = state_with_instance();
        step(Exposure::Private).execute(&cx, &mut state).unwrap();
        assert_eq!(state.host_address.as_deref(), Some("10.0.0.5"));
        assert!(state.floating_ip.is_none());
        assert!(handles.journal().is_empty());
    }

    #[test]
    fn public_builds_reserve_and_wait_for_a_floating_ip() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::FloatingIp, "fip-1", &["pending", "available"]);
        let (cx, _handles) = test_context(backend);
        let mut state = state_with_instance();
        step(Exposure::Public).execute(&cx, &mut state).unwrap();
        assert_eq!(state.host_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(state.floating_ip.as_ref().unwrap().id, "fip-1");
    }

    #[test]
    fn cleanup_releases_an_available_floating_ip() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = state_with_instance();
        state.floating_ip = Some(FloatingIpRecord {
            id: "fip-1".into(),
            address: "198.51.100.7".into(),
            status: "available".into(),
        });
        step(Exposure::Public).cleanup(&cx, &mut state).unwrap();
        assert!(
            handles
                .journal()
                .iter()
                .any(|c| c == "release_floating_ip:fip-1")
        );
    }

    #[test]
    fn cleanup_tolerates_a_missing_floating_ip() {
        let backend = FakeBackend::new();
        backend.mark_gone(ResourceKind::FloatingIp, "fip-1");
        let (cx, handles) = test_context(backend);
        let mut state = state_with_instance();
        state.floating_ip = Some(FloatingIpRecord {
            id: "fip-1".into(),
            address: "198.51.100.7".into(),
            status: "available".into(),
        });
        step(Exposure::Public).cleanup(&cx, &mut state).unwrap();
        assert!(handles.lines().iter().any(|l| l.contains("already released")));
    }

    #[test]
    fn cleanup_without_a_reservation_is_a_no_op() {
        let (cx, handles) = test_context(FakeBackend::new());
        let mut state = state_with_instance();
        step(Exposure::Public).cleanup(&cx, &mut state).unwrap();
        assert!(handles.journal().is_empty());
    }
}
