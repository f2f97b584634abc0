//! Public-key registration with the backend

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use sha2::{Digest, Sha256};

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

/// Registers the build's public key with the backend. The registered key is
/// deleted here on cleanup, which the unwind order guarantees happens only
/// after the instance referencing it is gone.
pub struct RegisterKeyStep {
    pub key_name: String,
    pub resource_group_id: Option<String>,
}

impl RegisterKeyStep {
    pub fn new(key_name: impl Into<String>, resource_group_id: Option<String>) -> Self {
        Self {
            key_name: key_name.into(),
            resource_group_id,
        }
    }
}

/// OpenSSH-style SHA256 fingerprint of an authorized-key line.
fn fingerprint(public_key: &str) -> Option<String> {
    let blob = public_key.split_whitespace().nth(1)?;
    let decoded = STANDARD.decode(blob).ok()?;
    let digest = Sha256::digest(&decoded);
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

impl Step for RegisterKeyStep {
    fn name(&self) -> &'static str {
        "register-key"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let keys = state.require_keys()?;
        let public_key = std::fs::read_to_string(&keys.public_key)?;
        let public_key = public_key.trim();

        cx.ui.say("Registering public key with the backend...");
        let record = cx.backend.create_key(
            &self.key_name,
            public_key,
            self.resource_group_id.as_deref(),
        )?;

        cx.ui
            .say(&format!("Key registered: {} ({})", record.name, record.id));
        if let Some(print) = fingerprint(public_key) {
            cx.ui.say(&format!("Fingerprint: {print}"));
        }

        state.registered_key_id = Some(record.id);
        state.registered_key_name = Some(record.name);
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let Some(key_id) = state.registered_key_id.clone() else {
            return Ok(());
        };
        let name = state
            .registered_key_name
            .clone()
            .unwrap_or_else(|| key_id.clone());
        cx.ui.say(&format!("Deleting registered key {name} ..."));
        match cx.backend.delete_key(&key_id) {
            Ok(()) => cx.ui.say("Registered key deleted."),
            Err(err) if err.is_not_found() => cx.ui.say("Registered key was already gone."),
            Err(err) => {
                return Err(EngineError::Step(format!(
                    "failed to delete registered key {name}, please delete it manually: {err}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceKind;
    use crate::testing::{state_with_keys, test_context, FakeBackend};

    #[test]
    fn registers_and_deletes_the_key() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let (mut state, _dir) = state_with_keys();
        let mut step = RegisterKeyStep::new("cirrus-ssh-key-1", None);

        step.execute(&cx, &mut state).unwrap();
        assert_eq!(state.registered_key_id.as_deref(), Some("key-1"));

        step.cleanup(&cx, &mut state).unwrap();
    }

    #[test]
    fn cleanup_tolerates_an_already_deleted_key() {
        let backend = FakeBackend::new();
        backend.mark_gone(ResourceKind::Key, "key-1");
        let (cx, ui) = test_context(backend);
        let mut state = BuildState::new();
        state.registered_key_id = Some("key-1".into());

        let mut step = RegisterKeyStep::new("cirrus-ssh-key-1", None);
        step.cleanup(&cx, &mut state).unwrap();
        assert!(ui.lines().iter().any(|l| l.contains("already gone")));
    }

    #[test]
    fn cleanup_without_registration_is_a_no_op() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let mut step = RegisterKeyStep::new("cirrus-ssh-key-1", None);
        step.cleanup(&cx, &mut state).unwrap();
    }

    #[test]
    fn fingerprints_look_like_openssh() {
        let line = format!("ssh-rsa {} cirrus-build", STANDARD.encode(b"key material"));
        let print = fingerprint(&line).unwrap();
        assert!(print.starts_with("SHA256:"));
        assert!(!print.ends_with('='));
    }
}
