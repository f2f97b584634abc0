//! Guest credential retrieval
//!
//! Remote-desktop-managed guests publish their initial administrator
//! password encrypted against the build's public key. The step fetches the
//! material, decodes it, and decrypts it locally with `openssl` and the
//! matching private key.

use std::io::Write;
use std::process::Command;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::{Step, StepContext};
use crate::error::EngineError;
use crate::state::BuildState;

pub struct CredentialsStep;

impl Step for CredentialsStep {
    fn name(&self) -> &'static str {
        "credentials"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let instance_id = state.require_instance()?.id.clone();
        let private_key = state.require_keys()?.private_key.clone();

        cx.ui.say("Fetching initial guest credentials...");
        let encrypted = cx.backend.instance_initialization(&instance_id)?;
        let decoded = STANDARD.decode(encrypted.trim()).map_err(|err| {
            EngineError::Step(format!("failed to decode encrypted password: {err}"))
        })?;

        let mut scratch = tempfile::NamedTempFile::new()?;
        scratch.write_all(&decoded)?;
        scratch.flush()?;

        let output = Command::new("openssl")
            .args(["pkeyutl", "-decrypt", "-inkey"])
            .arg(&private_key)
            .arg("-in")
            .arg(scratch.path())
            .output()?;
        if !output.status.success() {
            return Err(EngineError::Step(format!(
                "failed to decrypt guest password: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
        state.guest_username = Some("Administrator".into());
        state.guest_password = Some(password);
        cx.ui.say("Guest credentials ready.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{state_with_keys, test_context, FakeBackend};

    #[test]
    fn requires_an_instance() {
        let (cx, _handles) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let err = CredentialsStep.execute(&cx, &mut state).unwrap_err();
        assert!(matches!(err, EngineError::MissingState("instance")));
    }

    #[test]
    fn a_garbled_payload_is_a_step_error() {
        let backend = FakeBackend::new();
        backend.set_initialization_payload("%%% not base64 %%%");
        let (cx, _handles) = test_context(backend);
        let (mut state, _dir) = state_with_keys();
        state.instance = Some(crate::testing::instance_record());

        let err = CredentialsStep.execute(&cx, &mut state).unwrap_err();
        assert!(err.to_string().contains("decode"));
    }
}
