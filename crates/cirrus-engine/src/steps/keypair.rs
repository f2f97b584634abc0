//! Local build key material

use std::process::Command;

use super::{Step, StepContext};
use crate::config::{KeyAlgorithm, KeySource};
use crate::error::EngineError;
use crate::state::{BuildState, KeyMaterial};

/// Generates a fresh key pair under a per-build scratch directory, or adopts
/// caller-supplied key files. Cleanup removes generated material only.
pub struct KeyPairStep {
    pub source: KeySource,
}

impl KeyPairStep {
    pub fn new(source: KeySource) -> Self {
        Self { source }
    }
}

impl Step for KeyPairStep {
    fn name(&self) -> &'static str {
        "key-pair"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        match &self.source {
            KeySource::Existing {
                private_key,
                public_key,
            } => {
                for path in [private_key, public_key] {
                    if !path.exists() {
                        return Err(EngineError::Step(format!(
                            "configured key file does not exist: {}",
                            path.display()
                        )));
                    }
                }
                cx.ui.say(&format!(
                    "Using existing key pair: {}",
                    private_key.display()
                ));
                state.keys = Some(KeyMaterial {
                    private_key: private_key.clone(),
                    public_key: public_key.clone(),
                    scratch: None,
                });
            }
            KeySource::Generate(algorithm) => {
                cx.ui.say("Generating build key pair...");
                let scratch = tempfile::Builder::new().prefix("cirrus-keys-").tempdir()?;
                let (key_type, file_name) = match algorithm {
                    KeyAlgorithm::Rsa => ("rsa", "id_rsa"),
                    KeyAlgorithm::Ed25519 => ("ed25519", "id_ed25519"),
                };
                let private_key = scratch.path().join(file_name);
                let public_key = scratch.path().join(format!("{file_name}.pub"));

                let mut command = Command::new("ssh-keygen");
                command.args(["-t", key_type]);
                if matches!(algorithm, KeyAlgorithm::Rsa) {
                    command.args(["-b", "4096"]);
                }
                let output = command
                    .args(["-N", "", "-q", "-C", "cirrus-build"])
                    .arg("-f")
                    .arg(&private_key)
                    .output()?;
                if !output.status.success() {
                    return Err(EngineError::Step(format!(
                        "ssh-keygen failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }

                cx.ui.say(&format!(
                    "Key pair written to {}",
                    scratch.path().display()
                ));
                state.keys = Some(KeyMaterial {
                    private_key,
                    public_key,
                    scratch: Some(scratch),
                });
            }
        }
        Ok(())
    }

    fn cleanup(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        if let Some(keys) = state.keys.take() {
            if let Some(scratch) = keys.scratch {
                // Dropping the TempDir removes the key files; close() surfaces
                // the IO error instead of swallowing it.
                scratch.close()?;
                cx.ui.say("Build key material removed.");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, FakeBackend};

    #[test]
    fn missing_supplied_keys_halt_the_build() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let mut step = KeyPairStep::new(KeySource::Existing {
            private_key: "/nonexistent/id_rsa".into(),
            public_key: "/nonexistent/id_rsa.pub".into(),
        });
        assert!(step.execute(&cx, &mut state).is_err());
    }

    #[test]
    fn supplied_keys_are_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let private_key = dir.path().join("id_rsa");
        let public_key = dir.path().join("id_rsa.pub");
        std::fs::write(&private_key, "private").unwrap();
        std::fs::write(&public_key, "ssh-rsa AAAA test").unwrap();

        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let mut step = KeyPairStep::new(KeySource::Existing {
            private_key: private_key.clone(),
            public_key: public_key.clone(),
        });
        step.execute(&cx, &mut state).unwrap();
        step.cleanup(&cx, &mut state).unwrap();

        assert!(private_key.exists());
        assert!(public_key.exists());
    }

    #[test]
    fn cleanup_without_execute_is_a_no_op() {
        let (cx, _ui) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let mut step = KeyPairStep::new(KeySource::Generate(KeyAlgorithm::Rsa));
        assert!(step.cleanup(&cx, &mut state).is_ok());
    }
}
