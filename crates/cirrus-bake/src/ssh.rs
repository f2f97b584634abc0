//! SSH provisioner - run a guest-setup script over SSH
//!
//! Connects to the freshly booted instance with the build's private key,
//! uploads the configured script, and executes it with output streaming.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use cirrus_engine::{AccessProtocol, EngineError, Provisioner};
use cirrus_engine::steps::ProvisionTarget;
use console::style;

const REMOTE_SCRIPT: &str = "/tmp/cirrus-provision.sh";

/// Guest provisioning over the system `ssh` binary.
pub struct SshProvisioner {
    pub user: String,
    pub port: u16,
    pub script: PathBuf,
}

impl SshProvisioner {
    pub fn new(user: impl Into<String>, port: u16, script: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            port,
            script: script.into(),
        }
    }

    fn destination(&self, address: &str) -> String {
        format!("{}@{address}", self.user)
    }

    /// Common SSH options: the host is transient, so host-key churn is
    /// expected and pinning is pointless.
    fn ssh_args(&self, private_key: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-p".into(),
            self.port.to_string(),
        ];
        if let Some(key) = private_key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args
    }

    fn wait_for_ssh(&self, address: &str, private_key: Option<&Path>) -> Result<(), EngineError> {
        let max_attempts = 30;
        for _attempt in 0..max_attempts {
            let mut args = self.ssh_args(private_key);
            args.extend([
                "-o".into(),
                "ConnectTimeout=5".into(),
                "-o".into(),
                "BatchMode=yes".into(),
                self.destination(address),
                "true".into(),
            ]);
            let status = Command::new("ssh")
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if status.map(|s| s.success()).unwrap_or(false) {
                return Ok(());
            }
            thread::sleep(Duration::from_secs(2));
        }
        Err(EngineError::Step(format!(
            "could not reach {address}:{} over SSH after {max_attempts} attempts",
            self.port
        )))
    }

    fn upload_script(&self, address: &str, private_key: Option<&Path>) -> Result<(), EngineError> {
        let script = std::fs::read_to_string(&self.script).map_err(|err| {
            EngineError::Step(format!(
                "failed to read provisioning script {}: {err}",
                self.script.display()
            ))
        })?;

        let mut args = self.ssh_args(private_key);
        args.push(self.destination(address));
        args.push(format!("cat > {REMOTE_SCRIPT} && chmod +x {REMOTE_SCRIPT}"));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| EngineError::Step(format!("failed to start ssh for upload: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|err| EngineError::Step(format!("failed to stream script: {err}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|err| EngineError::Step(format!("failed to upload script: {err}")))?;
        if !output.status.success() {
            return Err(EngineError::Step(format!(
                "failed to upload script: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn execute_script(&self, address: &str, private_key: Option<&Path>) -> Result<(), EngineError> {
        let mut args = self.ssh_args(private_key);
        args.push(self.destination(address));
        args.push(format!("sudo {REMOTE_SCRIPT}"));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| EngineError::Step(format!("failed to execute script: {err}")))?;

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                println!("  {}", style(&line).dim());
            }
        }

        let status = child
            .wait()
            .map_err(|err| EngineError::Step(format!("failed to wait for script: {err}")))?;
        if !status.success() {
            return Err(EngineError::Step(format!(
                "provisioning script failed with exit code: {status}"
            )));
        }
        Ok(())
    }

    fn cleanup_script(&self, address: &str, private_key: Option<&Path>) {
        let mut args = self.ssh_args(private_key);
        args.push(self.destination(address));
        args.push(format!("rm -f {REMOTE_SCRIPT}"));
        let status = Command::new("ssh")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !status.map(|s| s.success()).unwrap_or(false) {
            eprintln!(
                "{} Warning: could not remove the remote script",
                style("!").yellow()
            );
        }
    }
}

impl Provisioner for SshProvisioner {
    fn provision(&self, target: &ProvisionTarget<'_>) -> Result<(), EngineError> {
        if !matches!(target.protocol, AccessProtocol::Ssh) {
            return Err(EngineError::Step(
                "the ssh provisioner only supports ssh-protocol builds".into(),
            ));
        }

        self.wait_for_ssh(target.address, target.private_key)?;
        self.upload_script(target.address, target.private_key)?;
        self.execute_script(target.address, target.private_key)?;
        self.cleanup_script(target.address, target.private_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_args_carry_port_and_key() {
        let provisioner = SshProvisioner::new("root", 2222, "/tmp/provision.sh");
        let args = provisioner.ssh_args(Some(Path::new("/keys/id_rsa")));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/keys/id_rsa".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn destination_includes_the_user() {
        let provisioner = SshProvisioner::new("builder", 22, "/tmp/provision.sh");
        assert_eq!(provisioner.destination("198.51.100.7"), "builder@198.51.100.7");
    }
}
