//! Per-build shared state threaded through the pipeline

use std::collections::BTreeMap;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::backend::{FloatingIpRecord, InstanceRecord};
use crate::error::EngineError;

/// Key material in use by this build.
#[derive(Debug)]
pub struct KeyMaterial {
    /// Local path of the private key file.
    pub private_key: PathBuf,
    /// Local path of the public key file.
    pub public_key: PathBuf,
    /// Holding directory for generated keys. `None` when the keys were
    /// supplied by the caller, in which case teardown must not touch them.
    pub scratch: Option<TempDir>,
}

/// Security group serving this build.
#[derive(Debug, Clone)]
pub struct SecurityGroupHandle {
    pub id: String,
    pub name: String,
    /// True when the group was created by this build and must be deleted on
    /// teardown. A caller-supplied group is never deleted.
    pub owned: bool,
}

/// Mutable state shared by every step of one build.
///
/// Each field is written by exactly one producing step and read by any later
/// step. A field keeps its value for the remainder of the build; the
/// `require_*` accessors fail with [`EngineError::MissingState`] when a step
/// reads a value whose producer has not run. The state lives for one build
/// invocation and is discarded with the build.
#[derive(Debug, Default)]
pub struct BuildState {
    /// Parent network of the build's subnet.
    pub vpc_id: Option<String>,
    /// Placement zone derived from the subnet.
    pub zone: Option<String>,
    /// Local key material (generated or supplied).
    pub keys: Option<KeyMaterial>,
    /// Backend-side identifier of the registered public key.
    pub registered_key_id: Option<String>,
    /// Backend-side name of the registered public key.
    pub registered_key_name: Option<String>,
    /// Boot image id resolved from a configured image name.
    pub base_image_id: Option<String>,
    /// The transient instance, refreshed after it reaches `running`.
    pub instance: Option<InstanceRecord>,
    pub security_group: Option<SecurityGroupHandle>,
    pub security_group_rule_id: Option<String>,
    pub floating_ip: Option<FloatingIpRecord>,
    /// Address the provisioner reaches the guest at (floating or primary IP).
    pub host_address: Option<String>,
    pub guest_username: Option<String>,
    pub guest_password: Option<String>,
    /// The captured image: the build's deliverable.
    pub image_id: Option<String>,
    pub image_name: Option<String>,
    /// Replica image ids created in additional regions, keyed by region.
    pub replicas: BTreeMap<String, String>,
    pub export_job_id: Option<String>,
    /// Diagnostic record of the halting error, for teardown-time logging.
    /// Control flow uses step results, never this field.
    pub error: Option<String>,
    /// Advisory teardown failures ("please delete X manually").
    pub cleanup_warnings: Vec<String>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_vpc_id(&self) -> Result<&str, EngineError> {
        self.vpc_id
            .as_deref()
            .ok_or(EngineError::MissingState("vpc_id"))
    }

    pub fn require_zone(&self) -> Result<&str, EngineError> {
        self.zone.as_deref().ok_or(EngineError::MissingState("zone"))
    }

    pub fn require_keys(&self) -> Result<&KeyMaterial, EngineError> {
        self.keys.as_ref().ok_or(EngineError::MissingState("keys"))
    }

    pub fn require_registered_key_id(&self) -> Result<&str, EngineError> {
        self.registered_key_id
            .as_deref()
            .ok_or(EngineError::MissingState("registered_key_id"))
    }

    pub fn require_base_image_id(&self) -> Result<&str, EngineError> {
        self.base_image_id
            .as_deref()
            .ok_or(EngineError::MissingState("base_image_id"))
    }

    pub fn require_instance(&self) -> Result<&InstanceRecord, EngineError> {
        self.instance
            .as_ref()
            .ok_or(EngineError::MissingState("instance"))
    }

    pub fn require_host_address(&self) -> Result<&str, EngineError> {
        self.host_address
            .as_deref()
            .ok_or(EngineError::MissingState("host_address"))
    }

    pub fn require_image_id(&self) -> Result<&str, EngineError> {
        self.image_id
            .as_deref()
            .ok_or(EngineError::MissingState("image_id"))
    }

    /// Record the halting error for teardown-time diagnostics.
    pub fn record_error(&mut self, err: &EngineError) {
        self.error = Some(err.to_string());
    }

    /// Record a teardown failure without aborting the unwind.
    pub fn warn_cleanup(&mut self, line: impl Into<String>) {
        self.cleanup_warnings.push(line.into());
    }
}
