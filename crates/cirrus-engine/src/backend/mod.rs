//! Resource backend abstraction
//!
//! The engine talks to the cloud through the narrow [`ResourceBackend`]
//! contract: create/get/delete per resource kind plus a status probe. It
//! never sees a wire format. The one shipped implementation,
//! [`CliBackend`], drives the provider CLI; anything that satisfies the
//! trait (including the test double) plugs in unchanged.

mod cli;

pub use cli::CliBackend;

use std::fmt;

use thiserror::Error;

/// Resource classes the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Key,
    SecurityGroup,
    SecurityGroupRule,
    FloatingIp,
    Image,
    ImageExportJob,
    Subnet,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Key => "key",
            Self::SecurityGroup => "security group",
            Self::SecurityGroupRule => "security group rule",
            Self::FloatingIp => "floating ip",
            Self::Image => "image",
            Self::ImageExportJob => "image export job",
            Self::Subnet => "subnet",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a backend implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The resource does not exist. Destructive teardown treats this as
    /// success, never as a failure.
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The provider rejected or failed the call.
    #[error("backend call failed: {0}")]
    Api(String),

    /// The provider answered with something the backend could not read.
    #[error("malformed backend response: {0}")]
    Malformed(String),

    /// The provider tooling could not be invoked at all.
    #[error("failed to invoke provider cli: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Subnet placement data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRecord {
    pub id: String,
    pub vpc_id: String,
    pub zone: String,
}

/// A registered public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRecord {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
}

/// The transient instance as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub primary_interface_id: String,
    pub primary_ip: String,
    pub boot_volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpRecord {
    pub id: String,
    pub address: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJobRecord {
    pub id: String,
    pub status: String,
}

/// How the new instance's boot disk is initialised, with every identifier
/// already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDisk {
    Image(String),
    CatalogOffering(String),
    CatalogOfferingVersion(String),
    Volume(String),
    Snapshot(String),
}

/// A fully resolved create-instance request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub profile: String,
    pub key_id: String,
    pub boot: BootDisk,
    pub user_data: Option<String>,
    pub resource_group_id: Option<String>,
}

/// An inbound security-group rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: &'static str,
    pub port_min: u16,
    pub port_max: u16,
}

/// Lifecycle actions an instance accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Reboot,
}

impl InstanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
        }
    }
}

/// A create-image request sourced from a boot volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub name: String,
    pub source_volume_id: String,
    pub encryption_key_crn: Option<String>,
    pub resource_group_id: Option<String>,
}

/// Object-storage destination of an image export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketRef {
    Name(String),
    Crn(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJobRequest {
    pub name: String,
    pub image_id: String,
    pub bucket: BucketRef,
    pub format: String,
}

/// The cloud-provider capability consumed by steps and the waiter.
///
/// The backend owns its session, including authentication and any token
/// refresh; callers never retry authorization failures themselves.
pub trait ResourceBackend: Send + Sync {
    /// Establish or verify the provider session.
    fn connect(&self) -> Result<(), BackendError>;

    /// Current status string of a resource, as reported by the provider.
    fn status(&self, kind: ResourceKind, id: &str) -> Result<String, BackendError>;

    fn subnet(&self, id: &str) -> Result<SubnetRecord, BackendError>;

    fn create_key(
        &self,
        name: &str,
        public_key: &str,
        resource_group_id: Option<&str>,
    ) -> Result<KeyRecord, BackendError>;
    fn delete_key(&self, id: &str) -> Result<(), BackendError>;

    fn security_group(&self, id: &str) -> Result<SecurityGroupRecord, BackendError>;
    fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        resource_group_id: Option<&str>,
    ) -> Result<SecurityGroupRecord, BackendError>;
    fn delete_security_group(&self, id: &str) -> Result<(), BackendError>;
    fn create_ingress_rule(
        &self,
        group_id: &str,
        rule: &IngressRule,
    ) -> Result<String, BackendError>;
    fn delete_ingress_rule(&self, group_id: &str, rule_id: &str) -> Result<(), BackendError>;
    /// Bind a network interface to a security group.
    fn attach_interface(&self, group_id: &str, interface_id: &str) -> Result<(), BackendError>;

    /// Resolve a base image name to its id.
    fn image_id_by_name(&self, name: &str) -> Result<String, BackendError>;

    fn create_instance(&self, req: &InstanceRequest) -> Result<InstanceRecord, BackendError>;
    fn instance(&self, id: &str) -> Result<InstanceRecord, BackendError>;
    fn delete_instance(&self, id: &str) -> Result<(), BackendError>;
    /// Issue a lifecycle action; returns the status the provider reported
    /// for the action, when it reports one.
    fn instance_action(
        &self,
        id: &str,
        action: InstanceAction,
    ) -> Result<Option<String>, BackendError>;
    /// Encrypted initial-login material for the instance, base64-encoded.
    fn instance_initialization(&self, id: &str) -> Result<String, BackendError>;

    fn create_floating_ip(
        &self,
        name: &str,
        interface_id: &str,
        resource_group_id: Option<&str>,
    ) -> Result<FloatingIpRecord, BackendError>;
    fn floating_ip(&self, id: &str) -> Result<FloatingIpRecord, BackendError>;
    fn release_floating_ip(&self, id: &str) -> Result<(), BackendError>;

    fn create_image(&self, req: &ImageRequest) -> Result<ImageRecord, BackendError>;
    /// Attach user tags to a captured image.
    fn tag_image(&self, image_id: &str, tags: &[String]) -> Result<(), BackendError>;
    /// Copy a captured image into another region.
    fn replicate_image(
        &self,
        image_id: &str,
        region: &str,
        name: &str,
    ) -> Result<ImageRecord, BackendError>;

    fn create_export_job(&self, req: &ExportJobRequest) -> Result<ExportJobRecord, BackendError>;
    fn export_job(&self, image_id: &str, job_id: &str) -> Result<ExportJobRecord, BackendError>;
}
