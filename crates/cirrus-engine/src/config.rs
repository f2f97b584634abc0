//! Build and export configuration
//!
//! Configuration is assembled through builders and validated once, before
//! the pipeline starts. Validation reports every violated constraint at the
//! same time. After `build()` succeeds the configuration is immutable for
//! the rest of the build.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::backend::BucketRef;
use crate::error::EngineError;

/// Remote-access protocol used to provision the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessProtocol {
    #[default]
    Ssh,
    Winrm,
}

impl AccessProtocol {
    /// Inbound port range the temporary security group must open.
    pub fn port_range(self) -> (u16, u16) {
        match self {
            Self::Ssh => (22, 22),
            Self::Winrm => (5985, 5986),
        }
    }
}

/// Network exposure of the transient instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exposure {
    #[default]
    Public,
    Private,
}

/// How the transient instance's boot disk is initialised. Exactly one
/// variant must be selected by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSource {
    ImageId(String),
    ImageName(String),
    CatalogOffering(String),
    CatalogOfferingVersion(String),
    BootVolume(String),
    BootSnapshot(String),
}

/// Guest user data, inline or from a file. At most one may be configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserData {
    Inline(String),
    File(PathBuf),
}

impl UserData {
    /// Materialise the payload. File reads happen here, at instance-creation
    /// time, so a vanished file halts the build like any other step error.
    pub fn read(&self) -> std::io::Result<String> {
        match self {
            Self::Inline(data) => Ok(data.clone()),
            Self::File(path) => std::fs::read_to_string(path),
        }
    }
}

/// Key algorithm for generated build keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ed25519,
}

/// Where the build's key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Generate a fresh pair under a per-build scratch directory.
    Generate(KeyAlgorithm),
    /// Use existing key files: explicit paths, or the legacy
    /// `PRIVATE_KEY`/`PUBLIC_KEY` environment variables.
    Existing {
        private_key: PathBuf,
        public_key: PathBuf,
    },
}

/// Validated, immutable configuration for one image build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub region: String,
    pub subnet_id: String,
    pub profile: String,
    pub resource_group_id: Option<String>,
    /// Caller-supplied security group to reuse instead of creating one.
    pub security_group_id: Option<String>,
    pub exposure: Exposure,
    pub protocol: AccessProtocol,
    pub boot_source: BootSource,
    pub user_data: Option<UserData>,
    pub key_source: KeySource,
    /// Name of the captured image.
    pub image_name: String,
    pub image_tags: Vec<String>,
    /// Regions to replicate the captured image into.
    pub replicate_regions: Vec<String>,
    pub encryption_key_crn: Option<String>,
    /// Budget for each readiness wait.
    pub state_timeout: Duration,
    /// Generated per-build resource names.
    pub instance_name: String,
    pub key_name: String,
    pub security_group_name: String,
    pub floating_ip_name: String,
}

impl BuildConfig {
    pub fn builder() -> BuildConfigBuilder {
        BuildConfigBuilder::default()
    }
}

/// Strip everything the provider rejects in a resource name.
fn sanitize_name(name: &str) -> String {
    let invalid = Regex::new(r"[^a-z0-9\-]+").expect("static pattern");
    invalid.replace_all(&name.to_lowercase(), "").into_owned()
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos())
}

/// Builder for [`BuildConfig`]. All fields are raw and optional; `build()`
/// validates the whole set at once.
#[derive(Debug, Clone, Default)]
pub struct BuildConfigBuilder {
    region: Option<String>,
    subnet_id: Option<String>,
    profile: Option<String>,
    resource_group_id: Option<String>,
    security_group_id: Option<String>,
    exposure: Exposure,
    protocol: AccessProtocol,
    image_id: Option<String>,
    image_name: Option<String>,
    catalog_offering_crn: Option<String>,
    catalog_offering_version_crn: Option<String>,
    boot_volume_id: Option<String>,
    boot_snapshot_id: Option<String>,
    user_data: Option<String>,
    user_data_file: Option<PathBuf>,
    private_key_file: Option<PathBuf>,
    public_key_file: Option<PathBuf>,
    key_algorithm: KeyAlgorithm,
    output_image_name: Option<String>,
    image_tags: Vec<String>,
    replicate_regions: Vec<String>,
    encryption_key_crn: Option<String>,
    timeout: Option<String>,
}

impl BuildConfigBuilder {
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn subnet_id(mut self, id: impl Into<String>) -> Self {
        self.subnet_id = Some(id.into());
        self
    }

    /// Instance profile (machine size) for the transient instance.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn resource_group_id(mut self, id: impl Into<String>) -> Self {
        self.resource_group_id = Some(id.into());
        self
    }

    /// Reuse a caller-supplied security group instead of creating one.
    pub fn security_group_id(mut self, id: impl Into<String>) -> Self {
        self.security_group_id = Some(id.into());
        self
    }

    pub fn exposure(mut self, exposure: Exposure) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn protocol(mut self, protocol: AccessProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id = Some(id.into());
        self
    }

    /// Base image by name; resolved to an id before instance creation.
    pub fn image_name(mut self, name: impl Into<String>) -> Self {
        self.image_name = Some(name.into());
        self
    }

    pub fn catalog_offering_crn(mut self, crn: impl Into<String>) -> Self {
        self.catalog_offering_crn = Some(crn.into());
        self
    }

    pub fn catalog_offering_version_crn(mut self, crn: impl Into<String>) -> Self {
        self.catalog_offering_version_crn = Some(crn.into());
        self
    }

    pub fn boot_volume_id(mut self, id: impl Into<String>) -> Self {
        self.boot_volume_id = Some(id.into());
        self
    }

    pub fn boot_snapshot_id(mut self, id: impl Into<String>) -> Self {
        self.boot_snapshot_id = Some(id.into());
        self
    }

    pub fn user_data(mut self, data: impl Into<String>) -> Self {
        self.user_data = Some(data.into());
        self
    }

    pub fn user_data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_data_file = Some(path.into());
        self
    }

    pub fn private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    pub fn public_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_key_file = Some(path.into());
        self
    }

    pub fn key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Name of the captured image. Defaults to a timestamped name.
    pub fn output_image_name(mut self, name: impl Into<String>) -> Self {
        self.output_image_name = Some(name.into());
        self
    }

    pub fn image_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.image_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn replicate_regions(
        mut self,
        regions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.replicate_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn encryption_key_crn(mut self, crn: impl Into<String>) -> Self {
        self.encryption_key_crn = Some(crn.into());
        self
    }

    /// Readiness-wait budget as a humantime string ("2m", "90s").
    pub fn timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    fn resolve_boot_source(&self, problems: &mut Vec<String>) -> Option<BootSource> {
        let candidates: Vec<BootSource> = [
            self.image_id.clone().map(BootSource::ImageId),
            self.image_name.clone().map(BootSource::ImageName),
            self.catalog_offering_crn
                .clone()
                .map(BootSource::CatalogOffering),
            self.catalog_offering_version_crn
                .clone()
                .map(BootSource::CatalogOfferingVersion),
            self.boot_volume_id.clone().map(BootSource::BootVolume),
            self.boot_snapshot_id.clone().map(BootSource::BootSnapshot),
        ]
        .into_iter()
        .flatten()
        .collect();

        match candidates.len() {
            1 => candidates.into_iter().next(),
            0 => {
                problems.push(
                    "a boot source is required: one of image id, image name, catalog \
                     offering CRN, catalog offering version CRN, boot volume id, or boot \
                     snapshot id"
                        .into(),
                );
                None
            }
            n => {
                problems.push(format!(
                    "boot sources are mutually exclusive: {n} were set, exactly one of \
                     image id, image name, catalog offering CRN, catalog offering version \
                     CRN, boot volume id, or boot snapshot id is allowed"
                ));
                None
            }
        }
    }

    fn resolve_user_data(&self, problems: &mut Vec<String>) -> Option<UserData> {
        match (&self.user_data, &self.user_data_file) {
            (Some(_), Some(_)) => {
                problems.push(
                    "user data is mutually exclusive: set either the inline string or the \
                     file path, not both"
                        .into(),
                );
                None
            }
            (Some(data), None) => Some(UserData::Inline(data.clone())),
            (None, Some(path)) => {
                if path.exists() {
                    Some(UserData::File(path.clone()))
                } else {
                    problems.push(format!(
                        "user data file does not exist: {}",
                        path.display()
                    ));
                    None
                }
            }
            (None, None) => None,
        }
    }

    fn resolve_keys(&self, problems: &mut Vec<String>) -> KeySource {
        resolve_key_source(
            self.private_key_file.clone(),
            self.public_key_file.clone(),
            env::var_os("PRIVATE_KEY").map(PathBuf::from),
            env::var_os("PUBLIC_KEY").map(PathBuf::from),
            self.key_algorithm,
            problems,
        )
    }

    /// Validate and freeze the configuration, reporting every violation.
    pub fn build(self) -> Result<BuildConfig, EngineError> {
        let mut problems = Vec::new();

        for (value, what) in [
            (&self.region, "a region must be specified"),
            (&self.subnet_id, "a subnet id must be specified"),
            (&self.profile, "an instance profile must be specified"),
        ] {
            if value.as_deref().is_none_or(str::is_empty) {
                problems.push(what.to_string());
            }
        }

        let boot_source = self.resolve_boot_source(&mut problems);
        let user_data = self.resolve_user_data(&mut problems);
        let key_source = self.resolve_keys(&mut problems);

        let state_timeout = match humantime::parse_duration(
            self.timeout.as_deref().unwrap_or(DEFAULT_STATE_TIMEOUT),
        ) {
            Ok(timeout) => timeout,
            Err(err) => {
                problems.push(format!("invalid timeout: {err}"));
                Duration::ZERO
            }
        };

        if !problems.is_empty() {
            return Err(EngineError::InvalidConfig(problems));
        }

        let nanos = unix_nanos();
        let image_name = sanitize_name(
            &self
                .output_image_name
                .unwrap_or_else(|| format!("cirrus-image-{}", nanos / 1_000_000_000)),
        );

        Ok(BuildConfig {
            region: self.region.unwrap_or_default(),
            subnet_id: self.subnet_id.unwrap_or_default(),
            profile: self.profile.unwrap_or_default(),
            resource_group_id: self.resource_group_id,
            security_group_id: self.security_group_id,
            exposure: self.exposure,
            protocol: self.protocol,
            boot_source: boot_source.expect("validated"),
            user_data,
            key_source,
            image_name,
            image_tags: self.image_tags,
            replicate_regions: self.replicate_regions,
            encryption_key_crn: self.encryption_key_crn,
            state_timeout,
            instance_name: format!("cirrus-vsi-{nanos}"),
            key_name: format!("cirrus-ssh-key-{nanos}"),
            security_group_name: format!("cirrus-security-group-{nanos}"),
            floating_ip_name: format!("cirrus-floating-ip-{nanos}"),
        })
    }
}

const DEFAULT_STATE_TIMEOUT: &str = "2m";

/// Key-path resolution, explicit paths first, the legacy environment
/// variables second, generation last.
fn resolve_key_source(
    explicit_private: Option<PathBuf>,
    explicit_public: Option<PathBuf>,
    env_private: Option<PathBuf>,
    env_public: Option<PathBuf>,
    algorithm: KeyAlgorithm,
    problems: &mut Vec<String>,
) -> KeySource {
    match (explicit_private, explicit_public) {
        (Some(private_key), Some(public_key)) => KeySource::Existing {
            private_key,
            public_key,
        },
        (Some(_), None) | (None, Some(_)) => {
            problems.push(
                "private and public key files must be supplied together, or neither".into(),
            );
            KeySource::Generate(algorithm)
        }
        (None, None) => match (env_private, env_public) {
            (Some(private_key), Some(public_key)) => KeySource::Existing {
                private_key,
                public_key,
            },
            _ => KeySource::Generate(algorithm),
        },
    }
}

/// Validated configuration for a chained image export.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub region: String,
    pub image_id: String,
    /// Display name of the source image, when known.
    pub image_name: Option<String>,
    pub job_name: String,
    pub bucket: BucketRef,
    pub format: String,
    pub timeout: Duration,
}

impl ExportConfig {
    pub fn builder() -> ExportConfigBuilder {
        ExportConfigBuilder::default()
    }
}

/// Builder for [`ExportConfig`].
#[derive(Debug, Clone, Default)]
pub struct ExportConfigBuilder {
    region: Option<String>,
    image_id: Option<String>,
    inherited: Option<BTreeMap<String, String>>,
    job_name: Option<String>,
    bucket_name: Option<String>,
    bucket_crn: Option<String>,
    format: Option<String>,
    timeout: Option<String>,
}

impl ExportConfigBuilder {
    /// Region; required with a direct image id, forbidden when inheriting.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Export a directly named image.
    pub fn image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id = Some(id.into());
        self
    }

    /// Inherit the source image from a build artifact's carried-forward
    /// metadata.
    pub fn inherit(mut self, metadata: &BTreeMap<String, String>) -> Self {
        self.inherited = Some(metadata.clone());
        self
    }

    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn bucket_name(mut self, name: impl Into<String>) -> Self {
        self.bucket_name = Some(name.into());
        self
    }

    pub fn bucket_crn(mut self, crn: impl Into<String>) -> Self {
        self.bucket_crn = Some(crn.into());
        self
    }

    /// Export format; `qcow2` when unset.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn build(self) -> Result<ExportConfig, EngineError> {
        let mut problems = Vec::new();

        // Exactly one image source is honoured per invocation: a direct id
        // (with its own region) or the inherited artifact metadata.
        let (region, image_id, image_name) = match (&self.image_id, &self.inherited) {
            (Some(id), _) => {
                if self.region.as_deref().is_none_or(str::is_empty) {
                    problems.push("a region must be specified when an image id is given".into());
                }
                (self.region.clone().unwrap_or_default(), id.clone(), None)
            }
            (None, Some(metadata)) => {
                if self.region.is_some() {
                    problems.push(
                        "a region must not be specified when inheriting from an artifact"
                            .into(),
                    );
                }
                let image_id = metadata.get("image_id").cloned().unwrap_or_default();
                if image_id.is_empty() {
                    problems.push("inherited artifact metadata carries no image id".into());
                }
                (
                    metadata.get("region").cloned().unwrap_or_default(),
                    image_id,
                    metadata.get("image_name").cloned(),
                )
            }
            (None, None) => {
                problems
                    .push("an image id or an artifact to inherit from must be specified".into());
                (String::new(), String::new(), None)
            }
        };

        let bucket = match (self.bucket_name, self.bucket_crn) {
            (Some(name), None) => Some(BucketRef::Name(name)),
            (None, Some(crn)) => Some(BucketRef::Crn(crn)),
            (Some(_), Some(_)) => {
                problems.push(
                    "storage bucket name and storage bucket CRN are mutually exclusive".into(),
                );
                None
            }
            (None, None) => {
                problems
                    .push("either a storage bucket name or a storage bucket CRN is required".into());
                None
            }
        };

        let timeout = match humantime::parse_duration(self.timeout.as_deref().unwrap_or("45m")) {
            // Sub-minute budgets cannot cover a real export; promote them to
            // a workable default.
            Ok(timeout) if timeout < Duration::from_secs(60) => Duration::from_secs(300),
            Ok(timeout) => timeout,
            Err(err) => {
                problems.push(format!("invalid export timeout: {err}"));
                Duration::ZERO
            }
        };

        if !problems.is_empty() {
            return Err(EngineError::InvalidConfig(problems));
        }

        Ok(ExportConfig {
            region,
            image_id,
            image_name,
            job_name: sanitize_name(
                &self
                    .job_name
                    .unwrap_or_else(|| format!("cirrus-export-{}", unix_nanos())),
            ),
            bucket: bucket.expect("validated"),
            format: self.format.unwrap_or_else(|| "qcow2".into()),
            timeout,
        })
    }
}
