//! Provider CLI-backed resource backend
//!
//! Drives the cloud through the `ibmcloud` CLI with `--output JSON`.
//! Requires the CLI with the `is` (VPC infrastructure) plugin installed and
//! a logged-in session; the CLI caches and refreshes its own credentials,
//! so no re-authentication happens here.

use std::io::Write;
use std::process::Command;

use serde_json::Value;

use super::{
    BackendError, BootDisk, BucketRef, ExportJobRecord, ExportJobRequest, FloatingIpRecord,
    ImageRecord, ImageRequest, IngressRule, InstanceAction, InstanceRecord, InstanceRequest,
    KeyRecord, ResourceBackend, ResourceKind, SecurityGroupRecord, SubnetRecord,
};

/// [`ResourceBackend`] implementation shelling out to the provider CLI.
pub struct CliBackend {
    region: String,
    binary: String,
}

impl CliBackend {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            binary: "ibmcloud".into(),
        }
    }

    /// Override the CLI binary (used by tests and wrapper scripts).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Run a CLI command and parse its stdout as JSON.
    fn run_json(&self, args: &[&str]) -> Result<Value, BackendError> {
        let output = Command::new(&self.binary)
            .args(args)
            .args(["--output", "JSON", "-q"])
            .output()?;

        if !output.status.success() {
            return Err(BackendError::Api(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| BackendError::Malformed(err.to_string()))
    }

    /// Run a CLI command whose output is not consumed.
    fn run_quiet(&self, args: &[&str]) -> Result<(), BackendError> {
        let output = Command::new(&self.binary).args(args).arg("-q").output()?;
        if !output.status.success() {
            return Err(BackendError::Api(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// CLI subcommand that shows a single resource of `kind`.
    fn show_command(kind: ResourceKind) -> Result<&'static str, BackendError> {
        match kind {
            ResourceKind::Instance => Ok("instance"),
            ResourceKind::Subnet => Ok("subnet"),
            ResourceKind::FloatingIp => Ok("floating-ip"),
            ResourceKind::Image => Ok("image"),
            ResourceKind::Key => Ok("key"),
            ResourceKind::SecurityGroup => Ok("security-group"),
            ResourceKind::SecurityGroupRule | ResourceKind::ImageExportJob => Err(
                BackendError::Api(format!("{kind} has no standalone show command")),
            ),
        }
    }
}

/// Whether a CLI failure message means the resource is gone.
fn is_missing_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found")
        || lower.contains("not_found")
        || lower.contains("cannot be found")
        || lower.contains("404")
}

/// Reclassify an API failure as `NotFound` when its message says so.
fn map_missing(err: BackendError, kind: ResourceKind, id: &str) -> BackendError {
    match err {
        BackendError::Api(message) if is_missing_message(&message) => BackendError::NotFound {
            kind,
            id: id.to_string(),
        },
        other => other,
    }
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str, BackendError> {
    let mut cursor = value;
    for key in path {
        cursor = &cursor[*key];
    }
    cursor
        .as_str()
        .ok_or_else(|| BackendError::Malformed(format!("missing field {}", path.join("."))))
}

fn parse_instance(value: &Value) -> Result<InstanceRecord, BackendError> {
    Ok(InstanceRecord {
        id: str_field(value, &["id"])?.to_string(),
        name: str_field(value, &["name"])?.to_string(),
        status: str_field(value, &["status"])?.to_string(),
        primary_interface_id: str_field(value, &["primary_network_interface", "id"])?.to_string(),
        // Older API surfaces expose the address directly, newer ones nest a
        // reserved-IP object.
        primary_ip: str_field(value, &["primary_network_interface", "primary_ip", "address"])
            .or_else(|_| {
                str_field(value, &["primary_network_interface", "primary_ipv4_address"])
            })?
            .to_string(),
        boot_volume_id: str_field(value, &["boot_volume_attachment", "volume", "id"])?.to_string(),
    })
}

fn parse_image(value: &Value) -> Result<ImageRecord, BackendError> {
    Ok(ImageRecord {
        id: str_field(value, &["id"])?.to_string(),
        name: str_field(value, &["name"])?.to_string(),
        status: str_field(value, &["status"])?.to_string(),
    })
}

/// Boot-source CLI flags for an instance-create call.
fn boot_args(boot: &BootDisk) -> [String; 2] {
    match boot {
        BootDisk::Image(id) => ["--image".into(), id.clone()],
        BootDisk::CatalogOffering(crn) => ["--catalog-offering".into(), crn.clone()],
        BootDisk::CatalogOfferingVersion(crn) => {
            ["--catalog-offering-version".into(), crn.clone()]
        }
        BootDisk::Volume(id) => ["--boot-volume".into(), id.clone()],
        BootDisk::Snapshot(id) => ["--source-snapshot".into(), id.clone()],
    }
}

impl ResourceBackend for CliBackend {
    fn connect(&self) -> Result<(), BackendError> {
        self.run_quiet(&["target", "-r", &self.region])
    }

    fn status(&self, kind: ResourceKind, id: &str) -> Result<String, BackendError> {
        let command = Self::show_command(kind)?;
        let value = self
            .run_json(&["is", command, id])
            .map_err(|err| map_missing(err, kind, id))?;
        Ok(str_field(&value, &["status"])?.to_string())
    }

    fn subnet(&self, id: &str) -> Result<SubnetRecord, BackendError> {
        let value = self
            .run_json(&["is", "subnet", id])
            .map_err(|err| map_missing(err, ResourceKind::Subnet, id))?;
        Ok(SubnetRecord {
            id: str_field(&value, &["id"])?.to_string(),
            vpc_id: str_field(&value, &["vpc", "id"])?.to_string(),
            zone: str_field(&value, &["zone", "name"])?.to_string(),
        })
    }

    fn create_key(
        &self,
        name: &str,
        public_key: &str,
        resource_group_id: Option<&str>,
    ) -> Result<KeyRecord, BackendError> {
        let mut args = vec!["is", "key-create", name, public_key];
        if let Some(rg) = resource_group_id {
            args.extend(["--resource-group-id", rg]);
        }
        let value = self.run_json(&args)?;
        Ok(KeyRecord {
            id: str_field(&value, &["id"])?.to_string(),
            name: str_field(&value, &["name"])?.to_string(),
        })
    }

    fn delete_key(&self, id: &str) -> Result<(), BackendError> {
        self.run_quiet(&["is", "key-delete", id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::Key, id))
    }

    fn security_group(&self, id: &str) -> Result<SecurityGroupRecord, BackendError> {
        let value = self
            .run_json(&["is", "security-group", id])
            .map_err(|err| map_missing(err, ResourceKind::SecurityGroup, id))?;
        Ok(SecurityGroupRecord {
            id: str_field(&value, &["id"])?.to_string(),
            name: str_field(&value, &["name"])?.to_string(),
            vpc_id: str_field(&value, &["vpc", "id"])?.to_string(),
        })
    }

    fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        resource_group_id: Option<&str>,
    ) -> Result<SecurityGroupRecord, BackendError> {
        let mut args = vec!["is", "security-group-create", name, vpc_id];
        if let Some(rg) = resource_group_id {
            args.extend(["--resource-group-id", rg]);
        }
        let value = self.run_json(&args)?;
        Ok(SecurityGroupRecord {
            id: str_field(&value, &["id"])?.to_string(),
            name: str_field(&value, &["name"])?.to_string(),
            vpc_id: vpc_id.to_string(),
        })
    }

    fn delete_security_group(&self, id: &str) -> Result<(), BackendError> {
        self.run_quiet(&["is", "security-group-delete", id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::SecurityGroup, id))
    }

    fn create_ingress_rule(
        &self,
        group_id: &str,
        rule: &IngressRule,
    ) -> Result<String, BackendError> {
        let port_min = rule.port_min.to_string();
        let port_max = rule.port_max.to_string();
        let value = self.run_json(&[
            "is",
            "security-group-rule-add",
            group_id,
            "inbound",
            rule.protocol,
            "--port-min",
            &port_min,
            "--port-max",
            &port_max,
        ])?;
        Ok(str_field(&value, &["id"])?.to_string())
    }

    fn delete_ingress_rule(&self, group_id: &str, rule_id: &str) -> Result<(), BackendError> {
        self.run_quiet(&["is", "security-group-rule-delete", group_id, rule_id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::SecurityGroupRule, rule_id))
    }

    fn attach_interface(&self, group_id: &str, interface_id: &str) -> Result<(), BackendError> {
        self.run_quiet(&[
            "is",
            "security-group-network-interface-add",
            group_id,
            interface_id,
        ])
    }

    fn image_id_by_name(&self, name: &str) -> Result<String, BackendError> {
        let value = self.run_json(&["is", "images", "--name", name])?;
        let first = value
            .as_array()
            .and_then(|images| images.first())
            .ok_or_else(|| BackendError::NotFound {
                kind: ResourceKind::Image,
                id: name.to_string(),
            })?;
        Ok(str_field(first, &["id"])?.to_string())
    }

    fn create_instance(&self, req: &InstanceRequest) -> Result<InstanceRecord, BackendError> {
        let boot = boot_args(&req.boot);
        let mut args: Vec<&str> = vec![
            "is",
            "instance-create",
            &req.name,
            &req.vpc_id,
            &req.zone,
            &req.profile,
            &req.subnet_id,
            "--keys",
            &req.key_id,
            &boot[0],
            &boot[1],
        ];
        // Large user data goes through a scratch file rather than the
        // command line.
        let mut user_data_file = None;
        let user_data_arg;
        if let Some(data) = &req.user_data {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(data.as_bytes())?;
            user_data_arg = format!("@{}", file.path().display());
            user_data_file = Some(file);
            args.extend(["--user-data", &user_data_arg]);
        }
        if let Some(rg) = &req.resource_group_id {
            args.extend(["--resource-group-id", rg]);
        }

        let value = self.run_json(&args)?;
        drop(user_data_file);
        parse_instance(&value)
    }

    fn instance(&self, id: &str) -> Result<InstanceRecord, BackendError> {
        let value = self
            .run_json(&["is", "instance", id])
            .map_err(|err| map_missing(err, ResourceKind::Instance, id))?;
        parse_instance(&value)
    }

    fn delete_instance(&self, id: &str) -> Result<(), BackendError> {
        self.run_quiet(&["is", "instance-delete", id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::Instance, id))
    }

    fn instance_action(
        &self,
        id: &str,
        action: InstanceAction,
    ) -> Result<Option<String>, BackendError> {
        let command = match action {
            InstanceAction::Start => "instance-start",
            InstanceAction::Stop => "instance-stop",
            InstanceAction::Reboot => "instance-reboot",
        };
        let value = self
            .run_json(&["is", command, id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::Instance, id))?;
        Ok(value["status"].as_str().map(ToString::to_string))
    }

    fn instance_initialization(&self, id: &str) -> Result<String, BackendError> {
        let value = self
            .run_json(&["is", "instance-initialization-values", id])
            .map_err(|err| map_missing(err, ResourceKind::Instance, id))?;
        Ok(str_field(&value, &["password", "encrypted_password"])?.to_string())
    }

    fn create_floating_ip(
        &self,
        name: &str,
        interface_id: &str,
        resource_group_id: Option<&str>,
    ) -> Result<FloatingIpRecord, BackendError> {
        let mut args = vec!["is", "floating-ip-reserve", name, "--nic-id", interface_id];
        if let Some(rg) = resource_group_id {
            args.extend(["--resource-group-id", rg]);
        }
        let value = self.run_json(&args)?;
        Ok(FloatingIpRecord {
            id: str_field(&value, &["id"])?.to_string(),
            address: str_field(&value, &["address"])?.to_string(),
            status: str_field(&value, &["status"])?.to_string(),
        })
    }

    fn floating_ip(&self, id: &str) -> Result<FloatingIpRecord, BackendError> {
        let value = self
            .run_json(&["is", "floating-ip", id])
            .map_err(|err| map_missing(err, ResourceKind::FloatingIp, id))?;
        Ok(FloatingIpRecord {
            id: str_field(&value, &["id"])?.to_string(),
            address: str_field(&value, &["address"])?.to_string(),
            status: str_field(&value, &["status"])?.to_string(),
        })
    }

    fn release_floating_ip(&self, id: &str) -> Result<(), BackendError> {
        self.run_quiet(&["is", "floating-ip-release", id, "-f"])
            .map_err(|err| map_missing(err, ResourceKind::FloatingIp, id))
    }

    fn create_image(&self, req: &ImageRequest) -> Result<ImageRecord, BackendError> {
        let mut args = vec![
            "is",
            "image-create",
            &req.name,
            "--source-volume",
            &req.source_volume_id,
        ];
        if let Some(crn) = &req.encryption_key_crn {
            args.extend(["--encryption-key", crn]);
        }
        if let Some(rg) = &req.resource_group_id {
            args.extend(["--resource-group-id", rg]);
        }
        let value = self.run_json(&args)?;
        parse_image(&value)
    }

    fn tag_image(&self, image_id: &str, tags: &[String]) -> Result<(), BackendError> {
        let joined = tags.join(",");
        self.run_quiet(&[
            "resource",
            "tag-attach",
            "--resource-id",
            image_id,
            "--tag-names",
            &joined,
        ])
    }

    fn replicate_image(
        &self,
        image_id: &str,
        region: &str,
        name: &str,
    ) -> Result<ImageRecord, BackendError> {
        let value = self.run_json(&[
            "is",
            "image-create",
            name,
            "--source-image",
            image_id,
            "--region",
            region,
        ])?;
        parse_image(&value)
    }

    fn create_export_job(&self, req: &ExportJobRequest) -> Result<ExportJobRecord, BackendError> {
        let bucket_flag = match &req.bucket {
            BucketRef::Name(name) => ["--storage-bucket", name.as_str()],
            BucketRef::Crn(crn) => ["--storage-bucket-crn", crn.as_str()],
        };
        let value = self.run_json(&[
            "is",
            "image-export-job-create",
            "--image",
            &req.image_id,
            bucket_flag[0],
            bucket_flag[1],
            "--format",
            &req.format,
            "--name",
            &req.name,
        ])?;
        Ok(ExportJobRecord {
            id: str_field(&value, &["id"])?.to_string(),
            status: str_field(&value, &["status"])?.to_string(),
        })
    }

    fn export_job(&self, image_id: &str, job_id: &str) -> Result<ExportJobRecord, BackendError> {
        let value = self
            .run_json(&["is", "image-export-job", image_id, job_id])
            .map_err(|err| map_missing(err, ResourceKind::ImageExportJob, job_id))?;
        Ok(ExportJobRecord {
            id: str_field(&value, &["id"])?.to_string(),
            status: str_field(&value, &["status"])?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_messages_map_to_not_found() {
        for message in [
            "Instance not found",
            "code: not_found",
            "The resource cannot be found",
            "status 404",
        ] {
            let err = map_missing(
                BackendError::Api(message.into()),
                ResourceKind::Instance,
                "inst-1",
            );
            assert!(err.is_not_found(), "{message} should map to NotFound");
        }

        let err = map_missing(
            BackendError::Api("quota exceeded".into()),
            ResourceKind::Instance,
            "inst-1",
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn boot_args_cover_every_source() {
        assert_eq!(
            boot_args(&BootDisk::Image("img-1".into())),
            ["--image".to_string(), "img-1".to_string()]
        );
        assert_eq!(
            boot_args(&BootDisk::CatalogOffering("crn:off".into()))[0],
            "--catalog-offering"
        );
        assert_eq!(
            boot_args(&BootDisk::CatalogOfferingVersion("crn:ver".into()))[0],
            "--catalog-offering-version"
        );
        assert_eq!(boot_args(&BootDisk::Volume("vol-1".into()))[0], "--boot-volume");
        assert_eq!(
            boot_args(&BootDisk::Snapshot("snap-1".into()))[0],
            "--source-snapshot"
        );
    }

    #[test]
    fn instance_parsing_reads_nested_and_flat_primary_ip() {
        let nested = json!({
            "id": "inst-1",
            "name": "build-vsi",
            "status": "pending",
            "primary_network_interface": {
                "id": "nic-1",
                "primary_ip": { "address": "10.0.0.5" }
            },
            "boot_volume_attachment": { "volume": { "id": "vol-1" } }
        });
        let record = parse_instance(&nested).unwrap();
        assert_eq!(record.primary_ip, "10.0.0.5");

        let flat = json!({
            "id": "inst-1",
            "name": "build-vsi",
            "status": "pending",
            "primary_network_interface": {
                "id": "nic-1",
                "primary_ipv4_address": "10.0.0.9"
            },
            "boot_volume_attachment": { "volume": { "id": "vol-1" } }
        });
        let record = parse_instance(&flat).unwrap();
        assert_eq!(record.primary_ip, "10.0.0.9");
    }

    #[test]
    fn instance_parsing_rejects_missing_fields() {
        let value = json!({ "id": "inst-1" });
        assert!(parse_instance(&value).is_err());
    }
}
