//! Cirrus Bake - VPC machine-image builds from the command line
//!
//! Provisions a transient instance, runs guest setup over SSH, captures the
//! boot volume as a reusable image, and tears the transient resources down
//! again. A chained `export` command ships a captured image to object
//! storage.

mod ssh;
mod ui;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

use anyhow::{bail, Context, Result};
use cirrus_engine::{
    build_pipeline, run_build, run_export, AccessProtocol, Artifact, BuildConfig, CliBackend,
    EngineError, ExportConfig, Exposure, KeyAlgorithm, Provisioner, ResourceBackend, Step, Ui,
};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, Table};
use console::{style, Emoji};
use serde::{Deserialize, Serialize};
use tera::Tera;

use ssh::SshProvisioner;
use ui::ConsoleUi;

static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// Configuration file structure
/// Path: ~/.config/cirrus/bake.toml
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    #[serde(default)]
    build: BuildSection,
    #[serde(default)]
    user_data: UserDataSection,
    #[serde(default)]
    keys: KeysSection,
    #[serde(default)]
    ssh: SshSection,
    #[serde(default)]
    export: ExportSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BuildSection {
    region: Option<String>,
    subnet_id: Option<String>,
    profile: Option<String>,
    resource_group_id: Option<String>,
    security_group_id: Option<String>,
    exposure: Option<String>,
    protocol: Option<String>,
    image_id: Option<String>,
    image_name: Option<String>,
    catalog_offering_crn: Option<String>,
    catalog_offering_version_crn: Option<String>,
    boot_volume_id: Option<String>,
    boot_snapshot_id: Option<String>,
    output_image_name: Option<String>,
    #[serde(default)]
    image_tags: Vec<String>,
    #[serde(default)]
    replicate_regions: Vec<String>,
    encryption_key_crn: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDataSection {
    inline: Option<String>,
    file: Option<PathBuf>,
    template: Option<PathBuf>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeysSection {
    private_key_file: Option<PathBuf>,
    public_key_file: Option<PathBuf>,
    algorithm: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SshSection {
    user: Option<String>,
    port: Option<u16>,
    script: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExportSection {
    region: Option<String>,
    image_id: Option<String>,
    bucket_name: Option<String>,
    bucket_crn: Option<String>,
    format: Option<String>,
    job_name: Option<String>,
    timeout: Option<String>,
}

#[derive(Parser, Debug)]
#[command(
    name = "cirrus-bake",
    version,
    about = "Bake reusable VPC machine images from transient instances"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (global)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a machine image
    Build(BuildArgs),

    /// Export a captured image to object storage
    Export(ExportArgs),

    /// Show the resolved configuration and pipeline
    Show,
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Region (e.g., us-south)
    #[arg(short, long)]
    region: Option<String>,

    /// Subnet the transient instance is placed on
    #[arg(short, long)]
    subnet_id: Option<String>,

    /// Instance profile (e.g., bx2-2x8)
    #[arg(short, long)]
    profile: Option<String>,

    /// Base image id
    #[arg(long)]
    image_id: Option<String>,

    /// Base image name (resolved to an id)
    #[arg(long)]
    image_name: Option<String>,

    /// Name of the captured image
    #[arg(long)]
    output_image_name: Option<String>,

    /// Network exposure
    #[arg(long, value_enum)]
    exposure: Option<ExposureArg>,

    /// Remote-access protocol
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Readiness-wait budget (e.g., "10m")
    #[arg(long)]
    timeout: Option<String>,

    /// Write the artifact (for chained export) to this file
    #[arg(long)]
    artifact_out: Option<PathBuf>,

    /// Show the plan without creating anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    /// Image id to export
    #[arg(long)]
    image_id: Option<String>,

    /// Inherit the image from a build artifact file
    #[arg(long)]
    from_artifact: Option<PathBuf>,

    /// Destination bucket name
    #[arg(long)]
    bucket_name: Option<String>,

    /// Destination bucket CRN
    #[arg(long)]
    bucket_crn: Option<String>,

    /// Export format (qcow2, vhd)
    #[arg(long)]
    format: Option<String>,

    /// Region (with --image-id only)
    #[arg(short, long)]
    region: Option<String>,

    /// Export job name
    #[arg(long)]
    job_name: Option<String>,

    /// Export-wait budget (e.g., "45m")
    #[arg(long)]
    timeout: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExposureArg {
    Public,
    Private,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProtocolArg {
    Ssh,
    Winrm,
}

/// Config path - XDG-style, ~/.config/cirrus/bake.toml
fn config_path() -> PathBuf {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cirrus")
        .join("bake.toml")
}

fn load_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    let path = path.cloned().unwrap_or_else(config_path);

    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    } else {
        Ok(FileConfig::default())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file_config = load_config(args.config.as_ref())?;

    match args.command {
        Commands::Build(build_args) => run_build_command(&build_args, &file_config),
        Commands::Export(export_args) => run_export_command(&export_args, &file_config),
        Commands::Show => run_show(&file_config),
    }
}

fn parse_protocol(value: &str) -> Result<AccessProtocol> {
    match value {
        "ssh" => Ok(AccessProtocol::Ssh),
        "winrm" => Ok(AccessProtocol::Winrm),
        other => bail!("unknown protocol {other:?}, expected \"ssh\" or \"winrm\""),
    }
}

fn parse_exposure(value: &str) -> Result<Exposure> {
    match value {
        "public" => Ok(Exposure::Public),
        "private" => Ok(Exposure::Private),
        other => bail!("unknown exposure {other:?}, expected \"public\" or \"private\""),
    }
}

fn parse_algorithm(value: &str) -> Result<KeyAlgorithm> {
    match value {
        "rsa" => Ok(KeyAlgorithm::Rsa),
        "ed25519" => Ok(KeyAlgorithm::Ed25519),
        other => bail!("unknown key algorithm {other:?}, expected \"rsa\" or \"ed25519\""),
    }
}

/// The user-data payload after template rendering.
enum ResolvedUserData {
    None,
    Inline(String),
    File(PathBuf),
}

/// Resolve the user-data section: inline string, file path, or a tera
/// template rendered with its vars. The three forms are mutually exclusive.
fn resolve_user_data(section: &UserDataSection) -> Result<ResolvedUserData> {
    let set = [
        section.inline.is_some(),
        section.file.is_some(),
        section.template.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if set > 1 {
        bail!("user_data accepts only one of inline, file, or template");
    }

    if let Some(template_path) = &section.template {
        let template = fs::read_to_string(template_path).with_context(|| {
            format!("Failed to read user-data template: {}", template_path.display())
        })?;
        let mut tera = Tera::default();
        tera.add_raw_template("user-data", &template)?;
        let mut context = tera::Context::new();
        for (key, value) in &section.vars {
            context.insert(key, value);
        }
        let rendered = tera
            .render("user-data", &context)
            .context("Failed to render user-data template")?;
        return Ok(ResolvedUserData::Inline(rendered));
    }
    if let Some(inline) = &section.inline {
        return Ok(ResolvedUserData::Inline(inline.clone()));
    }
    if let Some(file) = &section.file {
        return Ok(ResolvedUserData::File(file.clone()));
    }
    Ok(ResolvedUserData::None)
}

/// Warn (without failing) when a cloud-config payload is not valid YAML.
fn lint_cloud_config(payload: &str) {
    if payload.starts_with("#cloud-config")
        && serde_yaml::from_str::<serde_yaml::Value>(payload).is_err()
    {
        eprintln!(
            "{} Warning: user data looks like cloud-config but is not valid YAML",
            style("!").yellow()
        );
    }
}

/// Merge CLI flags, environment, and the config file into an engine
/// configuration. Priority: flags > env > config file.
fn resolve_build_config(args: &BuildArgs, config: &FileConfig) -> Result<BuildConfig> {
    let mut builder = BuildConfig::builder();

    if let Some(region) = args
        .region
        .clone()
        .or_else(|| env::var("CIRRUS_REGION").ok())
        .or_else(|| config.build.region.clone())
    {
        builder = builder.region(region);
    }
    if let Some(subnet) = args
        .subnet_id
        .clone()
        .or_else(|| env::var("CIRRUS_SUBNET_ID").ok())
        .or_else(|| config.build.subnet_id.clone())
    {
        builder = builder.subnet_id(subnet);
    }
    if let Some(profile) = args
        .profile
        .clone()
        .or_else(|| env::var("CIRRUS_PROFILE").ok())
        .or_else(|| config.build.profile.clone())
    {
        builder = builder.profile(profile);
    }
    if let Some(rg) = &config.build.resource_group_id {
        builder = builder.resource_group_id(rg.clone());
    }
    if let Some(sg) = &config.build.security_group_id {
        builder = builder.security_group_id(sg.clone());
    }

    let exposure = match args.exposure {
        Some(ExposureArg::Public) => Exposure::Public,
        Some(ExposureArg::Private) => Exposure::Private,
        None => match &config.build.exposure {
            Some(value) => parse_exposure(value)?,
            None => Exposure::Public,
        },
    };
    let protocol = match args.protocol {
        Some(ProtocolArg::Ssh) => AccessProtocol::Ssh,
        Some(ProtocolArg::Winrm) => AccessProtocol::Winrm,
        None => match &config.build.protocol {
            Some(value) => parse_protocol(value)?,
            None => AccessProtocol::Ssh,
        },
    };
    builder = builder.exposure(exposure).protocol(protocol);

    // Boot source candidates pass through untouched; the engine enforces
    // their mutual exclusion in one report.
    if let Some(id) = args.image_id.clone().or_else(|| config.build.image_id.clone()) {
        builder = builder.image_id(id);
    }
    if let Some(name) = args
        .image_name
        .clone()
        .or_else(|| config.build.image_name.clone())
    {
        builder = builder.image_name(name);
    }
    if let Some(crn) = &config.build.catalog_offering_crn {
        builder = builder.catalog_offering_crn(crn.clone());
    }
    if let Some(crn) = &config.build.catalog_offering_version_crn {
        builder = builder.catalog_offering_version_crn(crn.clone());
    }
    if let Some(id) = &config.build.boot_volume_id {
        builder = builder.boot_volume_id(id.clone());
    }
    if let Some(id) = &config.build.boot_snapshot_id {
        builder = builder.boot_snapshot_id(id.clone());
    }

    match resolve_user_data(&config.user_data)? {
        ResolvedUserData::Inline(data) => {
            lint_cloud_config(&data);
            builder = builder.user_data(data);
        }
        ResolvedUserData::File(path) => builder = builder.user_data_file(path),
        ResolvedUserData::None => {}
    }

    if let Some(path) = &config.keys.private_key_file {
        builder = builder.private_key_file(path.clone());
    }
    if let Some(path) = &config.keys.public_key_file {
        builder = builder.public_key_file(path.clone());
    }
    if let Some(algorithm) = &config.keys.algorithm {
        builder = builder.key_algorithm(parse_algorithm(algorithm)?);
    }

    if let Some(name) = args
        .output_image_name
        .clone()
        .or_else(|| config.build.output_image_name.clone())
    {
        builder = builder.output_image_name(name);
    }
    if !config.build.image_tags.is_empty() {
        builder = builder.image_tags(config.build.image_tags.clone());
    }
    if !config.build.replicate_regions.is_empty() {
        builder = builder.replicate_regions(config.build.replicate_regions.clone());
    }
    if let Some(crn) = &config.build.encryption_key_crn {
        builder = builder.encryption_key_crn(crn.clone());
    }
    if let Some(timeout) = args.timeout.clone().or_else(|| config.build.timeout.clone()) {
        builder = builder.timeout(timeout);
    }

    match builder.build() {
        Ok(resolved) => Ok(resolved),
        Err(EngineError::InvalidConfig(problems)) => {
            eprintln!("{CROSS} Invalid configuration:");
            for problem in &problems {
                eprintln!("  - {problem}");
            }
            eprintln!();
            eprintln!("Config file: {}", style(config_path().display()).cyan());
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

/// Build and run the full image pipeline.
fn run_build_command(args: &BuildArgs, config: &FileConfig) -> Result<()> {
    let resolved = resolve_build_config(args, config)?;

    print_banner();
    print_config_table(&resolved);

    if args.dry_run {
        println!("\n{} Dry run - planned steps:\n", style("i").cyan());
        for (index, step) in build_pipeline(&resolved, None).iter().enumerate() {
            println!("  {:>2}. {}", index + 1, step.name());
        }
        return Ok(());
    }

    let provisioner = ssh_provisioner(&resolved, config);
    let backend: Arc<dyn ResourceBackend> = Arc::new(CliBackend::new(resolved.region.clone()));
    let ui: Arc<dyn Ui> = Arc::new(ConsoleUi::new());

    println!("\n{ROCKET} Starting the build...\n");
    let artifact = run_build(&resolved, backend, ui, provisioner)
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    print_success(&artifact);

    if let Some(path) = &args.artifact_out {
        write_artifact(path, &artifact)?;
        println!("{FOLDER} Artifact written to {}", path.display());
    }
    Ok(())
}

/// An SSH provisioner when the build speaks SSH and a script is configured.
fn ssh_provisioner(
    resolved: &BuildConfig,
    config: &FileConfig,
) -> Option<Arc<dyn Provisioner>> {
    if !matches!(resolved.protocol, AccessProtocol::Ssh) {
        return None;
    }
    let script = config.ssh.script.clone()?;
    let user = config.ssh.user.clone().unwrap_or_else(|| "root".into());
    let port = config.ssh.port.unwrap_or(22);
    Some(Arc::new(SshProvisioner::new(user, port, script)))
}

/// Run the chained export pipeline.
fn run_export_command(args: &ExportArgs, config: &FileConfig) -> Result<()> {
    let mut builder = ExportConfig::builder();

    if let Some(region) = args.region.clone().or_else(|| config.export.region.clone()) {
        builder = builder.region(region);
    }
    if let Some(id) = args
        .image_id
        .clone()
        .or_else(|| config.export.image_id.clone())
    {
        builder = builder.image_id(id);
    }
    if let Some(path) = &args.from_artifact {
        let metadata = read_artifact(path)?;
        builder = builder.inherit(&metadata);
    }
    if let Some(name) = args
        .bucket_name
        .clone()
        .or_else(|| config.export.bucket_name.clone())
    {
        builder = builder.bucket_name(name);
    }
    if let Some(crn) = args
        .bucket_crn
        .clone()
        .or_else(|| config.export.bucket_crn.clone())
    {
        builder = builder.bucket_crn(crn);
    }
    if let Some(format) = args.format.clone().or_else(|| config.export.format.clone()) {
        builder = builder.format(format);
    }
    if let Some(name) = args
        .job_name
        .clone()
        .or_else(|| config.export.job_name.clone())
    {
        builder = builder.job_name(name);
    }
    if let Some(timeout) = args.timeout.clone().or_else(|| config.export.timeout.clone()) {
        builder = builder.timeout(timeout);
    }

    let resolved = match builder.build() {
        Ok(resolved) => resolved,
        Err(EngineError::InvalidConfig(problems)) => {
            eprintln!("{CROSS} Invalid export configuration:");
            for problem in &problems {
                eprintln!("  - {problem}");
            }
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    print_banner();
    println!(
        "\n{GEAR} Exporting image {} ({})\n",
        style(&resolved.image_id).cyan(),
        resolved.format
    );

    let backend: Arc<dyn ResourceBackend> = Arc::new(CliBackend::new(resolved.region.clone()));
    let ui: Arc<dyn Ui> = Arc::new(ConsoleUi::new());
    let artifact =
        run_export(&resolved, backend, ui).map_err(|err| anyhow::anyhow!("{err}"))?;

    println!();
    println!(
        "{CHECK} Export job {} finished.",
        artifact
            .metadata_value("export_job_id")
            .unwrap_or("unknown")
    );
    println!("{SPARKLE} Export complete!");
    Ok(())
}

/// Show the resolved configuration and planned pipeline.
fn run_show(config: &FileConfig) -> Result<()> {
    let args = BuildArgs {
        region: None,
        subnet_id: None,
        profile: None,
        image_id: None,
        image_name: None,
        output_image_name: None,
        exposure: None,
        protocol: None,
        timeout: None,
        artifact_out: None,
        dry_run: true,
    };
    let resolved = resolve_build_config(&args, config)?;
    print_config_table(&resolved);
    println!("\n{} Planned steps:\n", style("▸").blue().bold());
    for (index, step) in build_pipeline(&resolved, None).iter().enumerate() {
        println!("  {:>2}. {}", index + 1, step.name());
    }
    Ok(())
}

/// Artifact file for chaining `build` into `export`.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactFile {
    image_id: String,
    image_name: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn write_artifact(path: &PathBuf, artifact: &Artifact) -> Result<()> {
    let file = ArtifactFile {
        image_id: artifact.image_id.clone(),
        image_name: artifact.image_name.clone(),
        metadata: artifact.metadata.clone(),
    };
    let content = toml::to_string_pretty(&file)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write artifact file: {}", path.display()))
}

fn read_artifact(path: &PathBuf) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact file: {}", path.display()))?;
    let file: ArtifactFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse artifact file: {}", path.display()))?;
    Ok(file.metadata)
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════╗").cyan().bold()
    );
    println!(
        "{}",
        style("║          CIRRUS IMAGE BAKERY          ║").cyan().bold()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════╝").cyan().bold()
    );
}

fn boot_source_label(config: &BuildConfig) -> String {
    use cirrus_engine::BootSource;
    match &config.boot_source {
        BootSource::ImageId(id) => format!("image id {id}"),
        BootSource::ImageName(name) => format!("image name {name}"),
        BootSource::CatalogOffering(crn) => format!("catalog offering {crn}"),
        BootSource::CatalogOfferingVersion(crn) => format!("catalog version {crn}"),
        BootSource::BootVolume(id) => format!("boot volume {id}"),
        BootSource::BootSnapshot(id) => format!("boot snapshot {id}"),
    }
}

fn print_config_table(config: &BuildConfig) {
    println!("\n{} Configuration\n", style("▸").blue().bold());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("Setting").fg(Color::Cyan),
        Cell::new("Value").fg(Color::Cyan),
    ]);

    table.add_row(vec!["Region", &config.region]);
    table.add_row(vec!["Subnet", &config.subnet_id]);
    table.add_row(vec!["Profile", &config.profile]);
    table.add_row(vec!["Boot source", &boot_source_label(config)]);
    table.add_row(vec![
        "Protocol",
        match config.protocol {
            AccessProtocol::Ssh => "ssh",
            AccessProtocol::Winrm => "winrm",
        },
    ]);
    table.add_row(vec![
        "Exposure",
        match config.exposure {
            Exposure::Public => "public",
            Exposure::Private => "private",
        },
    ]);
    table.add_row(vec!["Image name", &config.image_name]);
    table.add_row(vec!["Timeout", &format!("{:?}", config.state_timeout)]);
    if !config.replicate_regions.is_empty() {
        table.add_row(vec![
            "Replicas",
            &config.replicate_regions.join(", "),
        ]);
    }

    println!("{table}");
}

fn print_success(artifact: &Artifact) {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════╗").green().bold()
    );
    println!(
        "{}",
        style("║            IMAGE CAPTURED!            ║").green().bold()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════╝").green().bold()
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.add_row(vec![
        Cell::new("Image ID").fg(Color::Cyan),
        Cell::new(&artifact.image_id),
    ]);
    table.add_row(vec![
        Cell::new("Image name").fg(Color::Cyan),
        Cell::new(&artifact.image_name),
    ]);
    for (key, value) in &artifact.metadata {
        if let Some(region) = key.strip_prefix("replica:") {
            table.add_row(vec![
                Cell::new(format!("Replica ({region})")).fg(Color::Cyan),
                Cell::new(value),
            ]);
        }
    }
    println!("{table}");
    println!();
    println!("{SPARKLE} Build complete!");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence_over_the_config_file() {
        let mut config = FileConfig::default();
        config.build.region = Some("eu-de".into());
        config.build.subnet_id = Some("subnet-file".into());
        config.build.profile = Some("bx2-2x8".into());
        config.build.image_id = Some("img-base".into());

        let args = BuildArgs {
            region: Some("us-south".into()),
            subnet_id: None,
            profile: None,
            image_id: None,
            image_name: None,
            output_image_name: None,
            exposure: None,
            protocol: None,
            timeout: None,
            artifact_out: None,
            dry_run: false,
        };
        let resolved = resolve_build_config(&args, &config).unwrap();
        assert_eq!(resolved.region, "us-south");
        assert_eq!(resolved.subnet_id, "subnet-file");
    }

    #[test]
    fn user_data_template_renders_with_vars() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("user-data.tera");
        fs::write(&template, "#cloud-config\nhostname: {{ host }}\n").unwrap();

        let section = UserDataSection {
            inline: None,
            file: None,
            template: Some(template),
            vars: BTreeMap::from([("host".to_string(), "builder".to_string())]),
        };
        match resolve_user_data(&section).unwrap() {
            ResolvedUserData::Inline(rendered) => {
                assert!(rendered.contains("hostname: builder"));
            }
            _ => panic!("expected inline user data"),
        }
    }

    #[test]
    fn user_data_forms_are_mutually_exclusive() {
        let section = UserDataSection {
            inline: Some("#cloud-config".into()),
            file: Some("/tmp/user-data".into()),
            template: None,
            vars: BTreeMap::new(),
        };
        assert!(resolve_user_data(&section).is_err());
    }

    #[test]
    fn artifact_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.toml");
        let artifact = Artifact {
            image_id: "img-9".into(),
            image_name: "golden".into(),
            metadata: BTreeMap::from([
                ("image_id".to_string(), "img-9".to_string()),
                ("region".to_string(), "us-south".to_string()),
            ]),
        };
        write_artifact(&path, &artifact).unwrap();
        let metadata = read_artifact(&path).unwrap();
        assert_eq!(metadata.get("image_id"), Some(&"img-9".to_string()));
        assert_eq!(metadata.get("region"), Some(&"us-south".to_string()));
    }

    #[test]
    fn protocol_and_exposure_strings_parse() {
        assert!(matches!(parse_protocol("ssh").unwrap(), AccessProtocol::Ssh));
        assert!(matches!(
            parse_protocol("winrm").unwrap(),
            AccessProtocol::Winrm
        ));
        assert!(parse_protocol("telnet").is_err());
        assert!(matches!(parse_exposure("private").unwrap(), Exposure::Private));
        assert!(parse_exposure("lan").is_err());
    }
}
