//! Pipeline runner and selector
//!
//! The runner executes steps strictly in order, halts on the first step
//! error, and then unwinds: cleanup for every step whose execute was
//! invoked, in strict reverse order, never aborted by a cleanup failure.
//! The selector is a pure function from the validated configuration to the
//! ordered step list.

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::backend::ResourceBackend;
use crate::config::{BootSource, BuildConfig, ExportConfig};
use crate::error::EngineError;
use crate::state::BuildState;
use crate::steps::{
    AddressStep, CaptureImageStep, CreateInstanceStep, CredentialsStep, ExportImageStep,
    GreetingStep, KeyPairStep, ProvisionStep, Provisioner, RebootStep, RegisterKeyStep,
    ResolveImageStep, SecurityGroupStep, SessionStep, Step, StepContext, SubnetStep,
    WaitInstanceStep,
};
use crate::config::AccessProtocol;
use crate::ui::Ui;

/// Executes an ordered step sequence with full reverse-order teardown.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
}

impl Runner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Run every step forward, then clean up every step that ran, in
    /// reverse. The reported error is the forward-path error when there is
    /// one; teardown failures become the build error only when teardown is
    /// the only phase that failed.
    pub fn run(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let mut ran = 0;
        let mut halted: Option<EngineError> = None;

        for step in &mut self.steps {
            ran += 1;
            if let Err(err) = step.execute(cx, state) {
                cx.ui.error(&err.to_string());
                state.record_error(&err);
                halted = Some(err);
                break;
            }
        }

        for step in self.steps[..ran].iter_mut().rev() {
            if let Err(err) = step.cleanup(cx, state) {
                let warning = format!("{}: {err}", step.name());
                cx.ui.error(&warning);
                state.warn_cleanup(warning);
            }
        }

        match halted {
            Some(err) => Err(err),
            None if state.cleanup_warnings.is_empty() => Ok(()),
            None => Err(EngineError::Cleanup(state.cleanup_warnings.clone())),
        }
    }
}

/// The ordered step list for an image build.
///
/// Ordering rules the list encodes: resource-creating steps come before any
/// step that reads their identifiers, and teardown dependencies follow from
/// the strict-reverse unwind (the floating IP goes first, the registered key
/// and local key material last, the instance before the key that admitted
/// it).
pub fn build_pipeline(
    config: &BuildConfig,
    provisioner: Option<Arc<dyn Provisioner>>,
) -> Vec<Box<dyn Step>> {
    let mut steps: Vec<Box<dyn Step>> = vec![
        Box::new(GreetingStep::build()),
        Box::new(SessionStep),
        Box::new(SubnetStep::new(
            config.subnet_id.clone(),
            config.security_group_id.clone(),
        )),
        Box::new(KeyPairStep::new(config.key_source.clone())),
        Box::new(RegisterKeyStep::new(
            config.key_name.clone(),
            config.resource_group_id.clone(),
        )),
    ];

    if let BootSource::ImageName(name) = &config.boot_source {
        steps.push(Box::new(ResolveImageStep::new(name.clone())));
    }

    steps.push(Box::new(CreateInstanceStep::new(
        config.instance_name.clone(),
        config.profile.clone(),
        config.subnet_id.clone(),
        config.boot_source.clone(),
        config.user_data.clone(),
        config.resource_group_id.clone(),
        config.state_timeout,
    )));
    steps.push(Box::new(WaitInstanceStep::new(config.state_timeout)));
    steps.push(Box::new(SecurityGroupStep::new(
        config.security_group_id.clone(),
        config.security_group_name.clone(),
        config.protocol.port_range(),
        config.resource_group_id.clone(),
    )));
    steps.push(Box::new(AddressStep::new(
        config.exposure,
        config.floating_ip_name.clone(),
        config.resource_group_id.clone(),
        config.state_timeout,
    )));

    if matches!(config.protocol, AccessProtocol::Winrm) {
        steps.push(Box::new(CredentialsStep));
    }

    steps.push(Box::new(ProvisionStep::new(config.protocol, provisioner)));
    steps.push(Box::new(RebootStep::new(config.state_timeout)));
    steps.push(Box::new(CaptureImageStep::new(
        config.image_name.clone(),
        config.image_tags.clone(),
        config.replicate_regions.clone(),
        config.encryption_key_crn.clone(),
        config.resource_group_id.clone(),
        config.state_timeout,
    )));
    steps
}

/// The (much shorter) step list for a chained image export.
pub fn export_pipeline(config: &ExportConfig) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(GreetingStep::export()),
        Box::new(SessionStep),
        Box::new(ExportImageStep::new(
            config.image_id.clone(),
            config.job_name.clone(),
            config.bucket.clone(),
            config.format.clone(),
            config.timeout,
        )),
    ]
}

/// Run a full image build and hand back its artifact.
pub fn run_build(
    config: &BuildConfig,
    backend: Arc<dyn ResourceBackend>,
    ui: Arc<dyn Ui>,
    provisioner: Option<Arc<dyn Provisioner>>,
) -> Result<Artifact, EngineError> {
    let cx = StepContext::new(backend, ui);
    let mut state = BuildState::new();
    Runner::new(build_pipeline(config, provisioner)).run(&cx, &mut state)?;
    Artifact::from_build(config, &state)
}

/// Run a chained export and hand back its artifact.
pub fn run_export(
    config: &ExportConfig,
    backend: Arc<dyn ResourceBackend>,
    ui: Arc<dyn Ui>,
) -> Result<Artifact, EngineError> {
    let cx = StepContext::new(backend, ui);
    let mut state = BuildState::new();
    Runner::new(export_pipeline(config)).run(&cx, &mut state)?;
    Artifact::from_export(config, &state)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{Exposure, KeyAlgorithm, KeySource};
    use crate::testing::{test_context, FakeBackend};

    /// Probe step journaling execute/cleanup calls into a shared log.
    struct ProbeStep {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_execute: bool,
        fail_cleanup: bool,
    }

    impl ProbeStep {
        fn ok(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Step> {
            Box::new(Self {
                name,
                log: Arc::clone(log),
                fail_execute: false,
                fail_cleanup: false,
            })
        }

        fn failing(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Step> {
            Box::new(Self {
                name,
                log: Arc::clone(log),
                fail_execute: true,
                fail_cleanup: false,
            })
        }

        fn broken_cleanup(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Step> {
            Box::new(Self {
                name,
                log: Arc::clone(log),
                fail_execute: false,
                fail_cleanup: true,
            })
        }
    }

    impl Step for ProbeStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn execute(
            &mut self,
            _cx: &StepContext,
            _state: &mut BuildState,
        ) -> Result<(), EngineError> {
            self.log.lock().unwrap().push(format!("execute:{}", self.name));
            if self.fail_execute {
                return Err(EngineError::Step(format!("{} exploded", self.name)));
            }
            Ok(())
        }

        fn cleanup(
            &mut self,
            _cx: &StepContext,
            _state: &mut BuildState,
        ) -> Result<(), EngineError> {
            self.log.lock().unwrap().push(format!("cleanup:{}", self.name));
            if self.fail_cleanup {
                return Err(EngineError::Step(format!("{} cleanup exploded", self.name)));
            }
            Ok(())
        }
    }

    fn run_probes(steps: Vec<Box<dyn Step>>) -> (Result<(), EngineError>, BuildState) {
        let (cx, _handles) = test_context(FakeBackend::new());
        let mut state = BuildState::new();
        let result = Runner::new(steps).run(&cx, &mut state);
        (result, state)
    }

    #[test]
    fn a_halt_at_step_k_unwinds_exactly_steps_one_through_k_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![
            ProbeStep::ok("a", &log),
            ProbeStep::ok("b", &log),
            ProbeStep::failing("c", &log),
            ProbeStep::ok("d", &log),
        ];
        let (result, state) = run_probes(steps);

        assert!(result.is_err());
        assert!(state.error.as_deref().unwrap().contains("c exploded"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "execute:a",
                "execute:b",
                "execute:c",
                "cleanup:c",
                "cleanup:b",
                "cleanup:a",
            ]
        );
    }

    #[test]
    fn a_clean_run_still_unwinds_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![ProbeStep::ok("a", &log), ProbeStep::ok("b", &log)];
        let (result, _state) = run_probes(steps);

        assert!(result.is_ok());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["execute:a", "execute:b", "cleanup:b", "cleanup:a"]
        );
    }

    #[test]
    fn cleanup_failures_never_abort_the_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![
            ProbeStep::ok("a", &log),
            ProbeStep::broken_cleanup("b", &log),
            ProbeStep::failing("c", &log),
        ];
        let (result, state) = run_probes(steps);

        // The forward error wins; the cleanup failure is an advisory.
        assert!(matches!(result, Err(EngineError::Step(ref msg)) if msg.contains("c exploded")));
        assert_eq!(state.cleanup_warnings.len(), 1);
        assert!(state.cleanup_warnings[0].contains("b cleanup exploded"));
        assert!(log.lock().unwrap().contains(&"cleanup:a".to_string()));
    }

    #[test]
    fn a_teardown_only_failure_is_reported_as_a_cleanup_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![ProbeStep::ok("a", &log), ProbeStep::broken_cleanup("b", &log)];
        let (result, _state) = run_probes(steps);
        assert!(matches!(result, Err(EngineError::Cleanup(_))));
    }

    fn config(protocol: AccessProtocol, boot: fn(crate::config::BuildConfigBuilder) -> crate::config::BuildConfigBuilder) -> BuildConfig {
        boot(BuildConfig::builder()
            .region("us-south")
            .subnet_id("subnet-1")
            .profile("bx2-2x8")
            .protocol(protocol)
            .exposure(Exposure::Public))
        .build()
        .unwrap()
    }

    fn names(steps: &[Box<dyn Step>]) -> Vec<&'static str> {
        steps.iter().map(|step| step.name()).collect()
    }

    #[test]
    fn ssh_image_name_pipeline_has_the_canonical_order() {
        let config = config(AccessProtocol::Ssh, |b| b.image_name("base"));
        let steps = build_pipeline(&config, None);
        assert_eq!(
            names(&steps),
            vec![
                "greeting",
                "session",
                "subnet",
                "key-pair",
                "register-key",
                "resolve-image",
                "instance",
                "wait-instance",
                "security-group",
                "address",
                "provision",
                "reboot",
                "capture-image",
            ]
        );
    }

    #[test]
    fn winrm_pipelines_add_credentials_and_skip_resolution_for_direct_ids() {
        let config = config(AccessProtocol::Winrm, |b| b.image_id("img-base"));
        let steps = build_pipeline(&config, None);
        let names = names(&steps);
        assert!(!names.contains(&"resolve-image"));
        let credentials = names.iter().position(|n| *n == "credentials").unwrap();
        let provision = names.iter().position(|n| *n == "provision").unwrap();
        assert!(credentials < provision);
    }

    #[test]
    fn no_step_participates_twice() {
        let config = config(AccessProtocol::Winrm, |b| b.image_name("base"));
        let steps = build_pipeline(&config, None);
        let mut names = names(&steps);
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn export_pipeline_reuses_session_setup_ahead_of_the_export() {
        let export = ExportConfig::builder()
            .region("us-south")
            .image_id("img-9")
            .bucket_name("bucket")
            .build()
            .unwrap();
        assert_eq!(
            names(&export_pipeline(&export)),
            vec!["greeting", "session", "export-image"]
        );
    }

    #[test]
    fn key_source_configuration_reaches_the_key_step() {
        let config = BuildConfig::builder()
            .region("us-south")
            .subnet_id("subnet-1")
            .profile("bx2-2x8")
            .image_id("img-base")
            .key_algorithm(KeyAlgorithm::Ed25519)
            .build()
            .unwrap();
        assert_eq!(
            config.key_source,
            KeySource::Generate(KeyAlgorithm::Ed25519)
        );
    }
}
