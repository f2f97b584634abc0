//! Pipeline step definitions
//!
//! Each step pairs a forward action with a reverse action. A step may cache
//! nothing between builds; per-build values live in [`BuildState`]. The set
//! of steps is closed and assembled by the pipeline selector.

mod address;
mod capture;
mod credentials;
mod export;
mod greeting;
mod instance;
mod keypair;
mod provision;
mod reboot;
mod register_key;
mod resolve_image;
mod security_group;
mod session;
mod subnet;
mod wait_instance;

pub use address::AddressStep;
pub use capture::CaptureImageStep;
pub use credentials::CredentialsStep;
pub use export::ExportImageStep;
pub use greeting::GreetingStep;
pub use instance::CreateInstanceStep;
pub use keypair::KeyPairStep;
pub use provision::{ProvisionStep, ProvisionTarget, Provisioner};
pub use reboot::RebootStep;
pub use register_key::RegisterKeyStep;
pub use resolve_image::ResolveImageStep;
pub use security_group::SecurityGroupStep;
pub use session::SessionStep;
pub use subnet::SubnetStep;
pub use wait_instance::WaitInstanceStep;

use std::sync::Arc;

use crate::backend::ResourceBackend;
use crate::error::EngineError;
use crate::state::BuildState;
use crate::ui::Ui;

/// Collaborators shared by every step of a pipeline.
pub struct StepContext {
    pub backend: Arc<dyn ResourceBackend>,
    pub ui: Arc<dyn Ui>,
}

impl StepContext {
    pub fn new(backend: Arc<dyn ResourceBackend>, ui: Arc<dyn Ui>) -> Self {
        Self { backend, ui }
    }
}

/// One unit of orchestration.
pub trait Step {
    /// Short name used in progress and cleanup-warning lines.
    fn name(&self) -> &'static str;

    /// Forward action. An error halts the pipeline and starts the unwind.
    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError>;

    /// Reverse action. Must be safe to call when `execute` never ran,
    /// partially ran, or the resource it created is already gone.
    fn cleanup(&mut self, _cx: &StepContext, _state: &mut BuildState) -> Result<(), EngineError> {
        Ok(())
    }
}
