//! Engine error types

use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendError, ResourceKind};

/// Errors produced by the pipeline engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration was rejected before the pipeline started. Every
    /// violated constraint is listed, not just the first.
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    InvalidConfig(Vec<String>),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A step read a value whose producing step has not run. Indicates a
    /// mis-ordered pipeline, not a runtime condition.
    #[error("missing build state: {0} (producing step has not run)")]
    MissingState(&'static str),

    /// A polled resource reported a terminal failure status.
    #[error("{kind} {id} entered status {status:?}")]
    ResourceFailed {
        kind: ResourceKind,
        id: String,
        status: String,
    },

    /// A polled resource never reached the target status in time.
    #[error("timed out after {timeout:?} waiting for {kind} {id} to reach {target}")]
    WaitTimeout {
        kind: ResourceKind,
        id: String,
        target: String,
        timeout: Duration,
    },

    /// A step failed for a reason of its own (local tooling, file access,
    /// inconsistent remote data).
    #[error("{0}")]
    Step(String),

    /// The forward pipeline succeeded but teardown left resources behind.
    #[error("cleanup failed:\n  - {}", .0.join("\n  - "))]
    Cleanup(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
