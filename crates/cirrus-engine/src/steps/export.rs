//! Chained image export

use std::sync::Arc;
use std::time::Duration;

use super::{Step, StepContext};
use crate::backend::{BucketRef, ExportJobRequest, ResourceKind};
use crate::error::EngineError;
use crate::state::BuildState;
use crate::waiter::{wait_until, WaitSpec};

/// Submits an export job for a previously captured image to an
/// object-storage bucket and polls it to completion. The job either
/// succeeds or fails; nothing to tear down.
pub struct ExportImageStep {
    pub image_id: String,
    pub job_name: String,
    pub bucket: BucketRef,
    pub format: String,
    pub timeout: Duration,
    pub interval: Duration,
}

impl ExportImageStep {
    pub fn new(
        image_id: impl Into<String>,
        job_name: impl Into<String>,
        bucket: BucketRef,
        format: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            job_name: job_name.into(),
            bucket,
            format: format.into(),
            timeout,
            interval: Duration::from_secs(10),
        }
    }
}

impl Step for ExportImageStep {
    fn name(&self) -> &'static str {
        "export-image"
    }

    fn execute(&mut self, cx: &StepContext, state: &mut BuildState) -> Result<(), EngineError> {
        let destination = match &self.bucket {
            BucketRef::Name(name) => name.clone(),
            BucketRef::Crn(crn) => crn.clone(),
        };
        cx.ui.say(&format!(
            "Exporting image {} to {destination} as {} ...",
            self.image_id, self.format
        ));

        let job = cx.backend.create_export_job(&ExportJobRequest {
            name: self.job_name.clone(),
            image_id: self.image_id.clone(),
            bucket: self.bucket.clone(),
            format: self.format.clone(),
        })?;
        cx.ui.say(&format!("Export job submitted: {}", job.id));

        cx.ui.say("Waiting for the export job to SUCCEED...");
        let backend = Arc::clone(&cx.backend);
        let image_id = self.image_id.clone();
        let job_id = job.id.clone();
        wait_until(
            move || backend.export_job(&image_id, &job_id).map(|job| job.status),
            &cx.ui,
            WaitSpec {
                kind: ResourceKind::ImageExportJob,
                id: job.id.clone(),
                target: &["succeeded"],
                failure: &["failed", "deleting"],
                interval: self.interval,
                timeout: self.timeout,
            },
        )?;
        cx.ui.say("Export job succeeded.");

        state.image_id = Some(self.image_id.clone());
        state.export_job_id = Some(job.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, FakeBackend};

    fn step() -> ExportImageStep {
        let mut step = ExportImageStep::new(
            "img-9",
            "cirrus-export-1",
            BucketRef::Name("bucket".into()),
            "qcow2",
            Duration::from_millis(200),
        );
        step.interval = Duration::from_millis(1);
        step
    }

    #[test]
    fn submits_and_waits_until_succeeded() {
        let backend = FakeBackend::new();
        backend.script_status(ResourceKind::ImageExportJob, "job-1", &["running", "succeeded"]);
        let (cx, handles) = test_context(backend);
        let mut state = BuildState::new();

        step().execute(&cx, &mut state).unwrap();

        assert_eq!(state.export_job_id.as_deref(), Some("job-1"));
        assert!(
            handles
                .journal()
                .iter()
                .any(|c| c == "create_export_job:img-9/cirrus-export-1")
        );
    }

    #[test]
    fn failed_and_deleting_jobs_fail_fast() {
        for terminal in ["failed", "deleting"] {
            let backend = FakeBackend::new();
            backend.script_status(ResourceKind::ImageExportJob, "job-1", &[terminal]);
            let (cx, _handles) = test_context(backend);
            let mut state = BuildState::new();

            let mut slow = step();
            slow.timeout = Duration::from_secs(60);
            let err = slow.execute(&cx, &mut state).unwrap_err();
            assert!(
                matches!(err, EngineError::ResourceFailed { ref status, .. } if status == terminal)
            );
        }
    }
}
