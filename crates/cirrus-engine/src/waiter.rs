//! Generic remote-resource readiness polling
//!
//! One construct serves every "wait until X" in the pipeline: wait for an
//! instance to run, an address or image to become available, an instance to
//! stop, an export job to succeed. Callers supply the target and failure
//! status sets; the poll loop runs on a background thread and the caller
//! blocks on a single-use channel raced against the timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::{BackendError, ResourceBackend, ResourceKind};
use crate::error::EngineError;
use crate::ui::Ui;

/// What to wait for and for how long.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub kind: ResourceKind,
    pub id: String,
    /// Statuses that complete the wait successfully.
    pub target: &'static [&'static str],
    /// Statuses that fail the wait immediately, without running out the
    /// timeout.
    pub failure: &'static [&'static str],
    pub interval: Duration,
    pub timeout: Duration,
}

/// Wait until `spec.id` reaches a target status, as reported by the
/// backend's status probe.
pub fn wait_for(
    backend: &Arc<dyn ResourceBackend>,
    ui: &Arc<dyn Ui>,
    spec: WaitSpec,
) -> Result<(), EngineError> {
    let poll_backend = Arc::clone(backend);
    let kind = spec.kind;
    let id = spec.id.clone();
    wait_until(move || poll_backend.status(kind, &id), ui, spec)
}

/// Wait until `poll` yields a target status, a failure status, or the
/// timeout elapses.
///
/// The loop is abandoned, not killed, once a result is produced or the
/// deadline passes: a poll in flight at that moment finishes on the
/// background thread and its result is discarded. The thread only ever
/// writes through the single-use channel, never into caller state.
pub fn wait_until<F>(poll: F, ui: &Arc<dyn Ui>, spec: WaitSpec) -> Result<(), EngineError>
where
    F: Fn() -> Result<String, BackendError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<Result<(), EngineError>>(1);
    let stop = Arc::new(AtomicBool::new(false));
    let poll_stop = Arc::clone(&stop);
    let poll_ui = Arc::clone(ui);
    let poll_spec = spec.clone();

    thread::spawn(move || {
        let mut attempts: u64 = 0;
        loop {
            if poll_stop.load(Ordering::Relaxed) {
                return;
            }
            attempts += 1;
            if attempts % 6 == 0 {
                let minutes = attempts * poll_spec.interval.as_secs() / 60;
                poll_ui.say(&format!(
                    "still waiting for {} {} ({minutes}m elapsed)",
                    poll_spec.kind, poll_spec.id
                ));
            } else {
                poll_ui.tick();
            }

            let outcome = match poll() {
                Err(err) => Some(Err(EngineError::Backend(err))),
                Ok(status) if poll_spec.failure.contains(&status.as_str()) => {
                    Some(Err(EngineError::ResourceFailed {
                        kind: poll_spec.kind,
                        id: poll_spec.id.clone(),
                        status,
                    }))
                }
                Ok(status) if poll_spec.target.contains(&status.as_str()) => Some(Ok(())),
                Ok(_) => None,
            };
            if let Some(result) = outcome {
                let _ = tx.send(result);
                return;
            }

            thread::sleep(poll_spec.interval);
        }
    });

    match rx.recv_timeout(spec.timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            stop.store(true, Ordering::Relaxed);
            Err(EngineError::WaitTimeout {
                kind: spec.kind,
                id: spec.id,
                target: spec.target.join("/"),
                timeout: spec.timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => {
            stop.store(true, Ordering::Relaxed);
            Err(EngineError::Step(format!(
                "status poll for {} {} terminated unexpectedly",
                spec.kind, spec.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;
    use crate::testing::RecordingUi;

    fn spec(target: &'static [&'static str], failure: &'static [&'static str]) -> WaitSpec {
        WaitSpec {
            kind: ResourceKind::Instance,
            id: "inst-1".into(),
            target,
            failure,
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(250),
        }
    }

    fn ui() -> Arc<dyn Ui> {
        Arc::new(RecordingUi::default())
    }

    #[test]
    fn returns_ok_when_target_reached() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let result = wait_until(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(if n < 3 { "starting".into() } else { "running".into() })
            },
            &ui(),
            spec(&["running"], &["failed"]),
        );
        assert!(result.is_ok());
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn failure_status_beats_the_timeout() {
        let mut wait = spec(&["running"], &["failed"]);
        wait.timeout = Duration::from_secs(60);
        let started = Instant::now();
        let result = wait_until(|| Ok("failed".into()), &ui(), wait);
        assert!(
            matches!(result, Err(EngineError::ResourceFailed { status, .. }) if status == "failed")
        );
        // Fails fast, long before the configured minute.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn times_out_at_or_after_the_deadline() {
        let started = Instant::now();
        let result = wait_until(|| Ok("pending".into()), &ui(), spec(&["running"], &["failed"]));
        assert!(matches!(result, Err(EngineError::WaitTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn poll_error_surfaces_immediately() {
        let result = wait_until(
            || Err(BackendError::Api("boom".into())),
            &ui(),
            spec(&["running"], &[]),
        );
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[test]
    fn emits_ticks_and_periodic_progress() {
        let recording = Arc::new(RecordingUi::default());
        let sink: Arc<dyn Ui> = Arc::clone(&recording) as Arc<dyn Ui>;
        let mut wait = spec(&["running"], &[]);
        wait.timeout = Duration::from_millis(150);
        let _ = wait_until(|| Ok("pending".into()), &sink, wait);
        // 6 or more attempts in 150ms at a 5ms interval: at least one coarse
        // progress line, the rest ticks.
        assert!(recording.ticks() >= 5);
        assert!(
            recording
                .lines()
                .iter()
                .any(|line| line.contains("still waiting"))
        );
    }

    #[test]
    fn wait_for_polls_the_backend_status() {
        let backend = crate::testing::FakeBackend::new();
        backend.script_status(ResourceKind::Instance, "inst-1", &["starting", "running"]);
        let backend: Arc<dyn ResourceBackend> = Arc::new(backend);
        let result = wait_for(&backend, &ui(), spec(&["running"], &["failed"]));
        assert!(result.is_ok());
    }
}
