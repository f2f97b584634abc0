//! Progress output abstraction

/// Sink for human-readable build progress.
///
/// The engine never branches on what the sink does with a line. Implementors
/// must be callable from the readiness waiter's polling thread, hence the
/// `Send + Sync` bound.
pub trait Ui: Send + Sync {
    /// Emit a progress line.
    fn say(&self, line: &str);

    /// Emit an error line.
    fn error(&self, line: &str);

    /// Emit a terse poll tick between progress lines.
    fn tick(&self);
}

/// A [`Ui`] that swallows all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentUi;

impl Ui for SilentUi {
    fn say(&self, _line: &str) {}
    fn error(&self, _line: &str) {}
    fn tick(&self) {}
}
