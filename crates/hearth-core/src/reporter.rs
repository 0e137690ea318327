//! Reporter trait for dependency injection
//!
//! This trait allows the orchestrator to report progress and status without
//! being coupled to a specific terminal implementation.

use hearth_schema::Artifact;

use crate::orchestrator::Stage;

/// Sink for progress events emitted during an install run.
pub trait Reporter: Send + Sync {
    /// A stage has started.
    fn stage(&self, stage: Stage);

    /// An artifact reached its final location.
    fn installed(&self, artifact: &Artifact);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// The run failed in `stage`.
    fn failed(&self, stage: Stage, reason: &str);

    /// The run finished successfully.
    fn done(&self, artifacts: &[Artifact], elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn stage(&self, stage: Stage) {
        (**self).stage(stage);
    }
    fn installed(&self, artifact: &Artifact) {
        (**self).installed(artifact);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn failed(&self, stage: Stage, reason: &str) {
        (**self).failed(stage, reason);
    }
    fn done(&self, artifacts: &[Artifact], elapsed_secs: f64) {
        (**self).done(artifacts, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn stage(&self, _: Stage) {}
    fn installed(&self, _: &Artifact) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn failed(&self, _: Stage, _: &str) {}
    fn done(&self, _: &[Artifact], _: f64) {}
}
