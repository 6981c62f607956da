//! Progress callbacks for the stage controller.

use larder_shared::Stage;

use crate::controller::StageReport;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts with `total` items to process.
    fn stage_started(&self, stage: Stage, total: usize);
    /// Called after each committed batch.
    fn batch_committed(&self, stage: Stage, processed: usize, total: usize);
    /// Called when a stage finishes or is interrupted.
    fn stage_finished(&self, report: &StageReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: Stage, _total: usize) {}
    fn batch_committed(&self, _stage: Stage, _processed: usize, _total: usize) {}
    fn stage_finished(&self, _report: &StageReport) {}
}
