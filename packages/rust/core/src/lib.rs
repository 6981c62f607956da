//! Core pipeline orchestration and domain logic for larder.
//!
//! This crate runs the staged harvest (Fetch → Enrich → Validate →
//! Revalidate → AssetFetch → Filter) over the stores and collaborators
//! defined in `larder-shared`. [`StageController`] owns checkpointing;
//! [`WorkerPool`] and [`RetryPolicy`] do the per-item work.

pub mod bundle;
pub mod controller;
pub mod enrichment;
pub mod filter;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod rules;
pub mod stage;

pub use controller::{
    Collaborators, RunMode, RunSummary, StageController, StageReport, Stores, stage_status,
};
pub use pool::{WorkOutcome, WorkerPool};
pub use progress::{ProgressReporter, SilentProgress};
pub use retry::{Attempt, ErrorClass, RetryPolicy, classify};
pub use stage::{PipelineState, StageMachine};
